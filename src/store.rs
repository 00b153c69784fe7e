//! Append-only SQLite log of recorded samples.
//!
//! The recorder is the only writer; the sync agent reads the same file from
//! another process. Cross-process access relies on SQLite's own locking (WAL
//! journal plus a busy timeout), not on any lock of ours.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use rusqlite::{params, Connection, OpenFlags, Transaction};

use crate::errors::{Error, Result, SyncError};
use crate::record::{normalize_timestamp, Record};

const CURRENT_SCHEMA_VERSION: i32 = 2;

/// How long a statement waits on the other process's lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One row of the `records` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: i64,
    pub ts: String,
    pub data: String,
}

pub struct RecordStore {
    conn: Connection,
    path: PathBuf,
}

impl RecordStore {
    /// Open (creating if needed) the store at `path` for appending.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        configure(&conn)?;
        run_migrations(&mut conn)?;
        info!("record store opened at {}", path.display());
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing store for reading; a missing file is a sync error.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SyncError::MissingDatabase(path.to_path_buf()).into());
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; returns its row id.
    ///
    /// `ts` is stored in UTC whatever offset `record.time` carries.
    pub fn insert(&self, record: &Record) -> Result<i64> {
        let data = serde_json::to_string(&record.payload())?;
        let ts = normalize_timestamp(&record.time).unwrap_or_else(|| record.time.clone());
        self.conn.execute(
            "INSERT INTO records (ts, data) VALUES (?1, ?2)",
            params![ts, data],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Rows with `ts` strictly after `since` (all rows when `None`), oldest first.
    pub fn rows_since(&self, since: Option<&str>) -> Result<Vec<StoredRow>> {
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<StoredRow> {
            Ok(StoredRow {
                id: row.get(0)?,
                ts: row.get(1)?,
                data: row.get(2)?,
            })
        };
        let mut stmt = self.conn.prepare(
            "SELECT id, ts, data FROM records
             WHERE ?1 IS NULL OR ts > ?1
             ORDER BY ts ASC, id ASC",
        )?;
        let since = since.map(|s| normalize_timestamp(s).unwrap_or_else(|| s.to_string()));
        let rows = stmt
            .query_map(params![since], map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug!("{} row(s) after {:?}", rows.len(), since);
        Ok(rows)
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?)
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        warn!("failed to enable WAL mode: {err}");
    }
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(Error::Config(format!(
            "database version ({version}) is newer than supported schema ({CURRENT_SCHEMA_VERSION})"
        )));
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    while version < CURRENT_SCHEMA_VERSION {
        version += 1;
        apply_migration(&tx, version)?;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<()> {
    match version {
        1 => tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 ts TEXT NOT NULL,
                 data TEXT NOT NULL
             );",
        )?,
        2 => tx.execute_batch("CREATE INDEX IF NOT EXISTS idx_records_ts ON records (ts);")?,
        other => {
            return Err(Error::Config(format!("no migration to schema version {other}")));
        }
    }
    Ok(())
}
