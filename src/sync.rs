//! The sync agent: moves new store rows into dated archive files and
//! publishes them.
//!
//! Each pass reads rows newer than the persisted watermark, appends them to
//! `archives/YYYY-MM-DD.csv` (one file per calendar date, oldest rows
//! first), commits and pushes the touched files and finally moves the
//! watermark to "now". The watermark moves even when the push fails, so a
//! batch that never reached the remote is not retried.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate, SecondsFormat, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{Layout, RemoteTarget};
use crate::errors::Result;
use crate::export::write_atomically;
use crate::liveness::{threshold_for, LivenessFlag};
use crate::record::{now_timestamp, partition_date};
use crate::store::{RecordStore, StoredRow};
use crate::vcs::VersionControl;

/// Default pause between two passes of `run_forever`.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

const DATED_HEADER: [&str; 3] = ["id", "ts", "data"];

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Recording is not active; nothing was looked at.
    Idle,
    NoNewRecords,
    Synced {
        records: usize,
        /// Archive files touched, relative to the layout root.
        files: Vec<PathBuf>,
        /// Whether the files were committed (the push may still have failed).
        committed: bool,
    },
}

/// Persisted watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_sync: Option<String>,
}

impl SyncState {
    /// A missing or unreadable state file means "never synced".
    pub fn load(path: &Path) -> Self {
        let Ok(text) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&text) {
            Ok(state) => state,
            Err(e) => {
                warn!("ignoring unreadable sync state {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(self)?;
        write_atomically(path, |out| out.write_all(&json))?;
        Ok(())
    }
}

/// One entry of `version_log.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub timestamp: String,
    pub changed_files: Vec<String>,
    pub summary: String,
}

/// Append `entry` to the JSON array at `path`; an unreadable log starts over.
pub fn append_version_entry(path: &Path, entry: VersionEntry) -> Result<()> {
    let mut entries: Vec<VersionEntry> = match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("version log {} unreadable, starting a new one: {}", path.display(), e);
            Vec::new()
        }),
        Err(_) => Vec::new(),
    };
    entries.push(entry);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&entries)?;
    write_atomically(path, |out| out.write_all(json.as_bytes()))?;
    Ok(())
}

pub struct SyncService {
    layout: Layout,
    db_path: PathBuf,
    interval: Duration,
    remote: RemoteTarget,
    vcs: Box<dyn VersionControl>,
    flag: LivenessFlag,
}

impl SyncService {
    pub fn new(
        layout: Layout,
        db_path: impl Into<PathBuf>,
        interval: Duration,
        remote: RemoteTarget,
        vcs: Box<dyn VersionControl>,
    ) -> Self {
        let flag = LivenessFlag::new(layout.recording_flag());
        Self {
            layout,
            db_path: db_path.into(),
            interval,
            remote,
            vcs,
            flag,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the recorder touched its flag recently enough.
    pub fn is_recording(&self) -> bool {
        self.flag.is_active(threshold_for(self.interval))
    }

    pub fn last_sync(&self) -> Option<String> {
        SyncState::load(&self.layout.sync_state()).last_sync
    }

    /// One ungated pass.
    pub fn run_once(&mut self) -> Result<SyncOutcome> {
        let since = self.last_sync();
        let store = RecordStore::open_existing(&self.db_path)?;
        let rows = store.rows_since(since.as_deref())?;
        drop(store);

        if rows.is_empty() {
            info!("no new records");
            return Ok(SyncOutcome::NoNewRecords);
        }

        let files = write_dated_exports(&self.layout, &rows)?;
        let committed = self.commit_and_push(&files);

        let state = SyncState {
            last_sync: Some(now_timestamp()),
        };
        if let Err(e) = state.save(&self.layout.sync_state()) {
            error!("saving sync state failed: {}", e);
        }

        info!("synced {} records", rows.len());
        Ok(SyncOutcome::Synced {
            records: rows.len(),
            files,
            committed,
        })
    }

    /// A pass that only runs while recording is active.
    pub fn run_gated(&mut self) -> Result<SyncOutcome> {
        if !self.is_recording() {
            info!("idle: recording not active, skip");
            return Ok(SyncOutcome::Idle);
        }
        self.run_once()
    }

    /// Gated passes every `interval` until `token` is cancelled.
    ///
    /// A failing pass is logged and the loop carries on.
    pub fn run_forever(&mut self, token: &CancellationToken) {
        info!(
            "sync agent running every {:?}, target {}",
            self.interval, self.remote
        );
        while !token.is_cancelled() {
            if let Err(e) = self.run_gated() {
                error!("sync pass failed: {}", e);
            }
            sleep_until_cancelled(self.interval, token);
        }
        info!("sync agent stopped");
    }

    /// Stage, commit and push `files`. Returns whether the commit happened.
    ///
    /// The version log only records committed batches; a failed push is
    /// logged and does not suppress the entry.
    fn commit_and_push(&mut self, files: &[PathBuf]) -> bool {
        if files.is_empty() {
            return false;
        }
        if let Err(e) = self.vcs.add(files) {
            warn!("{}", e);
            return false;
        }
        let message = format!("sync: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
        if let Err(e) = self.vcs.commit(&message) {
            warn!("{}", e);
            return false;
        }
        if let Err(e) = self.vcs.push(&self.remote) {
            warn!("push to {} failed: {}", self.remote, e);
        }

        let entry = VersionEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            changed_files: files.iter().map(|p| slash_path(p)).collect(),
            summary: format!("synced {} file(s)", files.len()),
        };
        if let Err(e) = append_version_entry(&self.layout.version_log(), entry) {
            warn!("version log update failed: {}", e);
        }
        true
    }
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn sleep_until_cancelled(total: Duration, token: &CancellationToken) {
    let deadline = Instant::now() + total;
    while !token.is_cancelled() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(Duration::from_millis(100)));
    }
}

/// Append `rows` (already in timestamp order) to their dated archive files.
///
/// Returns the touched files relative to the layout root, in date order.
pub fn write_dated_exports(layout: &Layout, rows: &[StoredRow]) -> Result<Vec<PathBuf>> {
    let mut by_date: BTreeMap<NaiveDate, Vec<&StoredRow>> = BTreeMap::new();
    for row in rows {
        let date = partition_date(&row.ts).unwrap_or_else(|| {
            warn!("row {} has unparseable timestamp '{}'", row.id, row.ts);
            Local::now().date_naive()
        });
        by_date.entry(date).or_default().push(row);
    }

    let dir = layout.archives_dir();
    fs::create_dir_all(&dir)?;

    let mut touched = Vec::with_capacity(by_date.len());
    for (date, rows) in by_date {
        let name = format!("{}.csv", date.format("%Y-%m-%d"));
        append_dated(&dir.join(&name), &rows)?;
        let relative = dir
            .strip_prefix(&layout.root)
            .map(|d| d.join(&name))
            .unwrap_or_else(|_| dir.join(&name));
        touched.push(relative);
    }
    Ok(touched)
}

/// Stage `rows` in `<path>.tmp`, then rename it into place or append it.
fn append_dated(path: &Path, rows: &[&StoredRow]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = stage_and_merge(path, &tmp, rows);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn stage_and_merge(path: &Path, tmp: &Path, rows: &[&StoredRow]) -> Result<()> {
    let exists = path.exists();
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_path(tmp)?;
        if !exists {
            writer.write_record(DATED_HEADER)?;
        }
        for row in rows {
            let id = row.id.to_string();
            writer.write_record([id.as_str(), row.ts.as_str(), row.data.as_str()])?;
        }
        writer.flush()?;
    }

    if exists {
        let mut staged = File::open(tmp)?;
        let mut out = OpenOptions::new().append(true).open(path)?;
        io::copy(&mut staged, &mut out)?;
        out.sync_all()?;
        fs::remove_file(tmp)?;
    } else {
        fs::rename(tmp, path)?;
    }
    Ok(())
}
