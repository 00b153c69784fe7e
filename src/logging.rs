use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Once;

use env_logger::Target;

static LOG_ONCE: Once = Once::new();

/// Size at which a log file is rotated when logging starts.
pub const MAX_LOG_BYTES: u64 = 512_000;

/// Rotated files kept next to the live one (`sync.log.1` .. `sync.log.3`).
pub const LOG_BACKUPS: usize = 3;

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// Append to this file, rotating it first if it grew too large.
    File(PathBuf),
}

const DEFAULT_FILTER: &str = "info";

/// Filter directives from `EMS_LOG`, else `RUST_LOG`, else `info`.
///
/// Blank values count as unset. The chosen string is passed through whole,
/// so module directives such as `rs485_archiver::sync=debug` work in both.
fn filter_from(ems: Option<String>, rust: Option<String>) -> String {
    ems.into_iter()
        .chain(rust)
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

fn env_filter() -> String {
    filter_from(std::env::var("EMS_LOG").ok(), std::env::var("RUST_LOG").ok())
}

/// Initialize logging based on `EMS_LOG`/`RUST_LOG`. Later calls are no-ops.
///
/// If the log file cannot be opened, logging falls back to stderr.
pub fn init_logging(target: LogTarget) {
    let filters = env_filter();
    LOG_ONCE.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder
            .parse_filters(&filters)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false);

        let mut fallback = None;
        if let LogTarget::File(path) = &target {
            match open_rotated(path, MAX_LOG_BYTES, LOG_BACKUPS) {
                Ok(file) => {
                    builder.target(Target::Pipe(Box::new(file)));
                }
                Err(e) => fallback = Some((path.clone(), e)),
            }
        }
        if builder.try_init().is_err() {
            return;
        }

        if let Some((path, e)) = fallback {
            log::warn!("cannot log to {}: {}; using stderr", path.display(), e);
        }
    });
}

fn open_rotated(path: &Path, max_bytes: u64, backups: usize) -> io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    rotate(path, max_bytes, backups)?;
    OpenOptions::new().create(true).append(true).open(path)
}

/// Shift `path` to `path.1` (and older backups up by one) once it reaches
/// `max_bytes`. The oldest backup beyond `backups` is dropped.
pub fn rotate(path: &Path, max_bytes: u64, backups: usize) -> io::Result<bool> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size < max_bytes {
        return Ok(false);
    }
    if backups == 0 {
        fs::remove_file(path)?;
        return Ok(true);
    }
    let oldest = backup_path(path, backups);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..backups).rev() {
        let from = backup_path(path, n);
        if from.exists() {
            fs::rename(&from, backup_path(path, n + 1))?;
        }
    }
    fs::rename(path, backup_path(path, 1))?;
    Ok(true)
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}
