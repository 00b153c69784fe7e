//! Explicitly loaded configuration.
//!
//! Nothing here is read from ambient global state after startup: the
//! binaries build a [`Layout`], load a [`StorageConfig`] and read the
//! [`RemoteTarget`] from the environment once, then pass the values to the
//! components that need them. `StorageConfig::reload` is the only point at
//! which persisted settings are re-read.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sysinfo::Disks;

use crate::errors::{Error, Result};
use crate::export::ExportFormat;

/// Minimum free space required at the export location.
pub const MIN_FREE_BYTES: u64 = 1024 * 1024;

// ============================================================================
// Directory Layout
// ============================================================================

/// Where everything lives, relative to one root directory.
///
/// The recorder and the sync agent share this layout; the database and the
/// liveness flag in `runtime_dir` are the only files both of them touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.root.join("historical_data").join("archives")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("historical_data").join("logs")
    }

    pub fn version_log(&self) -> PathBuf {
        self.root.join("historical_data").join("version_log.json")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("real_time_monitoring").join("temp")
    }

    pub fn default_db_path(&self) -> PathBuf {
        self.runtime_dir().join("ems.db")
    }

    pub fn sync_state(&self) -> PathBuf {
        self.runtime_dir().join("sync_state.json")
    }

    pub fn recording_flag(&self) -> PathBuf {
        self.runtime_dir().join("recording.lock")
    }

    pub fn storage_config(&self) -> PathBuf {
        self.runtime_dir().join("storage.json")
    }

    /// Create every directory of the layout.
    pub fn prepare(&self) -> Result<()> {
        for dir in [self.archives_dir(), self.logs_dir(), self.runtime_dir()] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Database path: explicit override, then `DB_PATH`, then the layout default.
pub fn resolve_db_path(layout: &Layout, explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| env_non_empty("DB_PATH").map(PathBuf::from))
        .unwrap_or_else(|| layout.default_db_path())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

// ============================================================================
// Storage Settings
// ============================================================================

/// Where per-channel exports are written, and in which format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub save_path: PathBuf,
    pub save_format: ExportFormat,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            save_path: default_save_path(),
            save_format: ExportFormat::Csv,
        }
    }
}

fn default_save_path() -> PathBuf {
    env_non_empty("HOME")
        .or_else(|| env_non_empty("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl StorageConfig {
    /// Load from `path`; a missing or unreadable file yields the defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path)
            .map_err(Error::from)
            .and_then(|s| serde_json::from_str(&s).map_err(Error::from))
        {
            Ok(config) => config,
            Err(e) => {
                warn!("ignoring storage settings at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Re-read persisted settings into `self`.
    pub fn reload(&mut self, path: &Path) {
        *self = Self::load(path);
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The export directory must exist, accept writes and have room.
    pub fn validate(&self) -> Result<()> {
        ensure_writable_dir(&self.save_path)?;
        if let Some(available) = available_space(&self.save_path) {
            if available < MIN_FREE_BYTES {
                return Err(Error::InsufficientSpace {
                    path: self.save_path.clone(),
                    available,
                });
            }
        }
        Ok(())
    }
}

fn ensure_writable_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(Error::InvalidStorage(dir.to_path_buf()));
    }
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let probe = dir.join(format!(".__test_write_{stamp}"));
    fs::write(&probe, b"1").map_err(|_| Error::InvalidStorage(dir.to_path_buf()))?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

/// Free bytes on the filesystem holding `path`, if it can be determined.
fn available_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());
    match disk {
        Some(d) => Some(d.available_space()),
        None => {
            debug!("no mounted disk found for {}", path.display());
            None
        }
    }
}

// ============================================================================
// Polling
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct PollingConfig {
    /// Tick and reader cadence.
    pub interval: Duration,
    /// Steady-state request budget.
    pub read_timeout: Duration,
    /// Bounded wait when stopping a reader.
    pub join_timeout: Duration,
}

impl PollingConfig {
    pub const MIN_INTERVAL: Duration = Duration::from_millis(50);
    pub const MAX_INTERVAL: Duration = Duration::from_millis(5000);

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval: interval.clamp(Self::MIN_INTERVAL, Self::MAX_INTERVAL),
            ..Self::default()
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            read_timeout: crate::reader::READ_TIMEOUT,
            join_timeout: crate::reader::JOIN_TIMEOUT,
        }
    }
}

// ============================================================================
// Remote Target
// ============================================================================

/// The repository exports are pushed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl Default for RemoteTarget {
    fn default() -> Self {
        Self {
            owner: "ems".into(),
            repo: "EMS".into(),
            branch: "main".into(),
        }
    }
}

impl RemoteTarget {
    /// Defaults overridden field by field from `GIT_OWNER`, `GIT_REPO`, `GIT_BRANCH`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            owner: env_non_empty("GIT_OWNER").unwrap_or(defaults.owner),
            repo: env_non_empty("GIT_REPO").unwrap_or(defaults.repo),
            branch: env_non_empty("GIT_BRANCH").unwrap_or(defaults.branch),
        }
    }
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.branch)
    }
}
