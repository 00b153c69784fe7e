//! "Recording is active" signal shared between the recorder and the sync agent.
//!
//! Existence and modification time of one file are the whole contract; its
//! content is irrelevant. The recorder touches it on every tick, and the
//! sync agent treats it as live while it is younger than
//! `max(2 × interval, 15 s)`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::debug;

/// Floor of the freshness window.
pub const MIN_THRESHOLD: Duration = Duration::from_secs(15);

/// Freshness window for a given sync interval.
pub fn threshold_for(interval: Duration) -> Duration {
    (interval * 2).max(MIN_THRESHOLD)
}

#[derive(Debug, Clone)]
pub struct LivenessFlag {
    path: PathBuf,
}

impl LivenessFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the flag or refresh its modification time.
    pub fn touch(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, b"1")
    }

    /// Remove the flag; a missing flag is not an error.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Age of the flag at `now`, or `None` if it does not exist.
    pub fn age_at(&self, now: SystemTime) -> Option<Duration> {
        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok()?;
        // A flag stamped slightly in the future counts as brand new.
        Some(now.duration_since(modified).unwrap_or(Duration::ZERO))
    }

    pub fn is_active_at(&self, now: SystemTime, threshold: Duration) -> bool {
        match self.age_at(now) {
            Some(age) => age < threshold,
            None => {
                debug!("liveness flag {} absent", self.path.display());
                false
            }
        }
    }

    pub fn is_active(&self, threshold: Duration) -> bool {
        self.is_active_at(SystemTime::now(), threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn threshold_has_a_floor() {
        assert_eq!(threshold_for(Duration::from_secs(5)), Duration::from_secs(15));
        assert_eq!(threshold_for(Duration::from_secs(30)), Duration::from_secs(60));
    }

    #[test]
    fn active_only_inside_the_window() {
        let dir = tempdir().unwrap();
        let flag = LivenessFlag::new(dir.path().join("temp").join("recording.lock"));
        let threshold = threshold_for(Duration::from_secs(5));

        assert!(!flag.is_active(threshold));
        flag.touch().unwrap();

        let touched = fs::metadata(flag.path()).unwrap().modified().unwrap();
        assert!(flag.is_active_at(touched + Duration::from_secs(14), threshold));
        assert!(!flag.is_active_at(touched + Duration::from_secs(16), threshold));
    }

    #[test]
    fn stale_flag_is_inactive() {
        let dir = tempdir().unwrap();
        let flag = LivenessFlag::new(dir.path().join("recording.lock"));
        flag.touch().unwrap();

        let stale = SystemTime::now() - Duration::from_secs(120);
        File::options()
            .write(true)
            .open(flag.path())
            .unwrap()
            .set_modified(stale)
            .unwrap();

        assert!(!flag.is_active(threshold_for(Duration::from_secs(1))));
    }

    #[test]
    fn clearing_twice_is_fine() {
        let dir = tempdir().unwrap();
        let flag = LivenessFlag::new(dir.path().join("recording.lock"));
        flag.touch().unwrap();
        flag.clear().unwrap();
        flag.clear().unwrap();
        assert!(flag.age_at(SystemTime::now()).is_none());
    }
}
