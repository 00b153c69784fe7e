//! Headless recording control surface.
//!
//! [`Recorder`] owns every [`Channel`] by id and implements the operator
//! actions (start, stop, reset, close) plus the periodic tick. Presentation
//! layers hold a `ChannelId` and poll the channel's state; they never own
//! channel state themselves.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use log::{debug, error, info, warn};

use crate::channel::{Channel, ChannelId, ChannelMode, ChannelSettings};
use crate::config::{PollingConfig, StorageConfig};
use crate::errors::{Error, Result};
use crate::export::export_records;
use crate::liveness::LivenessFlag;
use crate::reader::JoinOutcome;
use crate::record::Record;
use crate::scanner::{self, PortScan, ScanOptions};
use crate::store::RecordStore;
use crate::transport::PortOpener;

/// What a stop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub join: JoinOutcome,
    /// The export written for the drained buffer, if it was non-empty.
    pub export: Option<PathBuf>,
}

pub struct Recorder {
    opener: Box<dyn PortOpener>,
    storage: StorageConfig,
    polling: PollingConfig,
    db_path: PathBuf,
    store: Option<RecordStore>,
    flag: LivenessFlag,
    channels: BTreeMap<ChannelId, Channel>,
    next_id: u32,
}

impl Recorder {
    pub fn new(
        opener: Box<dyn PortOpener>,
        storage: StorageConfig,
        polling: PollingConfig,
        db_path: impl Into<PathBuf>,
        flag: LivenessFlag,
    ) -> Self {
        Self {
            opener,
            storage,
            polling,
            db_path: db_path.into(),
            store: None,
            flag,
            channels: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    /// Replace the export settings, e.g. after the operator edited them.
    pub fn set_storage(&mut self, storage: StorageConfig) {
        self.storage = storage;
    }

    pub fn polling(&self) -> &PollingConfig {
        &self.polling
    }

    /// Change the tick and polling cadence, clamped to the supported range.
    ///
    /// Running readers pick the new value up without a restart. Returns the
    /// interval actually applied.
    pub fn set_interval(&mut self, interval: Duration) -> Duration {
        let interval = interval.clamp(PollingConfig::MIN_INTERVAL, PollingConfig::MAX_INTERVAL);
        self.polling.interval = interval;
        for channel in self.channels.values_mut() {
            channel.set_interval(interval);
        }
        info!("polling interval set to {:?}", interval);
        interval
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn add_channel(&mut self, settings: ChannelSettings) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        debug!("channel {} added as {}", settings.name, id);
        self.channels.insert(id, Channel::new(id, settings));
        id
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Mutable access for editing settings while a channel is idle.
    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn any_running(&self) -> bool {
        self.channels.values().any(Channel::is_running)
    }

    fn lookup(&mut self, id: ChannelId) -> Result<&mut Channel> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| Error::Config(format!("no channel {id}")))
    }

    /// Validate the export location, then connect the channel.
    pub fn start(&mut self, id: ChannelId) -> Result<ChannelMode> {
        self.storage.validate()?;
        let polling = self.polling;
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or_else(|| Error::Config(format!("no channel {id}")))?;
        channel.start(self.opener.as_ref(), &polling)
    }

    /// Stop one channel and export its buffer.
    ///
    /// The buffer is drained only once the export succeeded, so a failed
    /// export can be retried by the next stop or by `close`.
    pub fn stop(&mut self, id: ChannelId) -> Result<StopReport> {
        let join_timeout = self.polling.join_timeout;
        let storage = self.storage.clone();
        let channel = self.lookup(id)?;
        let join = channel.stop(join_timeout);
        let export = export_buffer(channel, &storage);
        self.refresh_flag();
        Ok(StopReport {
            join,
            export: export?,
        })
    }

    /// Stop one channel, export its buffer and forget it.
    ///
    /// If the export fails the channel stays registered, stopped and with
    /// its buffer intact.
    pub fn remove_channel(&mut self, id: ChannelId) -> Result<StopReport> {
        let report = self.stop(id)?;
        if let Some(channel) = self.channels.remove(&id) {
            debug!("channel {} ({}) removed", channel.name(), id);
        }
        self.refresh_flag();
        Ok(report)
    }

    /// Stop one channel and discard everything it buffered.
    pub fn reset(&mut self, id: ChannelId) -> Result<JoinOutcome> {
        let join_timeout = self.polling.join_timeout;
        let outcome = self.lookup(id)?.reset(join_timeout);
        self.refresh_flag();
        Ok(outcome)
    }

    /// One tick for a running channel: buffer a record and persist it.
    ///
    /// Returns `None` for a channel that is not running.
    pub fn tick(&mut self, id: ChannelId) -> Option<Record> {
        let channel = self.channels.get_mut(&id)?;
        if !channel.is_running() {
            return None;
        }
        let record = channel.record_tick(Local::now());
        self.persist(&record);
        if let Err(e) = self.flag.touch() {
            warn!("failed to touch {}: {}", self.flag.path().display(), e);
        }
        Some(record)
    }

    /// Tick every running channel, in id order.
    pub fn tick_running(&mut self) -> Vec<Record> {
        let ids: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|c| c.is_running())
            .map(Channel::id)
            .collect();
        ids.into_iter().filter_map(|id| self.tick(id)).collect()
    }

    /// Best-effort insert. Failures are logged and the sample stays buffered.
    fn persist(&mut self, record: &Record) {
        if self.store.is_none() {
            match RecordStore::open(&self.db_path) {
                Ok(store) => self.store = Some(store),
                Err(e) => {
                    warn!("record store unavailable: {}", e);
                    return;
                }
            }
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.insert(record) {
                warn!("insert into {} failed: {}", store.path().display(), e);
                // Reopen on the next tick in case the file was replaced.
                self.store = None;
            }
        }
    }

    /// Stop every channel, export every non-empty buffer and drop the flag.
    ///
    /// All channels are processed even if one export fails; the first
    /// failure is returned.
    pub fn close(&mut self) -> Result<Vec<PathBuf>> {
        let join_timeout = self.polling.join_timeout;
        let storage = self.storage.clone();
        let mut written = Vec::new();
        let mut first_error = None;

        for channel in self.channels.values_mut() {
            channel.stop(join_timeout);
            match export_buffer(channel, &storage) {
                Ok(Some(path)) => written.push(path),
                Ok(None) => {}
                Err(e) => {
                    error!("export of {} failed: {}", channel.name(), e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Err(e) = self.flag.clear() {
            warn!("failed to remove {}: {}", self.flag.path().display(), e);
        }
        self.store = None;
        info!("recorder closed, {} export(s) written", written.len());

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Interactive per-port address discovery.
    pub fn scan_addresses(&self, port: &str, options: &ScanOptions) -> Vec<u8> {
        scanner::scan(self.opener.as_ref(), port, options)
    }

    /// Parallel "anything there?" sweep over `ports`.
    pub fn pre_scan(&self, ports: &[String], options: &ScanOptions) -> Vec<PortScan> {
        scanner::pre_scan(self.opener.as_ref(), ports, options)
    }

    fn refresh_flag(&self) {
        if self.any_running() {
            return;
        }
        if let Err(e) = self.flag.clear() {
            warn!("failed to remove {}: {}", self.flag.path().display(), e);
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.any_running() {
            let _ = self.flag.clear();
        }
    }
}

/// Export and drain a non-empty buffer after re-checking the export location.
fn export_buffer(channel: &mut Channel, storage: &StorageConfig) -> Result<Option<PathBuf>> {
    if channel.records().is_empty() {
        return Ok(None);
    }
    storage.validate()?;
    let path = export_records(
        &storage.save_path,
        channel.name(),
        channel.records(),
        storage.save_format,
        Local::now(),
    )?;
    channel.take_records();
    Ok(Some(path))
}
