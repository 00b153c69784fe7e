//! Per-sensor-pair connection and polling state.
//!
//! ```text
//! Idle ──start──▶ Connecting ──▶ Connected (reader running)
//!                      └───────▶ Offline   (no reader, port closed)
//! Connected | Offline ──stop/reset──▶ Idle (reset) / unchanged mode (stop)
//! ```
//!
//! Read failures after connecting never move a channel to `Offline`; the
//! affected quantity simply reads as absent until the operator stops or
//! resets the channel.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::PollingConfig;
use crate::errors::{Error, Result};
use crate::reader::{JoinOutcome, PollInterval, Reader, ReaderConfig, Sample, SampleCell};
use crate::record::Record;
use crate::rtu;
use crate::transport::{read_sensor, PortOpener, Transport};

// ============================================================================
// Identity and Addresses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address selection for one sensor of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensorAddress {
    /// Nothing selected yet.
    #[default]
    Unassigned,
    /// The operator declared there is no such sensor on this line.
    NotInstalled,
    Slave(u8),
}

impl SensorAddress {
    pub fn slave(self) -> Option<u8> {
        match self {
            SensorAddress::Slave(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn try_slave(addr: u8) -> Result<Self> {
        if rtu::SLAVE_ADDRESSES.contains(&addr) {
            Ok(SensorAddress::Slave(addr))
        } else {
            Err(Error::Config(format!("slave address {addr} outside 1..=247")))
        }
    }
}

impl FromStr for SensorAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "-" => Ok(SensorAddress::Unassigned),
            "none" | "absent" => Ok(SensorAddress::NotInstalled),
            text => {
                let addr: u8 = text
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid slave address '{s}'")))?;
                SensorAddress::try_slave(addr)
            }
        }
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelMode {
    #[default]
    Idle,
    Connecting,
    Connected,
    Offline,
}

/// Operator-facing status of one sensor, derived at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensorStatus {
    #[default]
    Unchecked,
    Connected,
    Unconfigured,
    NotInstalled,
    Offline,
}

/// Operator-entered description of a channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelSettings {
    pub name: String,
    pub shift: String,
    pub work_order: String,
    pub port: String,
    pub temperature: SensorAddress,
    pub current: SensorAddress,
}

// ============================================================================
// Channel
// ============================================================================

pub struct Channel {
    id: ChannelId,
    pub settings: ChannelSettings,
    mode: ChannelMode,
    running: bool,
    started_at: Option<DateTime<Local>>,
    temperature_status: SensorStatus,
    current_status: SensorStatus,
    cell: Arc<SampleCell>,
    interval: PollInterval,
    reader: Option<Reader>,
    transport: Option<Box<dyn Transport>>,
    records: Vec<Record>,
}

impl Channel {
    pub fn new(id: ChannelId, settings: ChannelSettings) -> Self {
        Self {
            id,
            settings,
            mode: ChannelMode::Idle,
            running: false,
            started_at: None,
            temperature_status: SensorStatus::Unchecked,
            current_status: SensorStatus::Unchecked,
            cell: Arc::new(SampleCell::new()),
            interval: PollInterval::default(),
            reader: None,
            transport: None,
            records: Vec::new(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Whether the periodic tick is active for this channel.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some() || self.reader.is_some()
    }

    pub fn sensor_status(&self) -> (SensorStatus, SensorStatus) {
        (self.temperature_status, self.current_status)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Pause between polling rounds; applies to a running reader too.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval.set(interval);
    }

    pub fn interval(&self) -> Duration {
        self.interval.get()
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    /// Time since `start`, zero when idle.
    pub fn elapsed(&self) -> Duration {
        self.started_at
            .and_then(|t| (Local::now() - t).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Latest published sample; nothing is published unless connected.
    pub fn sample(&self) -> Sample {
        if self.mode == ChannelMode::Connected {
            self.cell.load()
        } else {
            Sample::default()
        }
    }

    /// Connect and begin running. A running channel is left untouched.
    ///
    /// Connect-time failures are not errors: they leave the channel
    /// `Offline` (and running, so ticks keep recording defaults).
    pub fn start(&mut self, opener: &dyn PortOpener, polling: &PollingConfig) -> Result<ChannelMode> {
        if self.running {
            debug!("{} already running", self.name());
            return Ok(self.mode);
        }

        if let Some(mut stale) = self.transport.take() {
            let _ = stale.close();
        }

        self.mode = ChannelMode::Connecting;
        info!("{} connecting on '{}'", self.name(), self.settings.port);
        let connected = match opener.open(&self.settings.port) {
            Ok(mut transport) => {
                if self.probe(transport.as_mut(), polling.read_timeout) {
                    Some(transport)
                } else {
                    let _ = transport.close();
                    None
                }
            }
            Err(e) => {
                warn!("{}: {}", self.name(), e);
                None
            }
        };

        match connected {
            Some(transport) => {
                self.cell.clear();
                self.interval.set(polling.interval);
                let spawned = Reader::spawn(
                    self.name(),
                    transport,
                    ReaderConfig {
                        temperature_slave: self.settings.temperature.slave(),
                        current_slave: self.settings.current.slave(),
                        interval: self.interval.clone(),
                        timeout: polling.read_timeout,
                    },
                    self.cell.clone(),
                    CancellationToken::new(),
                );
                let reader = match spawned {
                    Ok(reader) => reader,
                    Err(e) => {
                        warn!("{}: cannot start reader: {}", self.name(), e);
                        self.mark_offline();
                        return Err(e);
                    }
                };
                self.reader = Some(reader);
                self.mode = ChannelMode::Connected;
                self.temperature_status = match self.settings.temperature {
                    SensorAddress::Slave(_) => SensorStatus::Connected,
                    _ => SensorStatus::Unconfigured,
                };
                self.current_status = match self.settings.current {
                    SensorAddress::Slave(_) => SensorStatus::Connected,
                    SensorAddress::NotInstalled => SensorStatus::NotInstalled,
                    SensorAddress::Unassigned => SensorStatus::Unconfigured,
                };
            }
            None => self.mark_offline(),
        }

        self.running = true;
        self.started_at = Some(Local::now());
        info!("{} {:?}", self.name(), self.mode);
        Ok(self.mode)
    }

    /// No reader and no port; the sensors that could have answered are offline.
    fn mark_offline(&mut self) {
        self.mode = ChannelMode::Offline;
        self.temperature_status = SensorStatus::Offline;
        self.current_status = match self.settings.current {
            SensorAddress::NotInstalled => SensorStatus::NotInstalled,
            _ => SensorStatus::Offline,
        };
    }

    /// One read of the temperature sensor, else of the current sensor.
    fn probe(&self, transport: &mut dyn Transport, timeout: Duration) -> bool {
        let candidates = [self.settings.temperature.slave(), self.settings.current.slave()];
        for slave in candidates.into_iter().flatten() {
            match read_sensor(transport, slave, timeout) {
                Ok(_) => return true,
                Err(e) => debug!("{}: connect probe of slave {} failed: {}", self.name(), slave, e),
            }
        }
        false
    }

    /// Stop ticking and cancel the reader, waiting at most `join_timeout`.
    pub fn stop(&mut self, join_timeout: Duration) -> JoinOutcome {
        self.running = false;
        let Some(reader) = self.reader.take() else {
            return JoinOutcome::NotRunning;
        };
        let (outcome, transport) = reader.stop(join_timeout);
        if transport.is_some() {
            self.transport = transport;
        }
        outcome
    }

    /// Stop, then drop the buffer, the transport and all derived state.
    pub fn reset(&mut self, join_timeout: Duration) -> JoinOutcome {
        let outcome = self.stop(join_timeout);
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                debug!("{}: close failed: {}", self.name(), e);
            }
        }
        self.records.clear();
        self.cell.clear();
        self.mode = ChannelMode::Idle;
        self.started_at = None;
        self.temperature_status = SensorStatus::Unchecked;
        self.current_status = SensorStatus::Unchecked;
        outcome
    }

    /// Build this tick's record from the latest sample and buffer it.
    pub fn record_tick(&mut self, at: DateTime<Local>) -> Record {
        let s = &self.settings;
        let record = Record::from_sample(&s.name, &s.shift, &s.work_order, self.sample(), at);
        self.records.push(record.clone());
        record
    }

    /// Hand the buffer over, leaving it empty.
    pub fn take_records(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.records)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.stop(Duration::ZERO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedBus, SimulatedOpener};
    use std::thread;
    use std::time::Instant;

    fn polling() -> PollingConfig {
        PollingConfig {
            interval: Duration::from_millis(50),
            read_timeout: Duration::from_millis(10),
            join_timeout: Duration::from_millis(500),
        }
    }

    fn settings(port: &str, temperature: SensorAddress, current: SensorAddress) -> ChannelSettings {
        ChannelSettings {
            name: "L1".into(),
            shift: "day".into(),
            work_order: "WO-1".into(),
            port: port.into(),
            temperature,
            current,
        }
    }

    #[test]
    fn parses_sensor_addresses() {
        assert_eq!("".parse::<SensorAddress>().unwrap(), SensorAddress::Unassigned);
        assert_eq!("none".parse::<SensorAddress>().unwrap(), SensorAddress::NotInstalled);
        assert_eq!(" 12 ".parse::<SensorAddress>().unwrap(), SensorAddress::Slave(12));
        assert!("0".parse::<SensorAddress>().is_err());
        assert!("248".parse::<SensorAddress>().is_err());
        assert!("abc".parse::<SensorAddress>().is_err());
    }

    #[test]
    fn unreachable_port_goes_offline_without_reader() {
        let opener = SimulatedOpener::new();
        let mut channel = Channel::new(
            ChannelId(1),
            settings("COM9", SensorAddress::Slave(1), SensorAddress::NotInstalled),
        );

        assert_eq!(channel.start(&opener, &polling()).unwrap(), ChannelMode::Offline);
        assert!(!channel.has_reader());
        assert!(!channel.has_transport());
        assert_eq!(
            channel.sensor_status(),
            (SensorStatus::Offline, SensorStatus::NotInstalled)
        );

        assert_eq!(channel.stop(polling().join_timeout), JoinOutcome::NotRunning);
        assert!(!channel.is_running());
    }

    #[test]
    fn no_addresses_means_offline() {
        let opener = SimulatedOpener::new().with_port("COM1", SimulatedBus::with_devices(&[1], 1));
        let mut channel = Channel::new(
            ChannelId(1),
            settings("COM1", SensorAddress::Unassigned, SensorAddress::Unassigned),
        );
        assert_eq!(channel.start(&opener, &polling()).unwrap(), ChannelMode::Offline);
        assert!(!channel.has_transport());
    }

    #[test]
    fn current_sensor_alone_can_connect() {
        let bus = SimulatedBus::with_devices(&[2], 7);
        let opener = SimulatedOpener::new().with_port("COM1", bus);
        let mut channel = Channel::new(
            ChannelId(1),
            settings("COM1", SensorAddress::Slave(1), SensorAddress::Slave(2)),
        );

        assert_eq!(channel.start(&opener, &polling()).unwrap(), ChannelMode::Connected);
        assert!(channel.has_reader());
        channel.stop(polling().join_timeout);
    }

    #[test]
    fn start_is_idempotent_and_stop_joins() {
        let bus = SimulatedBus::with_devices(&[1], 250);
        let opener = SimulatedOpener::new().with_port("COM1", bus.clone());
        let mut channel = Channel::new(
            ChannelId(1),
            settings("COM1", SensorAddress::Slave(1), SensorAddress::NotInstalled),
        );

        assert_eq!(channel.start(&opener, &polling()).unwrap(), ChannelMode::Connected);
        assert_eq!(
            channel.sensor_status(),
            (SensorStatus::Connected, SensorStatus::NotInstalled)
        );
        let probes = bus.requests_to(1);
        assert_eq!(channel.start(&opener, &polling()).unwrap(), ChannelMode::Connected);
        assert!(channel.has_reader());

        let deadline = Instant::now() + Duration::from_secs(2);
        while channel.sample().temperature.is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(channel.sample().temperature, Some(25.0));
        assert!(bus.requests_to(1) > probes);

        assert_eq!(channel.stop(polling().join_timeout), JoinOutcome::Joined);
        assert!(!channel.has_reader());
        assert!(channel.has_transport());
        assert_eq!(channel.mode(), ChannelMode::Connected);
    }

    #[test]
    fn read_failures_after_connect_do_not_go_offline() {
        let bus = SimulatedBus::with_devices(&[1], 250);
        let opener = SimulatedOpener::new().with_port("COM1", bus.clone());
        let mut channel = Channel::new(
            ChannelId(1),
            settings("COM1", SensorAddress::Slave(1), SensorAddress::NotInstalled),
        );
        channel.start(&opener, &polling()).unwrap();

        bus.remove(1);
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut went_absent = false;
        while Instant::now() < deadline {
            if channel.sample().temperature.is_none() {
                went_absent = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(went_absent);
        assert_eq!(channel.mode(), ChannelMode::Connected);
        channel.stop(polling().join_timeout);
    }

    #[test]
    fn reset_returns_to_initial_state() {
        let bus = SimulatedBus::with_devices(&[1], 1);
        let opener = SimulatedOpener::new().with_port("COM1", bus);
        let mut channel = Channel::new(
            ChannelId(1),
            settings("COM1", SensorAddress::Slave(1), SensorAddress::Unassigned),
        );
        channel.start(&opener, &polling()).unwrap();
        channel.record_tick(Local::now());
        assert_eq!(channel.records().len(), 1);

        assert_eq!(channel.reset(polling().join_timeout), JoinOutcome::Joined);
        assert_eq!(channel.mode(), ChannelMode::Idle);
        assert!(channel.records().is_empty());
        assert!(!channel.has_transport());
        assert!(channel.started_at().is_none());
        assert_eq!(channel.elapsed(), Duration::ZERO);
        assert_eq!(
            channel.sensor_status(),
            (SensorStatus::Unchecked, SensorStatus::Unchecked)
        );
        assert_eq!(channel.sample(), Sample::default());
    }

    #[test]
    fn failed_connect_never_stays_connecting() {
        let bus = SimulatedBus::with_devices(&[1], 250);
        let opener = SimulatedOpener::new().with_port("COM1", bus);
        let mut channel = Channel::new(
            ChannelId(1),
            settings("COM1", SensorAddress::Slave(1), SensorAddress::Slave(2)),
        );
        channel.mode = ChannelMode::Connecting;

        channel.mark_offline();
        assert_eq!(channel.mode(), ChannelMode::Offline);
        assert_eq!(
            channel.sensor_status(),
            (SensorStatus::Offline, SensorStatus::Offline)
        );
        assert!(!channel.has_reader());
        assert!(!channel.is_running());

        // A later start from Offline still connects.
        assert_eq!(channel.start(&opener, &polling()).unwrap(), ChannelMode::Connected);
        channel.stop(polling().join_timeout);
    }

    #[test]
    fn interval_follows_start_and_later_changes() {
        let bus = SimulatedBus::with_devices(&[1], 250);
        let opener = SimulatedOpener::new().with_port("COM1", bus);
        let mut channel = Channel::new(
            ChannelId(1),
            settings("COM1", SensorAddress::Slave(1), SensorAddress::NotInstalled),
        );
        channel.start(&opener, &polling()).unwrap();
        assert_eq!(channel.interval(), polling().interval);

        channel.set_interval(Duration::from_millis(700));
        assert_eq!(channel.interval(), Duration::from_millis(700));
        channel.stop(polling().join_timeout);
    }

    #[test]
    fn offline_tick_records_defaults() {
        let opener = SimulatedOpener::new();
        let mut channel = Channel::new(
            ChannelId(3),
            settings("COM9", SensorAddress::Slave(1), SensorAddress::Slave(2)),
        );
        channel.start(&opener, &polling()).unwrap();

        let record = channel.record_tick(Local::now());
        assert_eq!(record.line, "L1");
        assert_eq!(record.temperature, 0.0);
        assert_eq!(record.current, 0.0);
        assert_eq!(channel.records(), &[record]);
    }
}
