//! Background polling of a channel's sensors.
//!
//! One [`Reader`] thread per connected channel owns the transport, reads the
//! configured registers in a loop and publishes the result to a
//! [`SampleCell`]. The periodic tick is the cell's only consumer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::rtu;
use crate::transport::{read_sensor, Transport};

/// Shortest pause between two polling rounds.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-request budget in steady state.
pub const READ_TIMEOUT: Duration = Duration::from_millis(300);

/// How long `stop` waits for the thread before abandoning it.
pub const JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Granularity at which a sleeping reader notices cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

// ============================================================================
// Sample Cell
// ============================================================================

/// The latest decoded reading of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sample {
    pub temperature: Option<f64>,
    pub current: Option<f64>,
}

const TEMP_PRESENT: u64 = 1 << 32;
const CURRENT_PRESENT: u64 = 1 << 33;

/// Single-producer/single-consumer snapshot of the latest raw readings.
///
/// Both register values and their presence bits are packed into one atomic
/// word, so the consumer never observes a temperature from one round paired
/// with a current from another.
#[derive(Debug, Default)]
pub struct SampleCell(AtomicU64);

impl SampleCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, temperature_raw: Option<u16>, current_raw: Option<u16>) {
        let mut word = 0u64;
        if let Some(raw) = temperature_raw {
            word |= TEMP_PRESENT | raw as u64;
        }
        if let Some(raw) = current_raw {
            word |= CURRENT_PRESENT | (raw as u64) << 16;
        }
        self.0.store(word, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn load(&self) -> Sample {
        let word = self.0.load(Ordering::Acquire);
        Sample {
            temperature: (word & TEMP_PRESENT != 0)
                .then(|| rtu::temperature_from_raw((word & 0xFFFF) as u16)),
            current: (word & CURRENT_PRESENT != 0)
                .then(|| rtu::current_from_raw(((word >> 16) & 0xFFFF) as u16)),
        }
    }
}

// ============================================================================
// Poll Interval
// ============================================================================

/// Pause between polling rounds, shared with a running reader.
///
/// Clones observe the same value; a change reaches the reader at its next
/// sleep slice.
#[derive(Debug, Clone)]
pub struct PollInterval(Arc<AtomicU64>);

impl PollInterval {
    pub fn new(interval: Duration) -> Self {
        Self(Arc::new(AtomicU64::new(as_millis(interval))))
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, interval: Duration) {
        self.0.store(as_millis(interval), Ordering::Relaxed);
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        Self::new(MIN_POLL_INTERVAL)
    }
}

fn as_millis(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Reader
// ============================================================================

/// What the reader polls.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub temperature_slave: Option<u8>,
    pub current_slave: Option<u8>,
    pub interval: PollInterval,
    pub timeout: Duration,
}

/// How a bounded join ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The thread exited within the deadline.
    Joined,
    /// The deadline passed; the thread is left to finish on its own.
    Abandoned,
    /// There was no reader to stop.
    NotRunning,
}

/// Handle to a running reader thread.
pub struct Reader {
    token: CancellationToken,
    handle: JoinHandle<Box<dyn Transport>>,
}

impl Reader {
    /// Spawn the polling thread. It owns `transport` until joined.
    pub fn spawn(
        name: &str,
        transport: Box<dyn Transport>,
        config: ReaderConfig,
        cell: Arc<SampleCell>,
        token: CancellationToken,
    ) -> Result<Self> {
        let thread_token = token.clone();
        let label = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("reader-{name}"))
            .spawn(move || poll_loop(&label, transport, config, &cell, &thread_token))?;
        info!("reader for {} started", name);
        Ok(Self { token, handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait up to `timeout` for the thread to exit.
    ///
    /// A joined reader hands its transport back; an abandoned one keeps it
    /// and drops it whenever it finally exits.
    pub fn stop(self, timeout: Duration) -> (JoinOutcome, Option<Box<dyn Transport>>) {
        self.token.cancel();
        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("reader did not exit within {:?}, abandoning it", timeout);
                return (JoinOutcome::Abandoned, None);
            }
            thread::sleep(Duration::from_millis(5));
        }
        match self.handle.join() {
            Ok(transport) => (JoinOutcome::Joined, Some(transport)),
            Err(_) => {
                warn!("reader thread panicked");
                (JoinOutcome::Abandoned, None)
            }
        }
    }
}

fn poll_loop(
    name: &str,
    mut transport: Box<dyn Transport>,
    config: ReaderConfig,
    cell: &SampleCell,
    token: &CancellationToken,
) -> Box<dyn Transport> {
    while !token.is_cancelled() {
        let round = Instant::now();
        let temperature = config
            .temperature_slave
            .and_then(|slave| poll_one(name, transport.as_mut(), slave, config.timeout));
        let current = config
            .current_slave
            .and_then(|slave| poll_one(name, transport.as_mut(), slave, config.timeout));
        cell.publish(temperature, current);

        sleep_cancellable(round, &config.interval, token);
    }

    debug!("reader for {} exiting", name);
    transport
}

fn poll_one(name: &str, transport: &mut dyn Transport, slave: u8, timeout: Duration) -> Option<u16> {
    match read_sensor(transport, slave, timeout) {
        Ok(raw) => Some(raw),
        Err(e) if e.is_link_error() => {
            debug!("{}: read of slave {} failed: {}", name, slave, e);
            None
        }
        Err(e) => {
            warn!("{}: read of slave {} failed: {}", name, slave, e);
            None
        }
    }
}

/// Sleep until `interval` after `since`, re-reading `interval` every slice.
fn sleep_cancellable(since: Instant, interval: &PollInterval, token: &CancellationToken) {
    loop {
        let deadline = since + interval.get().max(MIN_POLL_INTERVAL);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || token.is_cancelled() {
            return;
        }
        thread::sleep(remaining.min(SLEEP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::sim::SimulatedBus;
    use crate::transport::RtuTransport;

    fn config(temperature: Option<u8>, current: Option<u8>) -> ReaderConfig {
        ReaderConfig {
            temperature_slave: temperature,
            current_slave: current,
            interval: PollInterval::new(MIN_POLL_INTERVAL),
            timeout: Duration::from_millis(10),
        }
    }

    fn wait_for(cell: &SampleCell, expected: Sample) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cell.load() == expected {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn cell_round_trips_presence() {
        let cell = SampleCell::new();
        assert_eq!(cell.load(), Sample::default());

        cell.publish(Some(253), None);
        assert_eq!(
            cell.load(),
            Sample {
                temperature: Some(25.3),
                current: None
            }
        );

        cell.publish(Some(0), Some(u16::MAX));
        assert_eq!(
            cell.load(),
            Sample {
                temperature: Some(0.0),
                current: Some(65535.0)
            }
        );

        cell.clear();
        assert_eq!(cell.load(), Sample::default());
    }

    #[test]
    fn publishes_readings_and_recovers_after_failure() {
        let bus = SimulatedBus::new();
        bus.set_register(1, 215);
        bus.set_register(2, 8);
        let cell = Arc::new(SampleCell::new());
        let reader = Reader::spawn(
            "line-1",
            Box::new(RtuTransport::new("sim", bus.link())),
            config(Some(1), Some(2)),
            cell.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        assert!(wait_for(
            &cell,
            Sample {
                temperature: Some(21.5),
                current: Some(8.0)
            }
        ));

        // Only the failing quantity goes absent.
        bus.remove(2);
        assert!(wait_for(
            &cell,
            Sample {
                temperature: Some(21.5),
                current: None
            }
        ));

        bus.set_register(2, 9);
        assert!(wait_for(
            &cell,
            Sample {
                temperature: Some(21.5),
                current: Some(9.0)
            }
        ));

        let (outcome, transport) = reader.stop(JOIN_TIMEOUT);
        assert_eq!(outcome, JoinOutcome::Joined);
        assert!(transport.is_some());
    }

    #[test]
    fn long_interval_does_not_delay_stop() {
        let bus = SimulatedBus::with_devices(&[1], 1);
        let cell = Arc::new(SampleCell::new());
        let reader = Reader::spawn(
            "slow",
            Box::new(RtuTransport::new("sim", bus.link())),
            ReaderConfig {
                interval: PollInterval::new(Duration::from_secs(5)),
                ..config(Some(1), None)
            },
            cell,
            CancellationToken::new(),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        let (outcome, transport) = reader.stop(JOIN_TIMEOUT);
        assert_eq!(outcome, JoinOutcome::Joined);
        assert!(transport.is_some());
    }

    #[test]
    fn interval_changes_reach_a_running_reader() {
        let bus = SimulatedBus::with_devices(&[1], 1);
        let interval = PollInterval::new(Duration::from_secs(5));
        let reader = Reader::spawn(
            "retimed",
            Box::new(RtuTransport::new("sim", bus.link())),
            ReaderConfig {
                interval: interval.clone(),
                ..config(Some(1), None)
            },
            Arc::new(SampleCell::new()),
            CancellationToken::new(),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(200));
        assert_eq!(bus.requests_to(1), 1);

        // The pending five-second pause is cut short by the new value.
        interval.set(Duration::from_millis(10));
        let deadline = Instant::now() + Duration::from_secs(2);
        while bus.requests_to(1) < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(bus.requests_to(1) >= 4);
        assert_eq!(interval.get(), Duration::from_millis(10));

        let (outcome, _) = reader.stop(JOIN_TIMEOUT);
        assert_eq!(outcome, JoinOutcome::Joined);
    }

    struct Stuck;

    impl Transport for Stuck {
        fn request(&mut self, slave: u8, _frame: &[u8], timeout: Duration) -> Result<Vec<u8>> {
            thread::sleep(Duration::from_secs(2));
            Err(Error::Timeout { slave, timeout })
        }
    }

    #[test]
    fn unresponsive_reader_is_abandoned_within_bound() {
        let cell = Arc::new(SampleCell::new());
        let reader = Reader::spawn(
            "stuck",
            Box::new(Stuck),
            config(Some(1), None),
            cell,
            CancellationToken::new(),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        let (outcome, transport) = reader.stop(Duration::from_millis(100));
        assert_eq!(outcome, JoinOutcome::Abandoned);
        assert!(transport.is_none());
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
