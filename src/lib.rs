//! RS-485 sensor recording and archiving.
//!
//! This crate polls temperature and current sensors on Modbus RTU slaves,
//! records one sample per tick per channel, and archives the samples to a
//! version-controlled repository through a separate sync agent.
//!
//! # Pieces
//!
//! - [`rtu`], [`transport`], [`scanner`]: the wire protocol, a serial
//!   transport speaking it and best-effort slave discovery.
//! - [`channel`], [`reader`], [`recorder`]: per-channel connection state,
//!   the background poller and the headless control surface.
//! - [`store`], [`export`], [`sync`]: the shared SQLite log, per-channel
//!   exports and the watermark-driven archiver.
//!
//! # Process boundary
//!
//! The recorder and the sync agent run as separate processes. They share
//! exactly two files: the SQLite database and the liveness flag. Neither
//! side takes a lock of its own:
//!
//! 1. The recorder inserts one row per tick and touches the flag.
//! 2. The sync agent only works while the flag is fresh, reads rows newer
//!    than its watermark and never writes to the database.

pub mod channel;
pub mod config;
pub mod errors;
pub mod export;
pub mod liveness;
pub mod logging;
pub mod reader;
pub mod record;
pub mod recorder;
pub mod rtu;
pub mod scanner;
pub mod sim;
pub mod store;
pub mod sync;
pub mod transport;
pub mod vcs;

pub use channel::{Channel, ChannelId, ChannelMode, ChannelSettings, SensorAddress, SensorStatus};
pub use config::{Layout, PollingConfig, RemoteTarget, StorageConfig};
pub use errors::*;
pub use export::ExportFormat;
pub use reader::{JoinOutcome, Sample};
pub use record::Record;
pub use recorder::{Recorder, StopReport};
pub use scanner::{PortScan, ProbeKind, ScanOptions};
pub use store::RecordStore;
pub use sync::{SyncOutcome, SyncService};
pub use transport::{PortOpener, SerialOpener, Transport};
pub use vcs::{GitCli, VersionControl};
