use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("transport error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("transport error on {port}: {reason}")]
    Transport { port: String, reason: String },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no response from slave {slave} within {timeout:?}")]
    Timeout { slave: u8, timeout: Duration },
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("export to {path} failed: {source}")]
    Export {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("export location {0} is not a writable directory")]
    InvalidStorage(PathBuf),
    #[error("not enough free space at {path}: {available} bytes available")]
    InsufficientSpace { path: PathBuf, available: u64 },
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Reasons a response frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("response too short ({0} bytes)")]
    TooShort(usize),
    #[error("response from slave {actual}, expected {expected}")]
    AddressMismatch { expected: u8, actual: u8 },
    #[error("CRC mismatch (received {received:#06X}, calculated {calculated:#06X})")]
    Crc { received: u16, calculated: u16 },
    #[error("slave answered with exception code {0:#04X}")]
    Exception(u8),
    #[error("unexpected function code {0:#04X}")]
    UnexpectedFunction(u8),
    #[error("expected {expected} data bytes, got {actual}")]
    ByteCount { expected: u8, actual: u8 },
    #[error("response truncated after {0} bytes")]
    Truncated(usize),
    #[error("response exceeds the maximum RTU frame size")]
    Oversized,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("record database not found at {0}")]
    MissingDatabase(PathBuf),
    #[error("`git {command}` failed: {stderr}")]
    Vcs { command: String, stderr: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transport and protocol failures that only cost one reading.
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Serial(_)
                | Error::Transport { .. }
                | Error::Protocol(_)
                | Error::Timeout { .. }
        )
    }
}
