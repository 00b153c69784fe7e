//! Best-effort discovery of responsive slaves.
//!
//! A scan walks addresses `1..=max_address` on one port and sends a probe to
//! each. Failures are expected (most addresses are empty) and never abort the
//! sweep, so a full scan costs at most `max_address × timeout`.
//!
//! [`pre_scan`] runs one sweep per port in parallel and only answers whether
//! anything responded on it.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::errors::Result;
use crate::rtu;
use crate::transport::{read_sensor, PortOpener, Transport};

/// Highest address probed by default.
pub const DEFAULT_MAX_ADDRESS: u8 = 32;

/// Per-probe budget while scanning.
pub const SCAN_TIMEOUT: Duration = Duration::from_millis(150);

/// Per-probe budget for the global pre-scan.
pub const PRE_SCAN_TIMEOUT: Duration = Duration::from_millis(300);

/// Which request is used to ask "is anybody there?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeKind {
    /// Read holding register 0; only one-register answers count.
    #[default]
    ReadHoldingRegister,
    /// Report slave ID; any well-formed answer counts.
    ReportSlaveId,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub max_address: u8,
    pub timeout: Duration,
    pub probe: ProbeKind,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_address: DEFAULT_MAX_ADDRESS,
            timeout: SCAN_TIMEOUT,
            probe: ProbeKind::default(),
        }
    }
}

/// Whether a port had at least one responsive slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortScan {
    pub port: String,
    pub active: bool,
}

/// Send one probe to `slave`. Any error means "not found".
pub fn probe(transport: &mut dyn Transport, slave: u8, options: &ScanOptions) -> bool {
    let outcome = match options.probe {
        ProbeKind::ReadHoldingRegister => read_sensor(transport, slave, options.timeout).map(|_| ()),
        ProbeKind::ReportSlaveId => probe_slave_id(transport, slave, options.timeout),
    };
    match outcome {
        Ok(()) => true,
        Err(e) => {
            debug!("probe of slave {} failed: {}", slave, e);
            false
        }
    }
}

fn probe_slave_id(transport: &mut dyn Transport, slave: u8, timeout: Duration) -> Result<()> {
    let request = rtu::report_slave_id(slave);
    let response = transport.request(slave, &request, timeout)?;
    rtu::validate_response(&response, slave)?;
    Ok(())
}

/// Probe every address on an already open transport.
///
/// The result is ascending and free of duplicates by construction.
pub fn scan_transport(transport: &mut dyn Transport, options: &ScanOptions) -> Vec<u8> {
    let last = options.max_address.min(*rtu::SLAVE_ADDRESSES.end());
    (1..=last)
        .filter(|&slave| probe(transport, slave, options))
        .collect()
}

/// Open `port` and scan it. A port that will not open yields no addresses.
pub fn scan(opener: &dyn PortOpener, port: &str, options: &ScanOptions) -> Vec<u8> {
    let mut transport = match opener.open(port) {
        Ok(t) => t,
        Err(e) => {
            warn!("scan of {} skipped: {}", port, e);
            return Vec::new();
        }
    };
    let found = scan_transport(transport.as_mut(), options);
    if let Err(e) = transport.close() {
        debug!("closing {} after scan failed: {}", port, e);
    }
    info!("scan of {} found {:?}", port, found);
    found
}

/// True as soon as any address on `port` answers.
fn port_has_device(opener: &dyn PortOpener, port: &str, options: &ScanOptions) -> bool {
    let mut transport = match opener.open(port) {
        Ok(t) => t,
        Err(e) => {
            debug!("pre-scan could not open {}: {}", port, e);
            return false;
        }
    };
    let last = options.max_address.min(*rtu::SLAVE_ADDRESSES.end());
    let active = (1..=last).any(|slave| probe(transport.as_mut(), slave, options));
    if let Err(e) = transport.close() {
        debug!("closing {} after pre-scan failed: {}", port, e);
    }
    active
}

/// Check every port concurrently, one worker per port, and wait for all.
///
/// Results keep the order of `ports`.
pub fn pre_scan(opener: &dyn PortOpener, ports: &[String], options: &ScanOptions) -> Vec<PortScan> {
    info!("pre-scanning {} port(s)", ports.len());
    let results = thread::scope(|scope| {
        let workers: Vec<_> = ports
            .iter()
            .map(|port| {
                let worker = scope.spawn(move || port_has_device(opener, port, options));
                (port, worker)
            })
            .collect();

        workers
            .into_iter()
            .map(|(port, worker)| PortScan {
                port: port.clone(),
                active: worker.join().unwrap_or(false),
            })
            .collect::<Vec<_>>()
    });

    for scan in &results {
        info!(
            "pre-scan {}: {}",
            scan.port,
            if scan.active { "device found" } else { "no device" }
        );
    }
    results
}
