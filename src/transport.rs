//! Serial transport for Modbus RTU requests.
//!
//! There is exactly one way to talk to the bus: raw RTU frames written to a
//! byte link and read back with a bounded wait. [`Link`] abstracts the byte
//! stream (a real serial port, or the simulated bus used for bench tests),
//! [`RtuTransport`] adds request/response framing on top, and
//! [`PortOpener`] is the seam channels and scanners open ports through.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, trace};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::errors::{Error, ProtocolError, Result};
use crate::rtu;

// ============================================================================
// Constants
// ============================================================================

/// Fixed bus speed of the sensor network.
pub const BAUD_RATE: u32 = 9600;

/// Timeout the port is opened with, before any request narrows it.
const OPEN_TIMEOUT: Duration = Duration::from_millis(300);

// ============================================================================
// Link Abstraction
// ============================================================================

/// A raw byte link to the bus.
pub trait Link: Read + Write + Send {
    /// Bound the next blocking read.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Drop any bytes still waiting in the input buffer.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl Link for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        SerialPort::set_timeout(&mut **self, timeout).map_err(io::Error::from)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        SerialPort::clear(&**self, ClearBuffer::Input).map_err(io::Error::from)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Request/response access to the bus.
pub trait Transport: Send {
    /// Send `frame` to `slave` and wait up to `timeout` for one complete
    /// response frame. The response is returned unvalidated.
    fn request(&mut self, slave: u8, frame: &[u8], timeout: Duration) -> Result<Vec<u8>>;

    /// Release the underlying port.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// RTU framing over any [`Link`].
pub struct RtuTransport<L: Link> {
    link: L,
    port: String,
}

impl<L: Link> RtuTransport<L> {
    pub fn new(port: impl Into<String>, link: L) -> Self {
        Self {
            link,
            port: port.into(),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

impl<L: Link> Transport for RtuTransport<L> {
    fn request(&mut self, slave: u8, frame: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        // Stale bytes from an earlier timed-out exchange would corrupt this one.
        self.link.discard_input()?;
        self.link.write_all(frame)?;
        self.link.flush()?;
        trace!("{} -> {:02X?}", self.port, frame);

        let deadline = Instant::now() + timeout;
        let mut response = Vec::with_capacity(16);
        let mut chunk = [0u8; 64];

        loop {
            if let Some(len) = rtu::expected_frame_len(&response) {
                if len > rtu::MAX_FRAME_LEN {
                    return Err(ProtocolError::Oversized.into());
                }
                if response.len() >= len {
                    response.truncate(len);
                    trace!("{} <- {:02X?}", self.port, response);
                    return Ok(response);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(incomplete(slave, timeout, response.len()));
            }
            self.link.set_read_timeout(remaining)?;

            match self.link.read(&mut chunk) {
                Ok(0) => return Err(incomplete(slave, timeout, response.len())),
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    return Err(incomplete(slave, timeout, response.len()));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.link.flush()?;
        debug!("closed {}", self.port);
        Ok(())
    }
}

/// Nothing at all is a timeout; a partial frame is a protocol fault.
fn incomplete(slave: u8, timeout: Duration, received: usize) -> Error {
    if received == 0 {
        Error::Timeout { slave, timeout }
    } else {
        ProtocolError::Truncated(received).into()
    }
}

/// Read the sensor register of `slave` and return its raw value.
pub fn read_sensor(transport: &mut dyn Transport, slave: u8, timeout: Duration) -> Result<u16> {
    let request = rtu::read_sensor_request(slave);
    let response = transport.request(slave, &request, timeout)?;
    rtu::validate_response(&response, slave)?;
    Ok(rtu::decode_single_register(&response)?)
}

// ============================================================================
// Opening Ports
// ============================================================================

/// Opens transports by port name.
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &str) -> Result<Box<dyn Transport>>;
}

/// Opens real serial ports at 9600 baud, 8-N-1.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, port: &str) -> Result<Box<dyn Transport>> {
        if port.is_empty() {
            return Err(Error::Transport {
                port: String::new(),
                reason: "no port selected".into(),
            });
        }
        let link = serialport::new(port, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(OPEN_TIMEOUT)
            .open()
            .map_err(|e| Error::Transport {
                port: port.to_string(),
                reason: e.to_string(),
            })?;
        debug!("opened {} at {} baud 8-N-1", port, BAUD_RATE);
        Ok(Box::new(RtuTransport::new(port, link)))
    }
}

/// Names of the serial ports present on this machine.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    let mut names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBus;

    #[test]
    fn reads_register_from_responding_slave() {
        let bus = SimulatedBus::new();
        bus.set_register(5, 251);
        let mut transport = RtuTransport::new("sim", bus.link());

        let raw = read_sensor(&mut transport, 5, Duration::from_millis(50)).unwrap();
        assert_eq!(raw, 251);
    }

    #[test]
    fn silent_slave_times_out() {
        let bus = SimulatedBus::new();
        let mut transport = RtuTransport::new("sim", bus.link());

        let err = read_sensor(&mut transport, 9, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout { slave: 9, .. }));
    }

    #[test]
    fn partial_response_is_a_protocol_error() {
        let bus = SimulatedBus::new();
        bus.set_register(2, 1);
        bus.truncate_responses(2, 4);
        let mut transport = RtuTransport::new("sim", bus.link());

        let err = read_sensor(&mut transport, 2, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::Truncated(4))
        ));
    }

    #[test]
    fn corrupted_response_fails_crc() {
        let bus = SimulatedBus::new();
        bus.set_register(2, 1);
        bus.corrupt_responses(2, true);
        let mut transport = RtuTransport::new("sim", bus.link());

        let err = read_sensor(&mut transport, 2, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Crc { .. })));
    }

    #[test]
    fn opening_empty_port_name_fails() {
        let err = SerialOpener.open("").err().unwrap();
        assert!(matches!(err, Error::Transport { .. }));
    }
}
