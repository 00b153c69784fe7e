//! In-process stand-in for an RS-485 bus with Modbus RTU sensors on it.
//!
//! Used for bench runs without hardware (`ems-record --simulate`) and by the
//! test-suite. Each simulated slave answers "read holding registers" with a
//! single register value and "report slave ID" with its own address; every
//! other address stays silent, exactly like an empty slot on a real bus.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::rtu;
use crate::transport::{Link, PortOpener, RtuTransport, Transport};

/// Most registers one read may ask for; larger reads go unanswered.
const MAX_READ_REGISTERS: u16 = 125;

#[derive(Debug, Clone, Default)]
struct SimDevice {
    register: u16,
    truncate_to: Option<usize>,
    corrupt: bool,
}

#[derive(Debug, Default)]
struct BusState {
    devices: BTreeMap<u8, SimDevice>,
    requests: HashMap<u8, usize>,
}

/// A shared simulated bus. Clones refer to the same devices.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with one device per address, all reading `value`.
    pub fn with_devices(addresses: &[u8], value: u16) -> Self {
        let bus = Self::new();
        for &addr in addresses {
            bus.set_register(addr, value);
        }
        bus
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Attach a device at `addr` (or update it) with the given register value.
    pub fn set_register(&self, addr: u8, value: u16) {
        self.state().devices.entry(addr).or_default().register = value;
    }

    /// Detach the device at `addr`; it stops answering.
    pub fn remove(&self, addr: u8) {
        self.state().devices.remove(&addr);
    }

    /// Cut every response from `addr` after `len` bytes.
    pub fn truncate_responses(&self, addr: u8, len: usize) {
        if let Some(dev) = self.state().devices.get_mut(&addr) {
            dev.truncate_to = Some(len);
        }
    }

    /// Flip the CRC of every response from `addr`.
    pub fn corrupt_responses(&self, addr: u8, corrupt: bool) {
        if let Some(dev) = self.state().devices.get_mut(&addr) {
            dev.corrupt = corrupt;
        }
    }

    /// Number of requests addressed to `addr` so far.
    pub fn requests_to(&self, addr: u8) -> usize {
        self.state().requests.get(&addr).copied().unwrap_or(0)
    }

    /// A fresh byte link onto this bus.
    pub fn link(&self) -> SimLink {
        SimLink {
            bus: self.clone(),
            outgoing: Vec::new(),
            incoming: VecDeque::new(),
        }
    }

    fn respond(&self, request: &[u8]) -> Option<Vec<u8>> {
        let slave = request[0];
        let mut state = self.state();
        *state.requests.entry(slave).or_default() += 1;
        let device = state.devices.get(&slave)?.clone();
        drop(state);

        if rtu::validate_response(request, slave).is_err() {
            return None;
        }

        let mut frame = match request[1] {
            rtu::FN_READ_HOLDING_REGISTERS => {
                let count = u16::from_be_bytes([request[4], request[5]]);
                if !(1..=MAX_READ_REGISTERS).contains(&count) {
                    return None;
                }
                let byte_count = u8::try_from(u32::from(count) * 2).ok()?;
                let mut frame = vec![slave, rtu::FN_READ_HOLDING_REGISTERS, byte_count];
                for _ in 0..count {
                    frame.extend_from_slice(&device.register.to_be_bytes());
                }
                frame
            }
            rtu::FN_REPORT_SLAVE_ID => vec![slave, rtu::FN_REPORT_SLAVE_ID, 2, slave, 0xFF],
            other => vec![slave, other | 0x80, 0x01],
        };
        rtu::append_crc(&mut frame);

        if device.corrupt {
            let last = frame.len() - 1;
            frame[last] ^= 0xFF;
        }
        if let Some(len) = device.truncate_to {
            frame.truncate(len);
        }
        Some(frame)
    }
}

/// Request length implied by the function code of a master frame.
fn request_len(partial: &[u8]) -> Option<usize> {
    match *partial.get(1)? {
        rtu::FN_REPORT_SLAVE_ID => Some(4),
        _ => Some(8),
    }
}

/// One open connection onto a [`SimulatedBus`].
pub struct SimLink {
    bus: SimulatedBus,
    outgoing: Vec<u8>,
    incoming: VecDeque<u8>,
}

impl Write for SimLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        while let Some(len) = request_len(&self.outgoing) {
            if self.outgoing.len() < len {
                break;
            }
            let request: Vec<u8> = self.outgoing.drain(..len).collect();
            if let Some(response) = self.bus.respond(&request) {
                self.incoming.extend(response);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "bus silent"));
        }
        let n = buf.len().min(self.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(self.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Link for SimLink {
    fn set_read_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.incoming.clear();
        Ok(())
    }
}

/// Opens ports onto simulated buses by name; unknown names fail to open.
#[derive(Debug, Clone, Default)]
pub struct SimulatedOpener {
    buses: HashMap<String, SimulatedBus>,
}

impl SimulatedOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: impl Into<String>, bus: SimulatedBus) -> Self {
        self.buses.insert(port.into(), bus);
        self
    }

    pub fn ports(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buses.keys().cloned().collect();
        names.sort();
        names
    }
}

impl PortOpener for SimulatedOpener {
    fn open(&self, port: &str) -> Result<Box<dyn Transport>> {
        let bus = self.buses.get(port).ok_or_else(|| Error::Transport {
            port: port.to_string(),
            reason: "no such simulated port".into(),
        })?;
        Ok(Box::new(RtuTransport::new(port, bus.link())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(bus: &SimulatedBus) -> RtuTransport<SimLink> {
        RtuTransport::new("sim", bus.link())
    }

    #[test]
    fn oversized_reads_go_unanswered() {
        let bus = SimulatedBus::with_devices(&[1], 7);
        let mut transport = transport(&bus);

        for count in [0, 126, 200, u16::MAX] {
            let request = rtu::read_holding_registers(1, 0, count);
            let err = transport
                .request(1, &request, Duration::from_millis(20))
                .unwrap_err();
            assert!(matches!(err, Error::Timeout { slave: 1, .. }), "count {count}");
        }
        assert_eq!(bus.requests_to(1), 4);
    }

    #[test]
    fn largest_read_fits_one_frame() {
        let bus = SimulatedBus::with_devices(&[1], 7);
        let request = rtu::read_holding_registers(1, 0, MAX_READ_REGISTERS);
        let response = transport(&bus)
            .request(1, &request, Duration::from_millis(50))
            .unwrap();
        rtu::validate_response(&response, 1).unwrap();
        assert_eq!(response[2], 250);
        assert_eq!(response.len(), 3 + 250 + 2);
        assert_eq!(&response[3..5], &7u16.to_be_bytes());
    }
}
