//! Modbus RTU framing for the two requests the recorder issues.
//!
//! Only the master side is implemented: building a "read holding registers"
//! request for a single register, the "report slave ID" probe, and checking
//! the frames that come back.
//!
//! # Frame layout
//!
//! ```text
//! read holding register:  [addr][0x03][reg_hi][reg_lo][count_hi][count_lo][crc_lo][crc_hi]
//! report slave ID:        [addr][0x11][crc_lo][crc_hi]
//! ```
//!
//! The CRC is CRC16/MODBUS (reflected polynomial 0xA001, seed 0xFFFF),
//! transmitted low byte first.

use crate::errors::ProtocolError;

// ============================================================================
// Constants
// ============================================================================

/// Function code: read holding registers.
pub const FN_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Function code: report slave ID.
pub const FN_REPORT_SLAVE_ID: u8 = 0x11;

/// Bit set on the function code of an exception response.
const EXCEPTION_FLAG: u8 = 0x80;

/// Register every sensor on the bus exposes its reading in.
pub const SENSOR_REGISTER: u16 = 0x0000;

/// Smallest valid response: address, function, one byte, CRC.
pub const MIN_RESPONSE_LEN: usize = 4;

/// Upper bound of an RTU ADU.
pub const MAX_FRAME_LEN: usize = 256;

/// Valid unicast slave addresses.
pub const SLAVE_ADDRESSES: std::ops::RangeInclusive<u8> = 1..=247;

// ============================================================================
// CRC
// ============================================================================

/// CRC16/MODBUS over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC of `frame` to it, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
}

// ============================================================================
// Requests
// ============================================================================

/// Build a "read holding registers" request.
pub fn read_holding_registers(slave: u8, register: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.push(FN_READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// The request the sensors are polled with: register 0, one register.
pub fn read_sensor_request(slave: u8) -> Vec<u8> {
    read_holding_registers(slave, SENSOR_REGISTER, 1)
}

/// Build a "report slave ID" probe.
pub fn report_slave_id(slave: u8) -> Vec<u8> {
    let mut frame = vec![slave, FN_REPORT_SLAVE_ID];
    append_crc(&mut frame);
    frame
}

// ============================================================================
// Responses
// ============================================================================

/// Full length of the response whose first bytes are in `partial`.
///
/// Returns `None` until enough of the header has arrived to tell.
pub fn expected_frame_len(partial: &[u8]) -> Option<usize> {
    let function = *partial.get(1)?;
    if function & EXCEPTION_FLAG != 0 {
        return Some(5);
    }
    let byte_count = *partial.get(2)? as usize;
    Some(3 + byte_count + 2)
}

/// Check length, slave address and trailing CRC of a response frame.
pub fn validate_response(frame: &[u8], slave: u8) -> Result<(), ProtocolError> {
    if frame.len() < MIN_RESPONSE_LEN {
        return Err(ProtocolError::TooShort(frame.len()));
    }
    if frame[0] != slave {
        return Err(ProtocolError::AddressMismatch {
            expected: slave,
            actual: frame[0],
        });
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let calculated = crc16(body);
    if received != calculated {
        return Err(ProtocolError::Crc {
            received,
            calculated,
        });
    }
    Ok(())
}

/// Decode a validated response to a one-register read.
///
/// The response must carry exactly two data bytes; anything else means the
/// device is not one of ours, or answered a different request.
pub fn decode_single_register(frame: &[u8]) -> Result<u16, ProtocolError> {
    let function = frame[1];
    if function & EXCEPTION_FLAG != 0 {
        return Err(ProtocolError::Exception(frame[2]));
    }
    if function != FN_READ_HOLDING_REGISTERS {
        return Err(ProtocolError::UnexpectedFunction(function));
    }
    let byte_count = frame[2];
    if byte_count != 2 || frame.len() != 7 {
        return Err(ProtocolError::ByteCount {
            expected: 2,
            actual: byte_count,
        });
    }
    Ok(u16::from_be_bytes([frame[3], frame[4]]))
}

// ============================================================================
// Sensor scaling
// ============================================================================

/// Temperature sensors report tenths of a degree.
pub fn temperature_from_raw(raw: u16) -> f64 {
    raw as f64 / 10.0
}

/// Current sensors report whole amps.
pub fn current_from_raw(raw: u16) -> f64 {
    raw as f64
}
