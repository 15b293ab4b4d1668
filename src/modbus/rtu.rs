//! Modbus RTU framing for read-holding-registers (function 0x03)

use crate::error::{PowerwatchError, Result};

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
const EXCEPTION_FLAG: u8 = 0x80;

/// CRC-16/MODBUS over `data`.
pub fn crc(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

/// Append the CRC (low byte first, as on the wire).
fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Encode a read-holding-registers request.
pub fn read_holding_request(unit_id: u8, address: u16, count: u16) -> Vec<u8> {
    let [addr_hi, addr_lo] = address.to_be_bytes();
    let [count_hi, count_lo] = count.to_be_bytes();
    with_crc(vec![
        unit_id,
        READ_HOLDING_REGISTERS,
        addr_hi,
        addr_lo,
        count_hi,
        count_lo,
    ])
}

/// Decode a read-holding-registers response and check it answers a request
/// for `expected_count` registers from `unit_id`.
pub fn parse_read_response(frame: &[u8], unit_id: u8, expected_count: u16) -> Result<Vec<u16>> {
    if frame.len() < 5 {
        return Err(PowerwatchError::protocol(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }

    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc(body);
    if received != computed {
        return Err(PowerwatchError::protocol(format!(
            "RTU CRC mismatch: received {:#06x}, computed {:#06x}",
            received, computed
        )));
    }

    if body[0] != unit_id {
        return Err(PowerwatchError::protocol(format!(
            "Response from unit {} (expected {})",
            body[0], unit_id
        )));
    }

    let function = body[1];
    if function == READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
        return Err(PowerwatchError::protocol(format!(
            "Modbus exception code {:#04x}",
            body[2]
        )));
    }
    if function != READ_HOLDING_REGISTERS {
        return Err(PowerwatchError::protocol(format!(
            "Unexpected function code {:#04x}",
            function
        )));
    }

    let byte_count = body[2] as usize;
    let data = &body[3..];
    if data.len() != byte_count || byte_count != expected_count as usize * 2 {
        return Err(PowerwatchError::protocol(format!(
            "Expected {} registers, frame carries {} bytes (declared {})",
            expected_count,
            data.len(),
            byte_count
        )));
    }

    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode a read-holding-registers response; used by test fixtures.
pub fn read_holding_response(unit_id: u8, words: &[u16]) -> Vec<u8> {
    let mut frame = vec![unit_id, READ_HOLDING_REGISTERS, (words.len() * 2) as u8];
    for word in words {
        frame.extend_from_slice(&word.to_be_bytes());
    }
    with_crc(frame)
}
