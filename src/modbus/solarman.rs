//! Solarman V5 transport
//!
//! Wi-Fi data loggers on Deye inverters listen on TCP 8899 and tunnel Modbus
//! RTU frames inside a small envelope keyed by the logger's serial number:
//!
//! ```text
//! A5 | len:u16le | control:u16le | seq:u8 00 | serial:u32le | payload.. | checksum | 15
//! ```
//!
//! Request payload is frame type (02), sensor type (2 bytes) and three u32
//! timers (all zero) followed by the RTU frame. Response payload is frame
//! type, status byte and three u32 timers followed by the RTU frame.

use super::{RegisterTransport, rtu};
use crate::error::{PowerwatchError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const START: u8 = 0xA5;
pub const END: u8 = 0x15;
pub const CONTROL_REQUEST: u16 = 0x4510;
pub const CONTROL_RESPONSE: u16 = 0x1510;
pub const FRAME_TYPE_INVERTER: u8 = 0x02;

const HEADER_LEN: usize = 11;
const TRAILER_LEN: usize = 2;
const REQUEST_PREFIX_LEN: usize = 15;
const RESPONSE_PREFIX_LEN: usize = 14;
const MAX_PAYLOAD_LEN: usize = 1024;
// Loggers interleave heartbeats and data pushes with replies
const MAX_UNSOLICITED_FRAMES: usize = 4;

/// A decoded V5 envelope borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V5Frame<'a> {
    pub control: u16,
    pub sequence: u8,
    pub logger_serial: u32,
    pub payload: &'a [u8],
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn envelope(control: u16, sequence: u8, logger_serial: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    frame.push(START);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&control.to_le_bytes());
    frame.extend_from_slice(&[sequence, 0x00]);
    frame.extend_from_slice(&logger_serial.to_le_bytes());
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame[1..]));
    frame.push(END);
    frame
}

/// Wrap an RTU request frame for the logger.
pub fn encode_request(logger_serial: u32, sequence: u8, rtu_frame: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(REQUEST_PREFIX_LEN + rtu_frame.len());
    payload.push(FRAME_TYPE_INVERTER);
    payload.extend_from_slice(&[0x00; REQUEST_PREFIX_LEN - 1]);
    payload.extend_from_slice(rtu_frame);
    envelope(CONTROL_REQUEST, sequence, logger_serial, &payload)
}

/// Wrap an RTU response frame the way a logger does; used by test fixtures.
pub fn encode_response(logger_serial: u32, sequence: u8, rtu_frame: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(RESPONSE_PREFIX_LEN + rtu_frame.len());
    payload.push(FRAME_TYPE_INVERTER);
    payload.push(0x01);
    payload.extend_from_slice(&[0x00; RESPONSE_PREFIX_LEN - 2]);
    payload.extend_from_slice(rtu_frame);
    envelope(CONTROL_RESPONSE, sequence, logger_serial, &payload)
}

/// Validate the envelope and split out its fields.
pub fn decode_frame(buf: &[u8]) -> Result<V5Frame<'_>> {
    if buf.len() < HEADER_LEN + TRAILER_LEN {
        return Err(PowerwatchError::protocol(format!(
            "V5 frame too short: {} bytes",
            buf.len()
        )));
    }
    if buf[0] != START || buf[buf.len() - 1] != END {
        return Err(PowerwatchError::protocol("V5 frame has invalid start or end byte"));
    }

    let payload_len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    if buf.len() != HEADER_LEN + payload_len + TRAILER_LEN {
        return Err(PowerwatchError::protocol(format!(
            "V5 frame length mismatch: header says {} payload bytes, got {} total",
            payload_len,
            buf.len()
        )));
    }

    let expected = checksum(&buf[1..buf.len() - 2]);
    if buf[buf.len() - 2] != expected {
        return Err(PowerwatchError::protocol("V5 frame checksum mismatch"));
    }

    Ok(V5Frame {
        control: u16::from_le_bytes([buf[3], buf[4]]),
        sequence: buf[5],
        logger_serial: u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]),
        payload: &buf[HEADER_LEN..HEADER_LEN + payload_len],
    })
}

/// Extract the RTU frame from a response envelope.
pub fn response_rtu<'a>(frame: &V5Frame<'a>) -> Result<&'a [u8]> {
    if frame.control != CONTROL_RESPONSE {
        return Err(PowerwatchError::protocol(format!(
            "Unexpected V5 control code {:#06x}",
            frame.control
        )));
    }
    if frame.payload.len() <= RESPONSE_PREFIX_LEN || frame.payload[0] != FRAME_TYPE_INVERTER {
        return Err(PowerwatchError::protocol(
            "V5 response carries no inverter payload",
        ));
    }
    Ok(&frame.payload[RESPONSE_PREFIX_LEN..])
}

/// Read one complete V5 frame from `reader`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut head = [0u8; 3];
    reader.read_exact(&mut head).await?;
    if head[0] != START {
        return Err(PowerwatchError::protocol(format!(
            "V5 stream out of sync: first byte {:#04x}",
            head[0]
        )));
    }
    let payload_len = u16::from_le_bytes([head[1], head[2]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(PowerwatchError::protocol(format!(
            "V5 payload length {} exceeds limit",
            payload_len
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload_len + TRAILER_LEN);
    frame.extend_from_slice(&head);
    frame.resize(HEADER_LEN + payload_len + TRAILER_LEN, 0);
    reader.read_exact(&mut frame[head.len()..]).await?;
    Ok(frame)
}

/// Solarman V5 client for one data logger
pub struct SolarmanTransport {
    address: String,
    logger_serial: u32,
    unit_id: u8,
    sequence: u8,
    stream: Option<TcpStream>,
    logger: StructuredLogger,
}

impl SolarmanTransport {
    pub fn new(ip: &str, port: u16, logger_serial: u32, unit_id: u8) -> Self {
        let address = format!("{}:{}", ip, port);
        let logger = get_logger_with_context(
            LogContext::new("solarman")
                .with_device(address.clone())
                .with_field("serial", logger_serial.to_string()),
        );
        Self {
            address,
            logger_serial,
            unit_id,
            sequence: 0,
            stream: None,
            logger,
        }
    }

    fn next_sequence(&mut self) -> u8 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }
}

#[async_trait]
impl RegisterTransport for SolarmanTransport {
    async fn connect(&mut self) -> Result<()> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.logger.debug("Connected to data logger");
        Ok(())
    }

    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let sequence = self.next_sequence();
        let request = encode_request(
            self.logger_serial,
            sequence,
            &rtu::read_holding_request(self.unit_id, address, count),
        );
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PowerwatchError::connection_refused("Data logger not connected"))?;

        stream.write_all(&request).await?;

        for _ in 0..MAX_UNSOLICITED_FRAMES {
            let buf = read_frame(stream).await?;
            let frame = decode_frame(&buf)?;
            if frame.control != CONTROL_RESPONSE {
                self.logger.trace(&format!(
                    "Skipping unsolicited frame with control {:#06x}",
                    frame.control
                ));
                continue;
            }
            if frame.sequence != sequence {
                return Err(PowerwatchError::protocol(format!(
                    "V5 sequence mismatch: sent {}, got {}",
                    sequence, frame.sequence
                )));
            }
            return rtu::parse_read_response(response_rtu(&frame)?, self.unit_id, count);
        }

        Err(PowerwatchError::protocol(
            "No response frame among unsolicited logger traffic",
        ))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already have dropped the socket
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn endpoint(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIAL: u32 = 2_712_345_678;

    #[test]
    fn test_request_layout() {
        let rtu = rtu::read_holding_request(1, 587, 1);
        let frame = encode_request(SERIAL, 7, &rtu);

        assert_eq!(frame[0], START);
        assert_eq!(u16::from_le_bytes([frame[1], frame[2]]) as usize, 15 + rtu.len());
        assert_eq!(&frame[3..5], &[0x10, 0x45]);
        assert_eq!(frame[5], 7);
        assert_eq!(&frame[7..11], &SERIAL.to_le_bytes());
        assert_eq!(frame[11], FRAME_TYPE_INVERTER);
        assert_eq!(&frame[26..26 + rtu.len()], rtu.as_slice());
        assert_eq!(*frame.last().unwrap(), END);
        assert_eq!(frame.len(), 13 + 15 + rtu.len());
    }

    #[test]
    fn test_response_decode() {
        let rtu = rtu::read_holding_response(1, &[5312]);
        let buf = encode_response(SERIAL, 9, &rtu);
        let frame = decode_frame(&buf).unwrap();
        assert_eq!(frame.control, CONTROL_RESPONSE);
        assert_eq!(frame.sequence, 9);
        assert_eq!(frame.logger_serial, SERIAL);
        assert_eq!(response_rtu(&frame).unwrap(), rtu.as_slice());
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let rtu = rtu::read_holding_response(1, &[1]);
        let good = encode_response(SERIAL, 1, &rtu);

        let mut bad_sum = good.clone();
        let idx = bad_sum.len() - 2;
        bad_sum[idx] = bad_sum[idx].wrapping_add(1);
        assert!(decode_frame(&bad_sum).is_err());

        let mut bad_end = good.clone();
        let idx = bad_end.len() - 1;
        bad_end[idx] = 0x00;
        assert!(decode_frame(&bad_end).is_err());

        assert!(decode_frame(&good[..good.len() - 1]).is_err());

        // A request is not a response
        let request = encode_request(SERIAL, 1, &rtu);
        let frame = decode_frame(&request).unwrap();
        assert!(response_rtu(&frame).is_err());
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let rtu = rtu::read_holding_response(1, &[1, 2, 3]);
        let bytes = encode_response(SERIAL, 3, &rtu);
        let mut reader: &[u8] = &bytes;
        let frame = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame, bytes);

        let mut junk: &[u8] = &[0x00, 0x01, 0x02];
        assert!(read_frame(&mut junk).await.is_err());
    }
}
