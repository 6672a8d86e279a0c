use crc16::{State, XMODEM};
use log::warn;

use super::ProtocolError;

/// Start byte of a frame sent to the meter.
pub const REQUEST_START: u8 = 0x80;
/// Start byte of a frame sent by the meter.
pub const RESPONSE_START: u8 = 0x40;
/// Every frame ends with a carriage return.
pub const FRAME_END: u8 = 0x0d;

const ESCAPE: u8 = 0x1b;
/* Bytes which may never show up unescaped between start and end byte */
const STUFFED: [u8; 5] = [0x06, FRAME_END, ESCAPE, RESPONSE_START, REQUEST_START];

pub fn crc(data: &[u8]) -> u16 {
    State::<XMODEM>::calculate(data)
}

fn needs_stuffing(byte: u8) -> bool {
    STUFFED.contains(&byte)
}

/// Builds a complete wire frame: start byte, stuffed body with its CRC, end byte.
pub fn encode(start: u8, body: &[u8]) -> Vec<u8> {
    let mut payload = body.to_vec();
    payload.extend_from_slice(&crc(body).to_be_bytes());

    let mut frame = Vec::with_capacity(payload.len() * 2 + 2);
    frame.push(start);
    for byte in payload {
        if needs_stuffing(byte) {
            frame.push(ESCAPE);
            frame.push(byte ^ 0xff);
        } else {
            frame.push(byte);
        }
    }
    frame.push(FRAME_END);

    return frame;
}

/// Reverses the byte stuffing of everything between the start and end byte
/// and checks the trailing CRC. The returned body does not contain the CRC.
pub fn decode(stuffed: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut payload = Vec::with_capacity(stuffed.len());

    let mut bytes = stuffed.iter();
    while let Some(&byte) = bytes.next() {
        if byte != ESCAPE {
            payload.push(byte);
            continue;
        }

        let escaped = match bytes.next() {
            Some(b) => b ^ 0xff,
            None => return Err(ProtocolError::DanglingEscape),
        };

        if !needs_stuffing(escaped) {
            warn!("Escaped byte {:#04x} is not in the stuffing set, accepting it anyway", escaped);
        }
        payload.push(escaped);
    }

    if payload.len() < 2 {
        return Err(ProtocolError::Truncated { len: payload.len() });
    }

    /* A CRC over data plus its own big endian CRC is always zero */
    let remainder = crc(&payload);
    if remainder != 0 {
        return Err(ProtocolError::CrcMismatch { remainder });
    }

    payload.truncate(payload.len() - 2);
    Ok(payload)
}
