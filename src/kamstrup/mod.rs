//! Kamstrup meter protocol: one register request, one response.
//!
//! Request and response are framed by a start byte and `0x0d`, carry a
//! CRC-16/XMODEM and are byte stuffed. See [`frame`] for the details.

use log::{debug, warn};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod frame;
pub mod registers;
pub mod transport;
pub mod units;

#[cfg(test)]
pub(crate) mod mock_meter;

use frame::{FRAME_END, REQUEST_START, RESPONSE_START};

const DESTINATION: u8 = 0x3f;
const CID_GET_REGISTER: u8 = 0x10;
/* Header of a response body: destination, cid, register (2), unit, length, sign/exponent */
const RESPONSE_HEADER_LEN: usize = 7;
const MAX_MANTISSA_LEN: usize = 8;
/* Longest stuffed frame we accept before calling it garbage */
const MAX_FRAME_LEN: usize = 64;

/// The meter could not be reached or did not answer in time.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unable to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("No complete response within {0:?}")]
    Timeout(Duration),
    #[error("Serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The meter answered but the answer is not usable.
#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("Frame ends in the middle of an escape sequence")]
    DanglingEscape,
    #[error("Frame too short ({len} bytes)")]
    Truncated { len: usize },
    #[error("Frame exceeds the maximum frame length")]
    FrameTooLong,
    #[error("CRC mismatch (remainder {remainder:#06x})")]
    CrcMismatch { remainder: u16 },
    #[error("Unexpected response header {destination:#04x} {cid:#04x}")]
    UnexpectedHeader { destination: u8, cid: u8 },
    #[error("Requested register {requested:#06x} but got {received:#06x}")]
    RegisterMismatch { requested: u16, received: u16 },
    #[error("Mantissa of {declared} bytes does not fit, {available} bytes available")]
    MantissaLength { declared: usize, available: usize },
    #[error("Unknown unit code {0}")]
    UnknownUnit(u8),
}

#[derive(Error, Debug)]
pub enum KamstrupError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub command: u16,
    pub value: f64,
    pub unit: String,
}

/// Codec for a single register exchange.
///
/// Holds no state between calls and never retries; the caller owns the
/// channel and decides what to do with a failure.
#[derive(Debug, Clone)]
pub struct Kamstrup {
    timeout: Duration,
}

impl Kamstrup {
    pub fn new(timeout: Duration) -> Self {
        return Kamstrup { timeout };
    }

    /// Requests `command` and decodes the answer.
    ///
    /// The request is always written and flushed completely before the
    /// response is awaited. Only reading the response is bounded by the
    /// timeout.
    pub async fn read_register<S>(&self, stream: &mut S, command: u16) -> Result<Reading, KamstrupError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let [reg_hi, reg_lo] = command.to_be_bytes();
        let request = frame::encode(REQUEST_START, &[DESTINATION, CID_GET_REGISTER, 0x01, reg_hi, reg_lo]);

        debug!("Requesting register {command:#06x}: {request:02x?}");
        stream.write_all(&request).await.map_err(TransportError::Io)?;
        stream.flush().await.map_err(TransportError::Io)?;

        let stuffed = match tokio::time::timeout(self.timeout, read_frame(stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(self.timeout).into()),
        };
        debug!("Response for register {command:#06x}: {stuffed:02x?}");

        let body = frame::decode(&stuffed)?;
        let reading = decode_register(command, &body)?;
        Ok(reading)
    }
}

/* Collects everything between the response start byte and the frame end, still stuffed */
async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, KamstrupError> {
    let mut buffer = Vec::new();
    let mut in_frame = false;

    loop {
        let byte = stream.read_u8().await.map_err(TransportError::Io)?;

        if byte == RESPONSE_START {
            if in_frame {
                debug!("Response start inside a frame, starting over");
            }
            buffer.clear();
            in_frame = true;
        } else if !in_frame {
            debug!("Discarding {byte:#04x} received outside of a frame");
        } else if byte == FRAME_END {
            return Ok(buffer);
        } else if buffer.len() == MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLong.into());
        } else {
            buffer.push(byte);
        }
    }
}

/// Decodes a response body (CRC already removed) for the requested register.
pub fn decode_register(command: u16, body: &[u8]) -> Result<Reading, ProtocolError> {
    if body.len() < RESPONSE_HEADER_LEN {
        return Err(ProtocolError::Truncated { len: body.len() });
    }

    if body[0] != DESTINATION || body[1] != CID_GET_REGISTER {
        return Err(ProtocolError::UnexpectedHeader { destination: body[0], cid: body[1] });
    }

    let received = u16::from_be_bytes([body[2], body[3]]);
    if received != command {
        return Err(ProtocolError::RegisterMismatch { requested: command, received });
    }

    let unit = units::unit_from_code(body[4]).ok_or(ProtocolError::UnknownUnit(body[4]))?;

    let declared = body[5] as usize;
    let available = body.len() - RESPONSE_HEADER_LEN;
    if declared > MAX_MANTISSA_LEN || declared > available {
        return Err(ProtocolError::MantissaLength { declared, available });
    }
    if available > declared {
        warn!("Register {command:#06x} carries {} trailing bytes", available - declared);
    }

    let mantissa = body[RESPONSE_HEADER_LEN..RESPONSE_HEADER_LEN + declared]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64);

    /* sign of the value in bit 7, sign of the exponent in bit 6, exponent in bit 0-5 */
    let siex = body[6];
    let scale = 10f64.powi((siex & 0x3f) as i32);
    let mut value = if siex & 0x40 != 0 {
        mantissa as f64 / scale
    } else {
        mantissa as f64 * scale
    };
    if siex & 0x80 != 0 {
        value = -value;
    }

    Ok(Reading {
        command,
        value,
        unit: unit.to_string(),
    })
}
