//! A scripted Kamstrup meter used by unit tests in place of a serial port.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::frame::{self, FRAME_END, RESPONSE_START};
use super::transport::Connector;
use super::TransportError;

/// What the meter does when a register is requested.
#[derive(Clone, Debug)]
pub enum Reply {
    /// A valid answer with unit code, sign/exponent byte and mantissa
    Value { unit: u8, siex: u8, mantissa: Vec<u8> },
    /// Raw bytes put on the wire as they are
    Raw(Vec<u8>),
    /// No answer at all
    Silent,
    /// The port fails while reading
    Broken,
}

impl Reply {
    pub fn value(unit: u8, siex: u8, mantissa: u32) -> Self {
        Reply::Value { unit, siex, mantissa: mantissa.to_be_bytes().to_vec() }
    }
}

#[derive(Default)]
struct MeterState {
    replies: HashMap<u16, Reply>,
    /// Registers in the order they were requested
    requests: Vec<u16>,
    connects: usize,
    fail_connect: bool,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    broken: bool,
}

/// Cloning hands out another view on the same meter.
#[derive(Clone, Default)]
pub struct MockMeter {
    state: Arc<Mutex<MeterState>>,
}

pub struct MockStream {
    state: Arc<Mutex<MeterState>>,
}

impl MockMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reply(&self, command: u16, reply: Reply) {
        self.state.lock().unwrap().replies.insert(command, reply);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().unwrap().fail_connect = fail;
    }

    pub fn requests(&self) -> Vec<u16> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }
}

impl Connector for MockMeter {
    type Stream = MockStream;

    fn connect(&self) -> Result<MockStream, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connect {
            return Err(TransportError::Io(io::Error::new(io::ErrorKind::NotFound, "no such port")));
        }

        state.connects += 1;
        state.broken = false;
        state.tx.clear();
        Ok(MockStream { state: self.state.clone() })
    }
}

impl MeterState {
    fn handle_request(&mut self) {
        let request = std::mem::take(&mut self.rx);
        let body = frame::decode(&request[1..request.len() - 1]).expect("mock meter got a corrupted request");
        let command = u16::from_be_bytes([body[3], body[4]]);
        self.requests.push(command);

        match self.replies.get(&command).cloned().unwrap_or(Reply::Silent) {
            Reply::Value { unit, siex, mantissa } => {
                let [hi, lo] = command.to_be_bytes();
                let mut body = vec![0x3f, 0x10, hi, lo, unit, mantissa.len() as u8, siex];
                body.extend(mantissa);
                self.tx.extend(frame::encode(RESPONSE_START, &body));
            }
            Reply::Raw(bytes) => self.tx.extend(bytes),
            Reply::Silent => {}
            Reply::Broken => self.broken = true,
        }
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock().unwrap();
        for &byte in buf {
            state.rx.push(byte);
            if byte == FRAME_END {
                state.handle_request();
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for MockStream {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock().unwrap();
        if state.broken {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected")));
        }

        /* A silent meter never wakes the reader, the codec timeout does */
        if state.tx.is_empty() {
            return Poll::Pending;
        }

        while buf.remaining() > 0 {
            match state.tx.pop_front() {
                Some(byte) => buf.put_slice(&[byte]),
                None => break,
            }
        }
        Poll::Ready(Ok(()))
    }
}
