use log::info;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use super::TransportError;

/// Opens the byte channel to the meter.
///
/// The coordinator calls this lazily and again after every transport error,
/// so implementations must be able to open the channel more than once.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> Result<Self::Stream, TransportError>;
}

/// Serial port (or optical head) settings of a Kamstrup meter: 8N2.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(port: &str, baud_rate: u32) -> Self {
        return SerialConnector {
            port: port.to_string(),
            baud_rate,
        };
    }
}

impl Connector for SerialConnector {
    type Stream = SerialStream;

    fn connect(&self) -> Result<SerialStream, TransportError> {
        info!("Opening serial port {} with {} baud", self.port, self.baud_rate);

        tokio_serial::new(self.port.as_str(), self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::Two)
            .open_native_async()
            .map_err(|source| TransportError::Open {
                port: self.port.clone(),
                source,
            })
    }
}
