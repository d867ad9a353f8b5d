//! Native serial port transport over the `serialport` crate.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::{Options, Programmer, Transport};

/// Default deadline for bootloader answers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

/// Errors from the native serial transport.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    /// Port enumeration, configuration or open failure.
    #[error("serial port error: {0}")]
    Port(#[from] serialport::Error),

    /// Read/write failure, including timeouts and short reads.
    #[error("serial i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The port has not been opened yet.
    #[error("serial port is not open")]
    NotOpen,
}

/// Serial port transport.
///
/// The bootloader talks 8 data bits, even parity, 1 stop bit. The port
/// itself is opened by [`Transport::open`], so a programmer can be built
/// before the adapter is plugged in.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Transport for the port at `path`.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> SerialTransport {
        SerialTransport {
            path: path.into(),
            baud_rate,
            timeout: DEFAULT_TIMEOUT,
            port: None,
        }
    }

    /// Replace the read/write deadline (250 ms by default).
    pub fn timeout(mut self, timeout: Duration) -> SerialTransport {
        self.timeout = timeout;
        self
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, SerialError> {
        self.port.as_mut().ok_or(SerialError::NotOpen)
    }
}

impl Transport<SerialError> for SerialTransport {
    fn open(&mut self) -> Result<(), SerialError> {
        if self.port.is_none() {
            let port = serialport::new(self.path.as_str(), self.baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::Even)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(self.timeout)
                .open()?;

            info!("opened {} at {} baud", self.path, self.baud_rate);
            self.port = Some(port);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SerialError> {
        // Dropping the handle releases the device.
        self.port = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn clear_buffers(&mut self) -> Result<(), SerialError> {
        self.port_mut()?.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), SerialError> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), SerialError> {
        self.port_mut()?.read_exact(buf)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), SerialError> {
        self.port_mut()?.write_request_to_send(level)?;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), SerialError> {
        self.port_mut()?.write_data_terminal_ready(level)?;
        Ok(())
    }
}

impl Programmer<SerialTransport, SerialError> {
    /// Open the serial port at `path` and return a programmer over it.
    pub fn serial(path: &str, baud_rate: u32, options: Options) -> Result<Self, SerialError> {
        let mut transport = SerialTransport::new(path, baud_rate);
        transport.open()?;
        Ok(Programmer::new(transport, options))
    }
}
