//! Transport seam between [`SerialChannel`](super::SerialChannel) and the OS
//!
//! The channel never touches `serialport` directly; it asks a [`PortOpener`]
//! for a boxed [`Transport`]. This keeps the channel testable against the
//! in-memory device in [`crate::demo`].

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

use super::error::describe_open_error;
use super::{ConnectionConfig, Result, SerialError};

/// An open byte stream to a device
pub trait Transport: Read + Write + Send {
    /// Number of bytes buffered by the OS and ready to read
    fn bytes_to_read(&mut self) -> io::Result<u32>;
}

/// Opens transports for a connection configuration
pub trait PortOpener: Send + Sync {
    /// Open the device named in `config`
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>>;
}

/// Opens real serial devices through the `serialport` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>> {
        // 8N1, no flow control, short timeout so reads never park for long
        let port = serialport::new(&config.port_name, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .open()
            .map_err(|e| SerialError::Open {
                port: config.port_name.clone(),
                reason: describe_open_error(&e),
            })?;

        Ok(Box::new(SerialTransport::new(port)))
    }
}

/// Serial port wrapper implementing [`Transport`]
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Wrap an already opened port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::other)
    }
}
