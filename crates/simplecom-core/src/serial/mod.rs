//! Serial Port Communication
//!
//! Owns the connection to a single serial device: enumeration, open/close,
//! non-blocking reads, writes and the background read loop.

mod channel;
mod error;
pub mod ports;
mod supervisor;
pub mod transport;

pub use channel::{ConnectionConfig, ConnectionState, SerialChannel, SerialEvent, TrafficCounters};
pub use error::{Result, SerialError};
pub use ports::{list_ports, PortDescriptor};
pub use supervisor::ConnectionSupervisor;
pub use transport::{PortOpener, SerialTransport, SystemPorts, Transport};

/// Default baud rate for new connections
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Baud rates offered to the user
pub const COMMON_BAUD_RATES: &[u32] = &[
    9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

/// Default read timeout in milliseconds
///
/// Bounds how long a single read waits, which in turn bounds how long the
/// read loop can hold the port.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Pause between read-loop polls in milliseconds
pub const POLL_INTERVAL_MS: u64 = 10;

/// Largest chunk pulled from the OS in one read
pub const MAX_READ_CHUNK: usize = 4096;
