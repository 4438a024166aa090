//! Connection management
//!
//! [`SerialChannel`] owns the single open serial handle. Every touch of the
//! handle (open, close, read, write) goes through one mutex, so a close can
//! never race an outstanding read or write.

use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::transport::{PortOpener, SystemPorts, Transport};
use super::{
    list_ports, PortDescriptor, Result, SerialError, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS,
    MAX_READ_CHUNK,
};
use crate::events::{EventHub, SubscriptionId};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No open handle
    Disconnected,
    /// Handle open and usable
    Connected,
}

/// Notifications published by the channel and its read loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    /// Connection opened (`true`) or closed (`false`)
    ConnectionChanged(bool),
    /// Raw bytes read from the device, in arrival order
    DataReceived(Vec<u8>),
    /// Human-readable error message
    Error(String),
}

/// Connection configuration
///
/// Framing is always 8 data bits, no parity, 1 stop bit, no flow control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Upper bound for a single read, in milliseconds
    pub read_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

impl ConnectionConfig {
    /// Configuration for `port_name` at `baud_rate` with the default read timeout
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Self::default()
        }
    }

    /// Override the read timeout
    pub fn with_read_timeout(mut self, read_timeout_ms: u64) -> Self {
        self.read_timeout_ms = read_timeout_ms;
        self
    }

    /// Reject configurations no device could accept
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(SerialError::InvalidConfig(
                "baud rate must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cumulative byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    /// Bytes handed to the device
    pub tx_bytes: u64,
    /// Bytes read from the device
    pub rx_bytes: u64,
}

struct Inner {
    config: Option<ConnectionConfig>,
    port: Option<Box<dyn Transport>>,
    state: ConnectionState,
}

/// A single serial connection
pub struct SerialChannel {
    opener: Arc<dyn PortOpener>,
    inner: Mutex<Inner>,
    events: EventHub<SerialEvent>,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

impl Default for SerialChannel {
    fn default() -> Self {
        Self::new(Arc::new(SystemPorts))
    }
}

impl SerialChannel {
    /// Create a closed channel that opens devices through `opener`
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            inner: Mutex::new(Inner {
                config: None,
                port: None,
                state: ConnectionState::Disconnected,
            }),
            events: EventHub::new(),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
        }
    }

    /// List available serial ports
    pub fn list_ports() -> Vec<PortDescriptor> {
        list_ports()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the configuration used by the next [`open`](Self::open)
    pub fn configure(&self, config: ConnectionConfig) -> Result<()> {
        config.validate()?;
        self.lock().config = Some(config);
        Ok(())
    }

    /// Current configuration, if any
    pub fn config(&self) -> Option<ConnectionConfig> {
        self.lock().config.clone()
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Check if the channel is connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Get cumulative tx/rx byte counters
    pub fn counters(&self) -> TrafficCounters {
        TrafficCounters {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
        }
    }

    /// Register a callback for channel events
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Remove a callback registered with [`subscribe`](Self::subscribe)
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub(crate) fn emit(&self, event: SerialEvent) {
        self.events.emit(&event);
    }

    /// Open the configured device, closing any handle already open
    pub fn open(&self) -> Result<()> {
        let mut inner = self.lock();
        let replaced = inner.port.take().is_some();
        inner.state = ConnectionState::Disconnected;

        let outcome = match inner.config.clone() {
            None => Err(SerialError::InvalidConfig("no port configured".to_string())),
            Some(config) => self.opener.open(&config).map(|port| {
                inner.port = Some(port);
                inner.state = ConnectionState::Connected;
                config
            }),
        };
        drop(inner);

        if replaced {
            tracing::debug!("open: closed previous handle before reopening");
            self.emit(SerialEvent::ConnectionChanged(false));
        }

        match outcome {
            Ok(config) => {
                tracing::info!(
                    "Connected to {} at {} baud",
                    config.port_name,
                    config.baud_rate
                );
                self.emit(SerialEvent::ConnectionChanged(true));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("open failed: {}", e);
                self.emit(SerialEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Release the handle; safe to call repeatedly
    pub fn close(&self) {
        let port = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Disconnected && inner.port.is_none() {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.port.take()
        };

        // Dropping the handle closes it; nothing left to report on failure
        drop(port);
        tracing::info!("Serial port closed");
        self.emit(SerialEvent::ConnectionChanged(false));
    }

    /// Read whatever the OS has buffered, possibly nothing
    ///
    /// Waits at most the configured read timeout. Only a broken handle is an
    /// error; "no data yet" is an empty vector.
    pub fn read_available(&self) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        let port = inner.port.as_mut().ok_or(SerialError::NotConnected)?;

        let available = port
            .bytes_to_read()
            .map_err(|e| SerialError::Read(e.to_string()))? as usize;
        if available == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; available.min(MAX_READ_CHUNK)];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                self.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
                Ok(buf)
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(SerialError::Read(e.to_string())),
        }
    }

    /// Write all of `data` or fail
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let result = {
            let mut inner = self.lock();
            match inner.port.as_mut() {
                None => Err(SerialError::NotConnected),
                Some(port) => port
                    .write_all(data)
                    .map_err(|e| SerialError::Write(e.to_string())),
            }
        };

        match &result {
            Ok(()) => {
                self.tx_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                tracing::debug!("write: sent {} bytes", data.len());
            }
            Err(e) => {
                tracing::warn!("write failed: {}", e);
                self.emit(SerialEvent::Error(e.to_string()));
            }
        }
        result
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.close();
    }
}
