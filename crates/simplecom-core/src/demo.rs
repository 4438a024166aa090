//! Demo Mode - In-memory loopback device
//!
//! Stands in for a real serial adapter so the terminal can run (and be tested)
//! without hardware. Bytes written to the port are recorded and, in echo mode,
//! fed straight back to the receive side. Faults can be armed to exercise the
//! open/read/write error paths.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::serial::{ConnectionConfig, PortOpener, Result, SerialError, Transport};

#[derive(Debug, Default)]
struct DeviceState {
    /// Bytes waiting to be read by the host
    inbound: VecDeque<u8>,
    /// Every byte accepted from the host
    written: Vec<u8>,
    /// Each successful write call, in order
    writes: Vec<Vec<u8>>,
    echo: bool,
    open: bool,
    open_count: usize,
    last_config: Option<ConnectionConfig>,
    fail_next_open: Option<String>,
    read_failure: Option<String>,
    write_failure: Option<String>,
    /// Largest slice a single write call accepts
    max_write_chunk: Option<usize>,
    /// Remaining bytes before writes start returning 0
    write_capacity: Option<usize>,
}

/// Handle to a simulated serial device
///
/// Clones share the same device.
#[derive(Debug, Clone, Default)]
pub struct LoopbackDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl LoopbackDevice {
    /// A silent device that only records writes
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that sends every written byte back
    pub fn echoing() -> Self {
        let device = Self::new();
        device.lock().echo = true;
        device
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opener that hands out ports backed by this device
    pub fn opener(&self) -> LoopbackOpener {
        LoopbackOpener {
            device: self.clone(),
        }
    }

    /// Queue bytes as if the device had transmitted them
    pub fn inject(&self, data: &[u8]) {
        self.lock().inbound.extend(data.iter().copied());
    }

    /// All bytes written by the host so far
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Individual write calls made by the host
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Whether a port is currently open on this device
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// How many times the device has been opened
    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    /// Configuration used by the most recent open
    pub fn last_config(&self) -> Option<ConnectionConfig> {
        self.lock().last_config.clone()
    }

    /// Make the next open fail with `reason`
    pub fn fail_next_open(&self, reason: &str) {
        self.lock().fail_next_open = Some(reason.to_string());
    }

    /// Make reads fail (`Some`) or succeed again (`None`)
    pub fn set_read_failure(&self, reason: Option<&str>) {
        self.lock().read_failure = reason.map(str::to_string);
    }

    /// Make writes fail (`Some`) or succeed again (`None`)
    pub fn set_write_failure(&self, reason: Option<&str>) {
        self.lock().write_failure = reason.map(str::to_string);
    }

    /// Limit how many bytes a single write call accepts
    pub fn set_max_write_chunk(&self, chunk: Option<usize>) {
        self.lock().max_write_chunk = chunk;
    }

    /// Accept only `capacity` more bytes, then report zero-length writes
    pub fn set_write_capacity(&self, capacity: Option<usize>) {
        self.lock().write_capacity = capacity;
    }
}

/// [`PortOpener`] for a [`LoopbackDevice`]
#[derive(Debug, Clone)]
pub struct LoopbackOpener {
    device: LoopbackDevice,
}

impl PortOpener for LoopbackOpener {
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>> {
        let mut state = self.device.lock();
        if let Some(reason) = state.fail_next_open.take() {
            return Err(SerialError::Open {
                port: config.port_name.clone(),
                reason,
            });
        }
        state.open = true;
        state.open_count += 1;
        state.last_config = Some(config.clone());
        drop(state);

        Ok(Box::new(LoopbackPort {
            device: self.device.clone(),
        }))
    }
}

struct LoopbackPort {
    device: LoopbackDevice,
}

impl Read for LoopbackPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.device.lock();
        if let Some(reason) = &state.read_failure {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, reason.clone()));
        }
        if state.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"));
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for LoopbackPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.device.lock();
        if let Some(reason) = &state.write_failure {
            return Err(io::Error::other(reason.clone()));
        }

        let mut n = buf.len();
        if let Some(chunk) = state.max_write_chunk {
            n = n.min(chunk);
        }
        if let Some(capacity) = state.write_capacity.as_mut() {
            n = n.min(*capacity);
            *capacity -= n;
        }
        if n == 0 {
            return Ok(0);
        }

        let accepted = &buf[..n];
        state.written.extend_from_slice(accepted);
        state.writes.push(accepted.to_vec());
        if state.echo {
            state.inbound.extend(accepted.iter().copied());
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for LoopbackPort {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        let state = self.device.lock();
        if let Some(reason) = &state.read_failure {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, reason.clone()));
        }
        Ok(state.inbound.len() as u32)
    }
}

impl Drop for LoopbackPort {
    fn drop(&mut self) {
        self.device.lock().open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_round_trip() {
        let device = LoopbackDevice::echoing();
        let mut port = device
            .opener()
            .open(&ConnectionConfig::new("loop0", 115200))
            .unwrap();

        port.write_all(b"ping").unwrap();
        assert_eq!(port.bytes_to_read().unwrap(), 4);

        let mut buf = [0u8; 8];
        let n = port.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_empty_read_times_out() {
        let device = LoopbackDevice::new();
        let mut port = device
            .opener()
            .open(&ConnectionConfig::new("loop0", 115200))
            .unwrap();

        let mut buf = [0u8; 8];
        let err = port.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_drop_closes_device() {
        let device = LoopbackDevice::new();
        let port = device
            .opener()
            .open(&ConnectionConfig::new("loop0", 115200))
            .unwrap();
        assert!(device.is_open());
        drop(port);
        assert!(!device.is_open());
    }

    #[test]
    fn test_fail_next_open_is_one_shot() {
        let device = LoopbackDevice::new();
        device.fail_next_open("permission denied");
        let config = ConnectionConfig::new("loop0", 115200);

        assert!(device.opener().open(&config).is_err());
        assert!(device.opener().open(&config).is_ok());
        assert_eq!(device.open_count(), 1);
    }
}
