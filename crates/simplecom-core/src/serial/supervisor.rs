//! Background read loop
//!
//! [`ConnectionSupervisor`] runs a dedicated OS thread that polls
//! [`SerialChannel::read_available`], publishes what it gets as
//! [`SerialEvent::DataReceived`], and turns a read failure into a forced
//! disconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{ConnectionConfig, Result, SerialChannel, SerialError, SerialEvent, POLL_INTERVAL_MS};
use crate::events::SubscriptionId;

struct ReadWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns the read loop for one [`SerialChannel`]
pub struct ConnectionSupervisor {
    channel: Arc<SerialChannel>,
    worker: Mutex<Option<ReadWorker>>,
    poll_interval: Duration,
}

impl ConnectionSupervisor {
    /// Supervise `channel` with the default poll interval
    pub fn new(channel: Arc<SerialChannel>) -> Self {
        Self::with_poll_interval(channel, Duration::from_millis(POLL_INTERVAL_MS))
    }

    /// Supervise `channel`, sleeping `poll_interval` between polls
    pub fn with_poll_interval(channel: Arc<SerialChannel>, poll_interval: Duration) -> Self {
        Self {
            channel,
            worker: Mutex::new(None),
            poll_interval,
        }
    }

    /// The supervised channel
    pub fn channel(&self) -> &Arc<SerialChannel> {
        &self.channel
    }

    /// Register a callback for channel and read-loop events
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        self.channel.subscribe(listener)
    }

    /// Remove a callback registered with [`subscribe`](Self::subscribe)
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.channel.unsubscribe(id)
    }

    fn worker(&self) -> MutexGuard<'_, Option<ReadWorker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the read loop is alive
    pub fn is_running(&self) -> bool {
        self.worker()
            .as_ref()
            .map(|w| w.running.load(Ordering::Acquire) && !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// Configure, open and start reading
    pub fn connect(&self, config: ConnectionConfig) -> Result<()> {
        self.stop();
        self.channel.configure(config)?;
        self.channel.open()?;
        self.start()
    }

    /// Stop reading and close the port
    pub fn disconnect(&self) {
        self.stop();
        self.channel.close();
    }

    /// Start the read loop; a no-op if it is already running
    pub fn start(&self) -> Result<()> {
        if !self.channel.is_connected() {
            return Err(SerialError::NotConnected);
        }

        let mut worker = self.worker();
        if let Some(existing) = worker.as_ref() {
            if existing.running.load(Ordering::Acquire) && !existing.handle.is_finished() {
                return Ok(());
            }
        }
        // A loop that exited on its own leaves a finished handle behind
        let stale = worker.take();

        let running = Arc::new(AtomicBool::new(true));
        let handle = thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn({
                let channel = Arc::clone(&self.channel);
                let running = Arc::clone(&running);
                let poll_interval = self.poll_interval;
                move || read_loop(channel, running, poll_interval)
            })?;

        *worker = Some(ReadWorker { running, handle });
        drop(worker);

        if let Some(stale) = stale {
            let _ = stale.handle.join();
        }
        Ok(())
    }

    /// Stop the read loop and wait for it to exit
    ///
    /// Once this returns (from any thread other than the loop itself), no
    /// further read-loop events are delivered. Called from inside the loop,
    /// e.g. from an event callback, it only requests termination.
    pub fn stop(&self) {
        let Some(worker) = self.worker().take() else {
            return;
        };
        worker.running.store(false, Ordering::Release);

        if worker.handle.thread().id() == thread::current().id() {
            return;
        }
        if worker.handle.join().is_err() {
            tracing::warn!("serial reader thread panicked");
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(channel: Arc<SerialChannel>, running: Arc<AtomicBool>, poll_interval: Duration) {
    tracing::debug!("read loop started");
    while running.load(Ordering::Acquire) {
        match channel.read_available() {
            Ok(data) if !data.is_empty() => {
                // Re-check so nothing is published once stop() has been requested
                if !running.load(Ordering::Acquire) {
                    break;
                }
                channel.emit(SerialEvent::DataReceived(data));
            }
            Ok(_) => {}
            Err(SerialError::NotConnected) => {
                tracing::debug!("read loop: channel closed underneath us");
                break;
            }
            Err(e) => {
                tracing::warn!("read loop: {}", e);
                running.store(false, Ordering::Release);
                channel.emit(SerialEvent::Error(e.to_string()));
                channel.close();
                break;
            }
        }
        thread::sleep(poll_interval);
    }
    running.store(false, Ordering::Release);
    tracing::debug!("read loop exited");
}
