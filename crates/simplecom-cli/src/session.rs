//! A connected terminal session
//!
//! Wires the channel, read loop, stamper and dispatch queue together and
//! routes their notifications to the console: received data to stdout,
//! status and errors to stderr.

use anyhow::{Context, Result};
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use simplecom_core::demo::LoopbackDevice;
use simplecom_core::dispatch::{DispatchEvent, DispatchQueue, LineEnding};
use simplecom_core::history::CommandHistory;
use simplecom_core::serial::{
    ConnectionSupervisor, PortOpener, SerialChannel, SerialEvent, SystemPorts,
};
use simplecom_core::settings::TerminalSettings;
use simplecom_core::stamper::ReceiveStamper;

pub struct Session {
    supervisor: ConnectionSupervisor,
    queue: DispatchQueue,
    history: Arc<Mutex<CommandHistory>>,
    stamper: Arc<Mutex<ReceiveStamper>>,
}

impl Session {
    /// Connect using the port and baud rate in `settings`
    pub fn connect(settings: &TerminalSettings, demo: Option<LoopbackDevice>) -> Result<Self> {
        let config = settings
            .connection_config()
            .context("no port selected; pass --port or run `simplecom ports`")?;

        let opener: Arc<dyn PortOpener> = match demo {
            Some(device) => Arc::new(device.opener()),
            None => Arc::new(SystemPorts),
        };
        let channel = Arc::new(SerialChannel::new(opener));
        let supervisor = ConnectionSupervisor::new(Arc::clone(&channel));

        let stamper = Arc::new(Mutex::new(ReceiveStamper::new()));
        let display = Arc::clone(&stamper);
        supervisor.subscribe(move |event| match event {
            SerialEvent::DataReceived(bytes) => {
                let text = display
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_bytes(bytes);
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            SerialEvent::Error(msg) => eprintln!("Error: {}", msg),
            SerialEvent::ConnectionChanged(false) => eprintln!("Disconnected"),
            SerialEvent::ConnectionChanged(true) => {}
        });

        let history = Arc::new(Mutex::new(settings.history.clone()));
        let queue = DispatchQueue::new(channel, Arc::clone(&history), Handle::current());
        queue.subscribe(|event| eprintln!("{}", event));

        supervisor
            .connect(config.clone())
            .with_context(|| format!("connecting to {}", config.port_name))?;
        eprintln!(
            "Connected to {} at {} baud",
            config.port_name, config.baud_rate
        );

        Ok(Self {
            supervisor,
            queue,
            history,
            stamper,
        })
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.channel().is_connected()
    }

    /// Send a batch and wait until it completes, stops or aborts
    ///
    /// Returns the final event, or `None` if there was nothing to send.
    pub async fn send_batch(
        &self,
        text: &str,
        line_ending: LineEnding,
        interval_ms: u64,
    ) -> Result<Option<DispatchEvent>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.queue.subscribe(move |event| {
            if matches!(
                event,
                DispatchEvent::Completed { .. } | DispatchEvent::Stopped | DispatchEvent::Aborted(_)
            ) {
                let _ = tx.send(event.clone());
            }
        });

        let queued = self.queue.start(text, line_ending, interval_ms);
        let outcome = match queued {
            Ok(0) => Ok(None),
            Ok(_) => Ok(rx.recv().await),
            Err(e) => Err(e.into()),
        };
        self.queue.unsubscribe(subscription);
        outcome
    }

    /// Start a new display page; the next received character is stamped
    pub fn clear_display(&self) {
        self.stamper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Stop the read loop, close the port and hand back the updated history
    pub fn close(self) -> CommandHistory {
        self.queue.stop();
        self.supervisor.disconnect();
        let mut out = std::io::stdout().lock();
        let tail = self
            .stamper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush();
        let _ = out.write_all(tail.as_bytes());
        let _ = out.flush();
        drop(out);

        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.clone()
    }
}
