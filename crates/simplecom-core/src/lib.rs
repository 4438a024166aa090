//! # SimpleCom Core Library
//!
//! Serial I/O and batch-dispatch engine for the SimpleCom serial terminal.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial port enumeration and a lock-guarded connection ([`serial`])
//! - A background read loop with synchronous stop ([`serial::ConnectionSupervisor`])
//! - Line timestamping over an arbitrarily chunked receive stream ([`stamper`])
//! - Paced, cancellable batch sending with line-ending framing ([`dispatch`])
//! - Command history and settings persistence behind an injected store
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::{Arc, Mutex};
//! use simplecom_core::prelude::*;
//!
//! let channel = Arc::new(SerialChannel::default());
//! let supervisor = ConnectionSupervisor::new(Arc::clone(&channel));
//!
//! let stamper = Mutex::new(ReceiveStamper::new());
//! supervisor.subscribe(move |event| {
//!     if let SerialEvent::DataReceived(bytes) = event {
//!         print!("{}", stamper.lock().unwrap().push_bytes(bytes));
//!     }
//! });
//! supervisor.connect(ConnectionConfig::new("/dev/ttyUSB0", 115200))?;
//!
//! let history = Arc::new(Mutex::new(CommandHistory::new()));
//! let queue = DispatchQueue::new(channel, history, tokio::runtime::Handle::current());
//! queue.start("AT\nAT+GMR\n", LineEnding::CrLf, 100)?;
//! ```

pub mod demo;
pub mod dispatch;
pub mod events;
pub mod history;
pub mod serial;
pub mod settings;
pub mod stamper;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::dispatch::{DispatchEvent, DispatchQueue, DispatchState, LineEnding};
    pub use crate::events::SubscriptionId;
    pub use crate::history::CommandHistory;
    pub use crate::serial::{
        list_ports, ConnectionConfig, ConnectionState, ConnectionSupervisor, PortDescriptor,
        SerialChannel, SerialError, SerialEvent,
    };
    pub use crate::settings::{JsonSettingsStore, SettingsStore, TerminalSettings};
    pub use crate::stamper::ReceiveStamper;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
