//! Terminal settings and their persistence
//!
//! [`TerminalSettings`] is a plain value handed around explicitly; reading and
//! writing it is the job of a [`SettingsStore`] chosen by the front end.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::dispatch::LineEnding;
use crate::history::CommandHistory;
use crate::serial::{ConnectionConfig, Result, SerialError, DEFAULT_BAUD_RATE};

/// Default pause between batch lines in milliseconds
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 100;

/// Largest accepted batch interval in milliseconds
pub const MAX_BATCH_INTERVAL_MS: u64 = 10_000;

/// Everything the terminal remembers between sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSettings {
    /// Last used port
    #[serde(default)]
    pub port: Option<String>,

    /// Last used baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Terminator for sent lines
    #[serde(default)]
    pub line_ending: LineEnding,

    /// Contents of the batch editor
    #[serde(default)]
    pub batch_content: String,

    /// Pause between batch lines
    #[serde(default = "default_batch_interval")]
    pub batch_interval_ms: u64,

    /// Sent commands, most recent first
    #[serde(default)]
    pub history: CommandHistory,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_batch_interval() -> u64 {
    DEFAULT_BATCH_INTERVAL_MS
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            line_ending: LineEnding::default(),
            batch_content: String::new(),
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            history: CommandHistory::new(),
        }
    }
}

impl TerminalSettings {
    /// Connection configuration for the remembered port, if there is one
    pub fn connection_config(&self) -> Option<ConnectionConfig> {
        self.port
            .as_ref()
            .map(|port| ConnectionConfig::new(port.clone(), self.baud_rate))
    }

    /// Set the batch interval, clamped to the accepted range
    pub fn set_batch_interval(&mut self, interval_ms: u64) {
        self.batch_interval_ms = interval_ms.min(MAX_BATCH_INTERVAL_MS);
    }
}

/// Loads and saves [`TerminalSettings`]
pub trait SettingsStore: Send + Sync {
    /// Read stored settings; absent settings yield defaults
    fn load(&self) -> Result<TerminalSettings>;

    /// Persist `settings`
    fn save(&self, settings: &TerminalSettings) -> Result<()>;
}

/// Settings kept as pretty-printed JSON in a single file
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store in the per-user config directory
    pub fn default_location() -> io::Result<Self> {
        let base = dirs::config_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "Could not find config directory")
        })?;
        Ok(Self::new(base.join("simplecom").join("settings.json")))
    }

    /// File backing this store
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<TerminalSettings> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No settings at {}, using defaults", self.path.display());
                return Ok(TerminalSettings::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|e| {
            SerialError::Settings(format!("{}: {}", self.path.display(), e))
        })
    }

    fn save(&self, settings: &TerminalSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| SerialError::Settings(e.to_string()))?;
        fs::write(&self.path, content)?;
        tracing::debug!("Saved settings to {}", self.path.display());
        Ok(())
    }
}

/// Settings kept in memory only
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    stored: Mutex<Option<TerminalSettings>>,
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<TerminalSettings> {
        Ok(self
            .stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default())
    }

    fn save(&self, settings: &TerminalSettings) -> Result<()> {
        *self.stored.lock().unwrap_or_else(PoisonError::into_inner) = Some(settings.clone());
        Ok(())
    }
}
