//! Command history
//!
//! Most-recent-first list of sent commands. Sending a command that is already
//! in the list moves it to the front instead of duplicating it.

use serde::{Deserialize, Serialize};

/// Maximum number of remembered commands
pub const MAX_HISTORY: usize = 100;

/// Sent-command history, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandHistory {
    entries: Vec<String>,
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandHistory {
    /// Create an empty history
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a history from persisted entries (newest first)
    ///
    /// Duplicates keep their first (newest) position; the list is capped at
    /// [`MAX_HISTORY`].
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut history = Self::new();
        for entry in entries {
            let entry = entry.into();
            if history.entries.len() >= MAX_HISTORY {
                break;
            }
            if !history.entries.contains(&entry) {
                history.entries.push(entry);
            }
        }
        history
    }

    /// Record a sent command
    pub fn record(&mut self, command: &str) {
        if let Some(pos) = self.entries.iter().position(|e| e == command) {
            let existing = self.entries.remove(pos);
            self.entries.insert(0, existing);
            return;
        }
        self.entries.insert(0, command.to_string());
        self.entries.truncate(MAX_HISTORY);
    }

    /// Remove the entries at `indices`; out-of-range indices are ignored
    pub fn remove(&mut self, indices: &[usize]) {
        let mut sorted: Vec<usize> = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        for index in sorted.into_iter().rev() {
            if index < self.entries.len() {
                self.entries.remove(index);
            }
        }
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries, newest first
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Most recent command
    /// Most recently sent command
    pub fn latest(&self) -> Option<&str> {
        self.entries.first().map(String::as_str)
    }

    /// Number of remembered commands
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been sent yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
