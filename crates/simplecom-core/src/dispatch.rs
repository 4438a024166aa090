//! Batch and single-line send
//!
//! [`DispatchQueue`] turns a multi-line command buffer into a series of
//! framed writes. The first line goes out immediately; the rest are paced by
//! the configured interval on a tokio task; with no interval the whole batch
//! is written by the call that starts it. At most one batch is active; a
//! stop or a disconnect cancels the schedule but never interrupts a write
//! already in progress.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::events::{EventHub, SubscriptionId};
use crate::history::CommandHistory;
use crate::serial::{Result, SerialChannel, SerialError, SerialEvent};

/// Terminator appended to every outgoing line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LineEnding {
    /// Nothing appended
    #[serde(rename = "None")]
    None,
    /// Carriage return
    #[serde(rename = "CR")]
    Cr,
    /// Line feed
    #[serde(rename = "LF")]
    Lf,
    /// Carriage return then line feed
    #[default]
    #[serde(rename = "CR+LF", alias = "CRLF")]
    CrLf,
}

impl LineEnding {
    /// Every mode, in the order offered to the user
    pub const ALL: [LineEnding; 4] = [
        LineEnding::None,
        LineEnding::Cr,
        LineEnding::Lf,
        LineEnding::CrLf,
    ];

    /// Bytes appended after each line
    pub fn terminator(self) -> &'static str {
        match self {
            LineEnding::None => "",
            LineEnding::Cr => "\r",
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }

    /// Display label
    pub fn label(self) -> &'static str {
        match self {
            LineEnding::None => "None",
            LineEnding::Cr => "CR",
            LineEnding::Lf => "LF",
            LineEnding::CrLf => "CR+LF",
        }
    }

    /// Encode `line` with this terminator
    pub fn frame(self, line: &str) -> Vec<u8> {
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(self.terminator().as_bytes());
        data
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for LineEnding {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" | "" => Ok(LineEnding::None),
            "CR" => Ok(LineEnding::Cr),
            "LF" => Ok(LineEnding::Lf),
            "CR+LF" | "CRLF" => Ok(LineEnding::CrLf),
            other => Err(SerialError::InvalidConfig(format!(
                "unknown line ending '{}'",
                other
            ))),
        }
    }
}

/// Split a command buffer into sendable lines, dropping blank ones
pub fn split_commands(raw: &str) -> Vec<String> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// One batch being sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    lines: Vec<String>,
    current_index: usize,
    interval: Duration,
    line_ending: LineEnding,
}

impl BatchJob {
    /// Build a job from raw text; `None` when there is nothing to send
    pub fn new(raw_text: &str, line_ending: LineEnding, interval_ms: u64) -> Option<Self> {
        let lines = split_commands(raw_text);
        if lines.is_empty() {
            return None;
        }
        Some(Self {
            lines,
            current_index: 0,
            interval: Duration::from_millis(interval_ms),
            line_ending,
        })
    }

    /// Non-blank lines in send order
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Index of the next line to send
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Number of lines in the batch
    pub fn total(&self) -> usize {
        self.lines.len()
    }

    /// Pause between lines
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Terminator appended to each line
    pub fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    /// Line to send next
    pub fn current_line(&self) -> Option<&str> {
        self.lines.get(self.current_index).map(String::as_str)
    }

    /// Whether every line has been attempted
    pub fn is_finished(&self) -> bool {
        self.current_index >= self.lines.len()
    }

    fn advance(&mut self) {
        self.current_index += 1;
    }
}

/// Queue state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// No batch active
    Idle,
    /// A batch is being sent
    Sending,
}

/// Why a batch ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The port closed while lines were still pending
    Disconnected,
}

/// Progress reports from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Line `index` was written
    Sent {
        index: usize,
        total: usize,
        line: String,
    },
    /// Line `index` could not be written; the batch carries on
    Failed {
        index: usize,
        total: usize,
        line: String,
        error: String,
    },
    /// Every line was attempted
    Completed { total: usize },
    /// Cancelled by [`DispatchQueue::stop`]
    Stopped,
    /// Ended early without a stop request
    Aborted(AbortReason),
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::Sent { index, total, line } if *total > 1 => {
                write!(f, "{}/{}: {}", index + 1, total, line)
            }
            DispatchEvent::Sent { line, .. } => write!(f, "Sent: {}", line),
            DispatchEvent::Failed {
                index,
                total,
                line,
                error,
            } if *total > 1 => write!(f, "failed {}/{}: {} ({})", index + 1, total, line, error),
            DispatchEvent::Failed { line, error, .. } => write!(f, "failed: {} ({})", line, error),
            DispatchEvent::Completed { total } if *total > 1 => {
                write!(f, "completed: all {} commands sent", total)
            }
            DispatchEvent::Completed { .. } => f.write_str("completed"),
            DispatchEvent::Stopped => f.write_str("stopped"),
            DispatchEvent::Aborted(AbortReason::Disconnected) => f.write_str("aborted: disconnected"),
        }
    }
}

struct ActiveJob {
    id: u64,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    channel: Arc<SerialChannel>,
    history: Arc<Mutex<CommandHistory>>,
    events: EventHub<DispatchEvent>,
    active: Mutex<Option<ActiveJob>>,
    next_job_id: AtomicU64,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, id: u64) -> bool {
        self.active().as_ref().map(|j| j.id == id).unwrap_or(false)
    }

    /// End job `id` from inside its own task
    fn finish(&self, id: u64, event: DispatchEvent) {
        let ended = {
            let mut active = self.active();
            match active.as_ref() {
                Some(job) if job.id == id => active.take(),
                _ => None,
            }
        };
        if ended.is_some() {
            tracing::info!("Batch send ended: {}", event);
            self.events.emit(&event);
        }
    }

    /// End whatever job is active, cancelling its schedule
    fn cancel(&self, event: DispatchEvent) -> bool {
        let Some(job) = self.active().take() else {
            return false;
        };
        if let Some(task) = job.task {
            task.abort();
        }
        tracing::info!("Batch send cancelled: {}", event);
        self.events.emit(&event);
        true
    }

    /// Send the job's next line; false once the job has ended
    fn step(&self, id: u64, job: &mut BatchJob) -> bool {
        if !self.is_current(id) {
            return false;
        }
        if !self.channel.is_connected() {
            self.finish(id, DispatchEvent::Aborted(AbortReason::Disconnected));
            return false;
        }

        self.dispatch_line(id, job);

        if job.is_finished() {
            self.finish(id, DispatchEvent::Completed { total: job.total() });
            return false;
        }
        true
    }

    /// Write the job's current line and advance, whatever the outcome
    fn dispatch_line(&self, id: u64, job: &mut BatchJob) {
        let Some(line) = job.current_line().map(str::to_string) else {
            return;
        };
        let index = job.current_index();
        let total = job.total();

        let event = match self.channel.write(&job.line_ending().frame(&line)) {
            Ok(()) => {
                self.history
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(&line);
                DispatchEvent::Sent { index, total, line }
            }
            Err(e) => DispatchEvent::Failed {
                index,
                total,
                line,
                error: e.to_string(),
            },
        };
        job.advance();

        // A stop that landed during the write already reported the outcome
        if self.is_current(id) {
            self.events.emit(&event);
        }
    }
}

/// Sleep out the interval before each remaining line
async fn run_job(shared: Arc<Shared>, id: u64, mut job: BatchJob) {
    loop {
        tokio::time::sleep(job.interval()).await;
        if !shared.step(id, &mut job) {
            return;
        }
    }
}

/// Single active batch sender bound to one channel
pub struct DispatchQueue {
    shared: Arc<Shared>,
    runtime: Handle,
    channel_subscription: SubscriptionId,
}

impl DispatchQueue {
    /// Create an idle queue that paces batches on `runtime`
    ///
    /// Successfully sent lines are recorded in `history`. The queue watches
    /// the channel and aborts the active batch when the port closes.
    pub fn new(
        channel: Arc<SerialChannel>,
        history: Arc<Mutex<CommandHistory>>,
        runtime: Handle,
    ) -> Self {
        let shared = Arc::new(Shared {
            channel: Arc::clone(&channel),
            history,
            events: EventHub::new(),
            active: Mutex::new(None),
            next_job_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&shared);
        let channel_subscription = channel.subscribe(move |event| {
            if let SerialEvent::ConnectionChanged(false) = event {
                if let Some(shared) = weak.upgrade() {
                    shared.cancel(DispatchEvent::Aborted(AbortReason::Disconnected));
                }
            }
        });

        Self {
            shared,
            runtime,
            channel_subscription,
        }
    }

    /// Register a callback for progress reports
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&DispatchEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(listener)
    }

    /// Remove a callback registered with [`subscribe`](Self::subscribe)
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Get current queue state
    pub fn state(&self) -> DispatchState {
        if self.shared.active().is_some() {
            DispatchState::Sending
        } else {
            DispatchState::Idle
        }
    }

    /// Whether a batch is active
    pub fn is_sending(&self) -> bool {
        self.state() == DispatchState::Sending
    }

    /// Shared command history
    pub fn history(&self) -> &Arc<Mutex<CommandHistory>> {
        &self.shared.history
    }

    /// Start sending `raw_text` line by line
    ///
    /// Returns the number of lines queued; 0 means the text had nothing to
    /// send and nothing happened. Fails with [`SerialError::AlreadySending`]
    /// while another batch is active.
    ///
    /// The first line is written before this returns. With `interval_ms == 0`
    /// every line is written in this call, so only a listener can stop the
    /// batch part way. Otherwise the remaining lines are paced on the runtime.
    pub fn start(&self, raw_text: &str, line_ending: LineEnding, interval_ms: u64) -> Result<usize> {
        let Some(mut job) = BatchJob::new(raw_text, line_ending, interval_ms) else {
            return Ok(0);
        };
        let total = job.total();

        let id = {
            let mut active = self.shared.active();
            if active.is_some() {
                return Err(SerialError::AlreadySending);
            }
            let id = self.shared.next_job_id.fetch_add(1, Ordering::Relaxed);
            *active = Some(ActiveJob { id, task: None });
            id
        };

        tracing::info!(
            "Batch send started: {} line(s), {} ms interval, {}",
            total,
            interval_ms,
            line_ending
        );

        loop {
            if !self.shared.step(id, &mut job) {
                return Ok(total);
            }
            if !job.interval().is_zero() {
                break;
            }
        }

        let mut active = self.shared.active();
        if let Some(slot) = active.as_mut().filter(|slot| slot.id == id) {
            slot.task = Some(
                self.runtime
                    .spawn(run_job(Arc::clone(&self.shared), id, job)),
            );
        }
        Ok(total)
    }

    /// Cancel the active batch; a no-op when idle
    pub fn stop(&self) {
        self.shared.cancel(DispatchEvent::Stopped);
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shared.channel.unsubscribe(self.channel_subscription);
        if let Some(job) = self.shared.active().take() {
            if let Some(task) = job.task {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_line_ending_terminators() {
        assert_eq!(LineEnding::None.frame("AT"), b"AT".to_vec());
        assert_eq!(LineEnding::Cr.frame("AT"), b"AT\r".to_vec());
        assert_eq!(LineEnding::Lf.frame("AT"), b"AT\n".to_vec());
        assert_eq!(LineEnding::CrLf.frame("AT"), b"AT\r\n".to_vec());
    }

    #[test]
    fn test_line_ending_parse() {
        assert_eq!("cr+lf".parse::<LineEnding>().unwrap(), LineEnding::CrLf);
        assert_eq!("CRLF".parse::<LineEnding>().unwrap(), LineEnding::CrLf);
        assert_eq!(" lf ".parse::<LineEnding>().unwrap(), LineEnding::Lf);
        assert_eq!("None".parse::<LineEnding>().unwrap(), LineEnding::None);
        assert!("tab".parse::<LineEnding>().is_err());
        for mode in LineEnding::ALL {
            assert_eq!(mode.to_string().parse::<LineEnding>().unwrap(), mode);
        }
    }

    #[test]
    fn test_line_ending_serde_labels() {
        assert_eq!(serde_json::to_string(&LineEnding::CrLf).unwrap(), "\"CR+LF\"");
        let parsed: LineEnding = serde_json::from_str("\"CRLF\"").unwrap();
        assert_eq!(parsed, LineEnding::CrLf);
    }

    #[test]
    fn test_split_commands_skips_blank_lines() {
        assert_eq!(
            split_commands("a\n\n  \nb\r\n\tc\t\n"),
            vec!["a", "b", "\tc\t"]
        );
        assert!(split_commands(" \n\n").is_empty());
    }

    #[test]
    fn test_batch_job_empty_is_none() {
        assert!(BatchJob::new("\n \n", LineEnding::CrLf, 0).is_none());
    }

    #[test]
    fn test_batch_job_progress() {
        let mut job = BatchJob::new("x\ny", LineEnding::Lf, 50).unwrap();
        assert_eq!(job.total(), 2);
        assert_eq!(job.interval(), Duration::from_millis(50));
        assert_eq!(job.current_line(), Some("x"));
        job.advance();
        assert_eq!(job.current_line(), Some("y"));
        job.advance();
        assert!(job.is_finished());
        assert_eq!(job.current_line(), None);
    }

    #[test]
    fn test_event_messages() {
        let sent = |index, total| DispatchEvent::Sent {
            index,
            total,
            line: "AT".to_string(),
        };
        assert_eq!(sent(0, 3).to_string(), "1/3: AT");
        assert_eq!(sent(0, 1).to_string(), "Sent: AT");
        assert_eq!(DispatchEvent::Completed { total: 1 }.to_string(), "completed");
        assert_eq!(
            DispatchEvent::Completed { total: 3 }.to_string(),
            "completed: all 3 commands sent"
        );
        assert_eq!(DispatchEvent::Stopped.to_string(), "stopped");
        assert_eq!(
            DispatchEvent::Aborted(AbortReason::Disconnected).to_string(),
            "aborted: disconnected"
        );
    }
}
