//! Progress reporting sinks.
//!
//! The engine calls [`ProgressReporter::on_event`] after every state change
//! and every log line. Reporters only observe; they never mutate the run.
//! A UI that wants to steer the run holds a [`crate::PauseSignal`] and the
//! engine handle instead.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::state::{BatchResult, LogLine, ProgressSnapshot};

/// Snapshot emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub snapshot: ProgressSnapshot,
    pub latest_batch: Option<BatchResult>,
    pub latest_log: Option<LogLine>,
}

/// Sink for progress events.
pub trait ProgressReporter: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressReporter for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Logs a one-line summary whenever a unit completes or the phase changes.
#[derive(Debug, Default)]
pub struct TracingReporter {
    last: std::sync::Mutex<Option<(crate::state::RunPhase, usize)>>,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for TracingReporter {
    fn on_event(&self, event: &ProgressEvent) {
        let snap = &event.snapshot;
        let key = (snap.phase, snap.current_batch);
        let mut last = self.last.lock().expect("reporter lock poisoned");
        if *last == Some(key) {
            return;
        }
        *last = Some(key);

        info!(
            phase = %snap.phase,
            batch = snap.current_batch,
            total_batches = snap.total_batches,
            processed = snap.processed_records,
            total = snap.total_needing_work,
            successful = snap.successful,
            skipped = snap.skipped,
            errors = snap.errors,
            "Reconciliation {}% complete",
            snap.progress_percentage
        );
    }
}

/// Forwards events to a tokio channel, for consumers on another task.
///
/// A closed receiver is ignored; the run keeps going.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelReporter {
    /// Create a reporter and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelReporter {
    fn on_event(&self, event: &ProgressEvent) {
        let _ = self.tx.send(event.clone());
    }
}
