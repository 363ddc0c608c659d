//! Run state: phase machine, counters, batch history and debug log.
//!
//! Everything here lives in memory for the duration of one run and is
//! dropped on `reset()`. Nothing is persisted.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::group::ReconciliationGroup;
use crate::record::{Cursor, Record};

/// Phase of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Scanning,
    Processing,
    Paused,
    Completed,
    Error,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Scanning => "scanning",
            RunPhase::Processing => "processing",
            RunPhase::Paused => "paused",
            RunPhase::Completed => "completed",
            RunPhase::Error => "error",
        }
    }

    /// Whether the engine is actively working in this phase.
    pub fn is_active(&self) -> bool {
        matches!(self, RunPhase::Scanning | RunPhase::Processing)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of unit a batch result describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Phase 1: a keyed group.
    Group,
    /// Phase 2: a sub-batch of individual records.
    Individual,
}

/// Outcome of one committed unit of work. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_number: usize,
    pub total_in_batch: usize,
    pub successful: usize,
    pub skipped: usize,
    pub errors: usize,
    pub targets_created: usize,
    pub error_messages: Vec<String>,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub operation_type: OperationType,
    /// Linking key for group units.
    pub group_key: Option<String>,
}

/// Severity of a debug log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One line of the run's debug log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Aggregate progress of a run.
#[derive(Debug, Clone, Default)]
pub struct RunProgress {
    pub phase: RunPhase,
    /// Records seen by the scan.
    pub scanned_records: usize,
    /// Pages fetched by the scan.
    pub pages_scanned: usize,
    /// Records classified as needing reconciliation.
    pub total_needing_work: usize,
    /// Records in keyed groups (subset of `total_needing_work`).
    pub keyed_records: usize,
    /// Records handled individually (subset of `total_needing_work`).
    pub individual_records: usize,
    /// Always `successful + skipped + errors`.
    pub processed_records: usize,
    pub successful: usize,
    pub skipped: usize,
    pub errors: usize,
    pub targets_created: usize,
    /// Groups whose probe found no existing target.
    pub no_target_found: usize,
    /// Units completed in this run (across resumes).
    pub current_batch: usize,
    /// Estimated number of units: groups plus individual sub-batches.
    pub total_batches: usize,
    /// The scan stopped at the page ceiling with records left unread.
    pub scan_truncated: bool,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Ids committed by this run. Resume and re-processing skip them.
    pub processed_record_ids: HashSet<String>,
    /// Ids that failed at record level. Resume does not re-attempt them.
    pub failed_record_ids: HashSet<String>,
}

impl RunProgress {
    /// Percentage of work done, rounded and clamped to 0..=100.
    ///
    /// A completed run with nothing to do reports 100.
    pub fn progress_percentage(&self) -> u8 {
        if self.total_needing_work == 0 {
            return if self.phase == RunPhase::Completed { 100 } else { 0 };
        }
        let ratio = self.processed_records as f64 / self.total_needing_work.max(1) as f64;
        (ratio * 100.0).round().clamp(0.0, 100.0) as u8
    }

    /// Whether a record has already been handled (committed or failed).
    pub fn is_settled(&self, id: &str) -> bool {
        self.processed_record_ids.contains(id) || self.failed_record_ids.contains(id)
    }

    pub(crate) fn record_success(&mut self, id: &str) {
        self.processed_record_ids.insert(id.to_string());
        self.successful += 1;
        self.processed_records += 1;
    }

    pub(crate) fn record_skip(&mut self) {
        self.skipped += 1;
        self.processed_records += 1;
    }

    pub(crate) fn record_error(&mut self, id: &str) {
        self.failed_record_ids.insert(id.to_string());
        self.errors += 1;
        self.processed_records += 1;
    }

    /// Serializable copy without the id sets.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: self.phase,
            scanned_records: self.scanned_records,
            pages_scanned: self.pages_scanned,
            total_needing_work: self.total_needing_work,
            keyed_records: self.keyed_records,
            individual_records: self.individual_records,
            processed_records: self.processed_records,
            successful: self.successful,
            skipped: self.skipped,
            errors: self.errors,
            targets_created: self.targets_created,
            no_target_found: self.no_target_found,
            current_batch: self.current_batch,
            total_batches: self.total_batches,
            scan_truncated: self.scan_truncated,
            progress_percentage: self.progress_percentage(),
            error_message: self.error_message.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Point-in-time view of [`RunProgress`] handed to reporters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub phase: RunPhase,
    pub scanned_records: usize,
    pub pages_scanned: usize,
    pub total_needing_work: usize,
    pub keyed_records: usize,
    pub individual_records: usize,
    pub processed_records: usize,
    pub successful: usize,
    pub skipped: usize,
    pub errors: usize,
    pub targets_created: usize,
    pub no_target_found: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub scan_truncated: bool,
    pub progress_percentage: u8,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Fixed-capacity FIFO that evicts its oldest entry when full.
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: T) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Work discovered by the scan, kept so a paused run can resume.
#[derive(Debug, Clone, Default)]
pub(crate) struct Discovery {
    /// Cursor of the next page to fetch.
    pub cursor: Option<Cursor>,
    /// The scan has read its last page (or hit the ceiling).
    pub scan_done: bool,
    /// Keyed records waiting to be partitioned into groups.
    pub keyed: Vec<(String, Record)>,
    /// Partitioned keys not yet probed, in first-seen order.
    pub pending_groups: VecDeque<(String, Vec<Record>)>,
    /// All keyed records have been partitioned.
    pub partitioned: bool,
    /// Probed groups, in processing order.
    pub groups: Vec<ReconciliationGroup>,
    /// Records without a linking key, in scan order.
    pub individuals: Vec<Record>,
}

impl Discovery {
    /// Scan read and every group probed.
    pub fn is_complete(&self) -> bool {
        self.scan_done && self.partitioned && self.pending_groups.is_empty()
    }
}

/// Everything one engine instance knows about its current run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub progress: RunProgress,
    /// Records of the unit currently being written (for display).
    pub current_batch: Vec<Record>,
    pub batch_history: BoundedLog<BatchResult>,
    pub debug_log: BoundedLog<LogLine>,
    pub(crate) discovery: Discovery,
}

impl RunState {
    pub fn new(history_len: usize, log_len: usize) -> Self {
        Self {
            progress: RunProgress::default(),
            current_batch: Vec::new(),
            batch_history: BoundedLog::new(history_len),
            debug_log: BoundedLog::new(log_len),
            discovery: Discovery::default(),
        }
    }

    /// Groups discovered so far.
    pub fn groups(&self) -> &[ReconciliationGroup] {
        &self.discovery.groups
    }

    /// Individual records discovered so far.
    pub fn individuals(&self) -> &[Record] {
        &self.discovery.individuals
    }

    /// Reset to an empty idle state, keeping buffer capacities.
    pub fn clear(&mut self) {
        self.progress = RunProgress::default();
        self.current_batch.clear();
        self.batch_history.clear();
        self.debug_log.clear();
        self.discovery = Discovery::default();
    }
}
