//! The reconciliation engine.
//!
//! One engine instance owns one [`RunState`] and drives it through
//! `idle -> scanning -> processing -> {completed | error | paused}`.
//! All store I/O is sequential and awaited. A pause request is polled
//! before each page fetch, each grouping probe and each unit of work,
//! never in the middle of a unit.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reconcile_core::{migrations, EngineConfig, MemoryStore, ReconcileEngine};
//!
//! # async fn run() -> reconcile_core::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let mut engine = ReconcileEngine::new(store, migrations::companies(), EngineConfig::default())?;
//!
//! let pause = engine.pause_handle();
//! // hand `pause` to a UI task; `pause.request()` stops before the next unit
//!
//! let phase = engine.start().await?;
//! println!("run ended {} with {}% done", phase, engine.progress().progress_percentage());
//! # Ok(())
//! # }
//! ```

mod scan;
mod unit;

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::classify::{Classifier, TargetRefRule};
use crate::config::{EngineConfig, MigrationSpec};
use crate::error::{ReconcileError, Result};
use crate::pause::PauseSignal;
use crate::reporter::{ProgressEvent, ProgressReporter, SilentReporter};
use crate::retry::{retry_async, with_timeout, RetryStats};
use crate::state::{LogLevel, LogLine, RunPhase, RunProgress, RunState};
use crate::store::DynDocumentStore;

/// Generic scan, classify, group, resolve and write engine.
pub struct ReconcileEngine {
    store: DynDocumentStore,
    spec: MigrationSpec,
    config: EngineConfig,
    classifier: Classifier,
    state: RunState,
    pause: PauseSignal,
    reporter: Arc<dyn ProgressReporter>,
}

impl ReconcileEngine {
    /// Create an idle engine for one migration.
    pub fn new(store: DynDocumentStore, spec: MigrationSpec, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        spec.validate()?;

        let classifier = Classifier::for_spec(&spec, TargetRefRule::new(config.min_target_ref_len));
        let state = RunState::new(config.batch_history_len, config.debug_log_len);

        Ok(Self {
            store,
            spec,
            config,
            classifier,
            state,
            pause: PauseSignal::new(),
            reporter: Arc::new(SilentReporter),
        })
    }

    /// Attach a progress sink.
    pub fn with_reporter(mut self, reporter: impl ProgressReporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    /// Attach a shared progress sink.
    pub fn with_shared_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn spec(&self) -> &MigrationSpec {
        &self.spec
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read-only view of the run.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn progress(&self) -> &RunProgress {
        &self.state.progress
    }

    pub fn phase(&self) -> RunPhase {
        self.state.progress.phase
    }

    /// A handle that can request a pause from another task.
    pub fn pause_handle(&self) -> PauseSignal {
        self.pause.clone()
    }

    /// Request a pause. Takes effect before the next page, probe or unit.
    pub fn pause(&self) {
        self.pause.request();
    }

    /// Start a new run. Only valid from `idle`.
    ///
    /// Returns the phase the run ended in (`completed` or `paused`). A fatal
    /// failure moves the run to `error` and is returned as `Err`.
    pub async fn start(&mut self) -> Result<RunPhase> {
        self.require_phase("start", &[RunPhase::Idle])?;
        self.pause.clear();

        self.state.progress.started_at = Some(Utc::now());
        self.log(
            LogLevel::Info,
            format!(
                "Starting {}: scanning {} for records without a valid {}",
                self.spec.name, self.spec.collection, self.spec.target_field
            ),
        );
        self.drive().await
    }

    /// Continue a paused run from where it stopped. Only valid from `paused`.
    pub async fn resume(&mut self) -> Result<RunPhase> {
        self.require_phase("resume", &[RunPhase::Paused])?;
        self.pause.clear();

        let remaining = self.state.progress.total_needing_work
            - self.state.progress.processed_records.min(self.state.progress.total_needing_work);
        self.log(
            LogLevel::Info,
            format!(
                "Resuming {} after {} units ({} records settled, {} known remaining)",
                self.spec.name,
                self.state.progress.current_batch,
                self.state.progress.processed_records,
                remaining
            ),
        );
        self.drive().await
    }

    /// Drop all run state and return to `idle`.
    ///
    /// Valid from any phase that is not actively running. An engine whose
    /// `start()`/`resume()` future was dropped mid-run can also be reset.
    pub fn reset(&mut self) -> Result<()> {
        self.pause.clear();
        self.state.clear();
        debug!("Reset {} to idle", self.spec.name);
        self.emit();
        Ok(())
    }

    fn require_phase(&self, command: &str, allowed: &[RunPhase]) -> Result<()> {
        let phase = self.phase();
        if allowed.contains(&phase) {
            Ok(())
        } else {
            Err(ReconcileError::InvalidCommand {
                command: command.to_string(),
                phase: phase.to_string(),
            })
        }
    }

    async fn drive(&mut self) -> Result<RunPhase> {
        match self.run_phases().await {
            Ok(()) => Ok(self.phase()),
            Err(ReconcileError::Paused) => {
                self.enter_paused();
                Ok(RunPhase::Paused)
            }
            Err(e) => {
                self.enter_error(&e);
                Err(e)
            }
        }
    }

    async fn run_phases(&mut self) -> Result<()> {
        if !self.state.discovery.is_complete() {
            self.set_phase(RunPhase::Scanning);
            self.discover().await?;
        }

        if self.state.progress.total_needing_work == 0 {
            self.log(
                LogLevel::Info,
                format!(
                    "All {} scanned records already reference a valid target",
                    self.state.progress.scanned_records
                ),
            );
            self.enter_completed();
            return Ok(());
        }

        self.set_phase(RunPhase::Processing);
        self.process().await?;
        self.enter_completed();
        Ok(())
    }

    fn set_phase(&mut self, phase: RunPhase) {
        let previous = self.state.progress.phase;
        if previous == phase {
            return;
        }
        self.state.progress.phase = phase;
        debug!("{}: {} -> {}", self.spec.name, previous, phase);
        self.emit();
    }

    fn enter_completed(&mut self) {
        self.state.progress.phase = RunPhase::Completed;
        self.state.progress.finished_at = Some(Utc::now());
        self.state.current_batch.clear();
        let p = &self.state.progress;
        let summary = format!(
            "Completed {}: {} successful, {} skipped, {} errors, {} targets created",
            self.spec.name, p.successful, p.skipped, p.errors, p.targets_created
        );
        self.log(LogLevel::Info, summary);
    }

    fn enter_paused(&mut self) {
        self.state.progress.phase = RunPhase::Paused;
        self.state.current_batch.clear();
        let message = format!(
            "Paused {} after {} of {} units",
            self.spec.name, self.state.progress.current_batch, self.state.progress.total_batches
        );
        self.log(LogLevel::Info, message);
    }

    fn enter_error(&mut self, err: &ReconcileError) {
        self.state.progress.phase = RunPhase::Error;
        self.state.progress.error_message = Some(err.to_string());
        self.state.progress.finished_at = Some(Utc::now());
        self.state.current_batch.clear();
        self.log(
            LogLevel::Error,
            format!("{} failed: {}", self.spec.name, err.detailed()),
        );
    }

    /// Write a line to tracing and to the run's debug log, then notify.
    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(migration = %self.spec.name, "{}", message),
            LogLevel::Info => info!(migration = %self.spec.name, "{}", message),
            LogLevel::Warn => warn!(migration = %self.spec.name, "{}", message),
            LogLevel::Error => error!(migration = %self.spec.name, "{}", message),
        }
        self.state.debug_log.push(LogLine {
            timestamp: Utc::now(),
            level,
            message,
        });
        self.emit();
    }

    fn emit(&self) {
        let event = ProgressEvent {
            snapshot: self.state.progress.snapshot(),
            latest_batch: self.state.batch_history.latest().cloned(),
            latest_log: self.state.debug_log.latest().cloned(),
        };
        self.reporter.on_event(&event);
    }

    /// Run a store call under the per-call timeout and retry policy.
    ///
    /// Each failed attempt that was retried becomes one debug log line.
    async fn retrying<T, F, Fut>(&mut self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.call_timeout;
        let (result, stats) = retry_async(
            &self.config.retry,
            || with_timeout(timeout, call()),
            ReconcileError::is_transient,
        )
        .await;
        self.log_retries(what, &stats);
        result
    }

    fn log_retries(&mut self, what: &str, stats: &RetryStats) {
        let max = self.config.retry.max_attempts.max(1);
        for (attempt, message) in stats.retried_errors.iter().enumerate() {
            self.log(
                LogLevel::Debug,
                format!(
                    "{} attempt {}/{} failed, retrying: {}",
                    what,
                    attempt + 1,
                    max,
                    message
                ),
            );
        }
    }
}
