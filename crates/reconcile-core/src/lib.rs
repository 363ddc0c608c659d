//! Reconcile Core - Resumable, batched record reconciliation.
//!
//! This crate scans a document collection for records that lack a valid
//! reference to a derived "target" record, groups them by a linking key,
//! finds or creates the target for each group (or one per ungrouped
//! record), and writes the references back in bounded atomic batches.
//! Runs can be paused and resumed without redoing committed work.
//!
//! It is a headless library. Store access goes through the
//! [`DocumentStore`] trait; progress goes out through a
//! [`ProgressReporter`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reconcile_core::{migrations, EngineConfig, ReconcileEngine, SqliteStore, TracingReporter};
//!
//! #[tokio::main]
//! async fn main() -> reconcile_core::Result<()> {
//!     let store = Arc::new(SqliteStore::open("/path/to/documents.db")?);
//!     let mut engine = ReconcileEngine::new(store, migrations::companies(), EngineConfig::default())?
//!         .with_reporter(TracingReporter::new());
//!
//!     let phase = engine.start().await?;
//!     println!("{}: {} records linked", phase, engine.progress().successful);
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod group;
pub mod migrations;
pub mod pause;
pub mod record;
pub mod reporter;
pub mod retry;
pub mod state;
pub mod store;

// Re-export commonly used types
pub use classify::{ClassifiedRecord, Classifier, TargetRefRule};
pub use config::{EngineConfig, EngineDefaults, MigrationSpec, TargetSeed};
pub use engine::ReconcileEngine;
pub use error::{ErrorClass, ReconcileError, Result};
pub use group::{partition_by_key, Grouper, ReconciliationGroup};
pub use pause::PauseSignal;
pub use record::{Condition, Cursor, FieldUpdate, Fields, Page, ProbeFilter, Record};
pub use reporter::{ChannelReporter, ProgressEvent, ProgressReporter, SilentReporter, TracingReporter};
pub use retry::{retry_async, Backoff, RetryConfig, RetryStats};
pub use state::{
    BatchResult, BoundedLog, LogLevel, LogLine, OperationType, ProgressSnapshot, RunPhase,
    RunProgress, RunState,
};
pub use store::{DocumentStore, DynDocumentStore, MemoryStore, RateLimitedStore, SqliteStore, StoreOp};
