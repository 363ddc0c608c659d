//! Document store adapters.
//!
//! The engine reaches its backend only through [`DocumentStore`]:
//! - forward-only paged scans ordered by a stable key
//! - point probes bounded to one result
//! - target record creation
//! - bounded, atomic batch commits
//!
//! Adapters provided here:
//! - [`MemoryStore`] keeps collections in memory and can inject faults
//! - [`SqliteStore`] persists documents as JSON rows in SQLite
//! - [`RateLimitedStore`] wraps any adapter with a call-rate limit

mod memory;
mod sqlite;
mod throttle;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::EngineDefaults;
use crate::error::Result;
use crate::record::{Cursor, FieldUpdate, Fields, Page, ProbeFilter, Record};

pub use memory::{MemoryStore, StoreOp};
pub use sqlite::SqliteStore;
pub use throttle::RateLimitedStore;

/// Narrow interface to the external document store.
///
/// Implementations must be safe to share between tasks; the engine itself
/// issues calls one at a time.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch up to `page_size` records after `cursor`, ordered by id.
    ///
    /// Returns `next_cursor = None` when no records remain.
    async fn scan_page(
        &self,
        collection: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page>;

    /// Return at most one record matching every condition of `filter`.
    async fn probe_one(&self, collection: &str, filter: &ProbeFilter) -> Result<Option<Record>>;

    /// Create a document and return its freshly assigned id.
    async fn create_record(&self, collection: &str, fields: Fields) -> Result<String>;

    /// Apply all updates atomically: either every update lands or none does.
    ///
    /// Callers never pass more than [`DocumentStore::max_batch_size`] updates.
    async fn commit_batch(&self, updates: &[FieldUpdate]) -> Result<()>;

    /// Maximum number of documents in one batch commit.
    fn max_batch_size(&self) -> usize {
        EngineDefaults::MAX_BATCH_WRITES
    }
}

/// Shared handle to a store adapter.
pub type DynDocumentStore = Arc<dyn DocumentStore>;
