//! In-memory document store.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::DocumentStore;
use crate::config::EngineDefaults;
use crate::error::{ReconcileError, Result};
use crate::record::{Cursor, FieldUpdate, Fields, Page, ProbeFilter, Record};

/// Store operations, used for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Scan,
    Probe,
    Create,
    Commit,
}

impl std::fmt::Display for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreOp::Scan => write!(f, "scan_page"),
            StoreOp::Probe => write!(f, "probe_one"),
            StoreOp::Create => write!(f, "create_record"),
            StoreOp::Commit => write!(f, "commit_batch"),
        }
    }
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    remaining: u32,
    transient: bool,
    message: String,
}

/// Ordered in-memory store.
///
/// Each collection is a `BTreeMap` keyed by document id, so scans are
/// stable and cursor-resumable. Faults can be scripted per operation.
pub struct MemoryStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Fields>>>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<StoreOp, u64>>,
    max_batch: usize,
    id_prefix: String,
    next_id: Mutex<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            faults: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            max_batch: EngineDefaults::MAX_BATCH_WRITES,
            id_prefix: String::new(),
            next_id: Mutex::new(0),
        }
    }

    /// Limit the number of documents accepted per batch commit.
    pub fn with_max_batch_size(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Assign sequential ids (`{prefix}1`, `{prefix}2`, ...) instead of UUIDs.
    ///
    /// Makes created ids predictable in tests.
    pub fn with_sequential_ids(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Insert or replace a record.
    pub fn insert(&self, collection: &str, record: Record) {
        let mut collections = self.collections.lock().expect("store lock poisoned");
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(record.id, record.fields);
    }

    /// Insert several records.
    pub fn insert_many(&self, collection: &str, records: impl IntoIterator<Item = Record>) {
        for record in records {
            self.insert(collection, record);
        }
    }

    /// Read a record back.
    pub fn get(&self, collection: &str, id: &str) -> Option<Record> {
        let collections = self.collections.lock().expect("store lock poisoned");
        collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Record {
                id: id.to_string(),
                fields: fields.clone(),
            })
    }

    /// All records of a collection in id order.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        let collections = self.collections.lock().expect("store lock poisoned");
        collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Record {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of records in a collection.
    pub fn len(&self, collection: &str) -> usize {
        let collections = self.collections.lock().expect("store lock poisoned");
        collections.get(collection).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Make the next `times` calls of `op` fail.
    ///
    /// Transient faults surface as network errors, permanent ones as
    /// generic store errors whose message carries no transient marker.
    pub fn fail_next(&self, op: StoreOp, times: u32, transient: bool, message: impl Into<String>) {
        let mut faults = self.faults.lock().expect("store lock poisoned");
        faults.push(Fault {
            op,
            remaining: times,
            transient,
            message: message.into(),
        });
    }

    /// Number of calls made to `op`, including failed ones.
    pub fn call_count(&self, op: StoreOp) -> u64 {
        let calls = self.calls.lock().expect("store lock poisoned");
        calls.get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, op: StoreOp) -> Result<()> {
        *self
            .calls
            .lock()
            .expect("store lock poisoned")
            .entry(op)
            .or_insert(0) += 1;

        let mut faults = self.faults.lock().expect("store lock poisoned");
        let Some(pos) = faults.iter().position(|f| f.op == op && f.remaining > 0) else {
            return Ok(());
        };

        let fault = &mut faults[pos];
        fault.remaining -= 1;
        let err = if fault.transient {
            ReconcileError::network(fault.message.clone())
        } else {
            ReconcileError::store(op.to_string(), fault.message.clone())
        };
        if fault.remaining == 0 {
            faults.remove(pos);
        }
        debug!("Injected {} fault: {}", op, err);
        Err(err)
    }

    fn new_id(&self) -> String {
        if self.id_prefix.is_empty() {
            return uuid::Uuid::new_v4().to_string();
        }
        let mut next = self.next_id.lock().expect("store lock poisoned");
        *next += 1;
        format!("{}{}", self.id_prefix, *next)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn scan_page(
        &self,
        collection: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page> {
        self.enter(StoreOp::Scan)?;

        let collections = self.collections.lock().expect("store lock poisoned");
        let Some(docs) = collections.get(collection) else {
            return Ok(Page::default());
        };

        let lower = match cursor {
            Some(c) => Bound::Excluded(c.as_str().to_string()),
            None => Bound::Unbounded,
        };

        // Fetch one extra entry to learn whether another page exists
        let mut records: Vec<Record> = docs
            .range((lower, Bound::Unbounded))
            .take(page_size + 1)
            .map(|(id, fields)| Record {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect();

        let next_cursor = if records.len() > page_size {
            records.truncate(page_size);
            records.last().map(|r| Cursor::new(r.id.clone()))
        } else {
            None
        };

        Ok(Page {
            records,
            next_cursor,
        })
    }

    async fn probe_one(&self, collection: &str, filter: &ProbeFilter) -> Result<Option<Record>> {
        self.enter(StoreOp::Probe)?;

        let collections = self.collections.lock().expect("store lock poisoned");
        let found = collections.get(collection).and_then(|docs| {
            docs.iter()
                .map(|(id, fields)| Record {
                    id: id.clone(),
                    fields: fields.clone(),
                })
                .find(|record| filter.matches(record))
        });
        Ok(found)
    }

    async fn create_record(&self, collection: &str, fields: Fields) -> Result<String> {
        self.enter(StoreOp::Create)?;

        let id = self.new_id();
        let mut collections = self.collections.lock().expect("store lock poisoned");
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields);
        Ok(id)
    }

    async fn commit_batch(&self, updates: &[FieldUpdate]) -> Result<()> {
        self.enter(StoreOp::Commit)?;

        if updates.len() > self.max_batch {
            return Err(ReconcileError::store(
                "commit_batch",
                format!(
                    "batch of {} exceeds limit of {} documents",
                    updates.len(),
                    self.max_batch
                ),
            ));
        }

        let mut collections = self.collections.lock().expect("store lock poisoned");

        // Validate every target first so a bad update leaves nothing applied
        for update in updates {
            let exists = collections
                .get(&update.collection)
                .map(|docs| docs.contains_key(&update.id))
                .unwrap_or(false);
            if !exists {
                return Err(ReconcileError::NotFound {
                    collection: update.collection.clone(),
                    id: update.id.clone(),
                });
            }
        }

        for update in updates {
            if let Some(doc) = collections
                .get_mut(&update.collection)
                .and_then(|docs| docs.get_mut(&update.id))
            {
                for (key, value) in &update.fields {
                    doc.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }
}
