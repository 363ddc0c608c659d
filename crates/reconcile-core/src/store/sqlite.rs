//! SQLite-backed document store.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use super::DocumentStore;
use crate::config::EngineDefaults;
use crate::error::{ReconcileError, Result};
use crate::record::{Condition, Cursor, FieldUpdate, Fields, Page, ProbeFilter, Record};

/// SQLite document store.
///
/// Every document is one row of `documents(collection, id, body)` with the
/// field map stored as a JSON object. Scans page by `id`, probes use
/// `json_extract`, and batch commits run in a single transaction.
/// Thread-safe via internal mutex on the connection. The async trait
/// methods run their statements on tokio's blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    max_batch: usize,
}

impl SqliteStore {
    /// Open (or create) a store at the given database path.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ReconcileError::Store {
                operation: "open".into(),
                message: format!("Failed to create directory {}: {}", parent.display(), e),
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| ReconcileError::Database {
            message: format!("Failed to open document database: {}", e),
            source: Some(e),
        })?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| ReconcileError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        Self::from_connection(conn)
    }

    /// Create a store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            max_batch: EngineDefaults::MAX_BATCH_WRITES,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Limit the number of documents accepted per batch commit.
    pub fn with_max_batch_size(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        lock_conn(&self.conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            "#,
        )
        .map_err(|e| ReconcileError::Database {
            message: format!("Failed to initialize document schema: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    /// Insert or replace a document.
    pub fn put(&self, collection: &str, record: &Record) -> Result<()> {
        let body = serde_json::to_string(&record.fields)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
            params![collection, record.id, body],
        )?;
        Ok(())
    }

    /// Read a document by id.
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| parse_record(id.to_string(), &b)).transpose()
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn parse_record(id: String, body: &str) -> Result<Record> {
    let value: Value = serde_json::from_str(body)?;
    Ok(Record::from_json(id, value))
}

/// JSON path for a top-level field, quoted so any field name is safe.
fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

/// Characters SQLite `trim` strips, matching `str::trim` for ASCII whitespace.
const TRIM_CHARS: &str = "char(32, 9, 10, 11, 12, 13)";

/// Translate a probe filter into a WHERE fragment and its parameters.
fn probe_sql(filter: &ProbeFilter) -> Result<(String, Vec<String>)> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    for condition in &filter.conditions {
        match condition {
            Condition::Equals { field, value } => {
                // Both sides go through json_extract so strings, numbers and booleans compare alike
                clauses.push(format!(
                    "json_extract(body, ?{}) = json_extract(?{}, '$')",
                    values.len() + 1,
                    values.len() + 2
                ));
                values.push(json_path(field));
                values.push(serde_json::to_string(value)?);
            }
            Condition::NonEmpty { field } => {
                clauses.push(format!(
                    "json_type(body, ?{p}) = 'text' AND trim(json_extract(body, ?{p}), {t}) <> ''",
                    p = values.len() + 1,
                    t = TRIM_CHARS
                ));
                values.push(json_path(field));
            }
            Condition::ValidRef { field, min_len } => {
                // Parameters bind as TEXT, so the length bound is inlined as an integer literal
                clauses.push(format!(
                    "json_type(body, ?{p}) = 'text' \
                     AND length(trim(json_extract(body, ?{p}), {t})) >= {n}",
                    p = values.len() + 1,
                    t = TRIM_CHARS,
                    n = (*min_len).max(1)
                ));
                values.push(json_path(field));
            }
        }
    }

    Ok((clauses.join(" AND "), values))
}

fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| ReconcileError::Database {
        message: format!("Failed to lock database: {}", e),
        source: None,
    })
}

impl SqliteStore {
    /// Run a closure against the connection on the blocking thread pool.
    ///
    /// Keeps SQLite I/O off the async executor, so a caller-side timeout
    /// resolves on schedule. A timed-out statement still runs to completion
    /// in the background.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_conn(&conn)?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| ReconcileError::store(operation, format!("blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn scan_page(
        &self,
        collection: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page> {
        let collection = collection.to_string();
        let after = cursor.map(|c| c.as_str().to_string()).unwrap_or_default();

        self.with_conn("scan_page", move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, body FROM documents WHERE collection = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![collection, after, (page_size + 1) as i64],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?;

            let mut records = Vec::with_capacity(page_size + 1);
            for row in rows {
                let (id, body) = row?;
                records.push(parse_record(id, &body)?);
            }

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
        })
        .await
    }

    async fn probe_one(&self, collection: &str, filter: &ProbeFilter) -> Result<Option<Record>> {
        let (clause, values) = probe_sql(filter)?;
        let offset = values.len();
        let sql = if clause.is_empty() {
            format!(
                "SELECT id, body FROM documents WHERE collection = ?{} ORDER BY id LIMIT 1",
                offset + 1
            )
        } else {
            format!(
                "SELECT id, body FROM documents WHERE {} AND collection = ?{} ORDER BY id LIMIT 1",
                clause,
                offset + 1
            )
        };

        let mut params_vec = values;
        params_vec.push(collection.to_string());

        self.with_conn("probe_one", move |conn| {
            let row: Option<(String, String)> = conn
                .query_row(&sql, params_from_iter(params_vec.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?;

            row.map(|(id, body)| parse_record(id, &body)).transpose()
        })
        .await
    }

    async fn create_record(&self, collection: &str, fields: Fields) -> Result<String> {
        let collection = collection.to_string();
        let id = uuid::Uuid::new_v4().to_string();
        let body = serde_json::to_string(&fields)?;

        self.with_conn("create_record", move |conn| {
            conn.execute(
                "INSERT INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
                params![collection, id, body],
            )?;
            debug!("Created {}/{}", collection, id);
            Ok(id)
        })
        .await
    }

    async fn commit_batch(&self, updates: &[FieldUpdate]) -> Result<()> {
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

        let updates = updates.to_vec();
        self.with_conn("commit_batch", move |conn| {
            let tx = conn.transaction()?;

            for update in &updates {
                let body: Option<String> = tx
                    .query_row(
                        "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                        params![update.collection, update.id],
                        |row| row.get(0),
                    )
                    .optional()?;

                // Dropping the transaction without commit rolls back earlier updates
                let Some(body) = body else {
                    return Err(ReconcileError::NotFound {
                        collection: update.collection.clone(),
                        id: update.id.clone(),
                    });
                };

                let mut record = parse_record(update.id.clone(), &body)?;
                for (key, value) in &update.fields {
                    record.fields.insert(key.clone(), value.clone());
                }

                tx.execute(
                    "UPDATE documents SET body = ?1 WHERE collection = ?2 AND id = ?3",
                    params![
                        serde_json::to_string(&record.fields)?,
                        update.collection,
                        update.id
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::TargetRefRule;
    use crate::retry::with_timeout;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store_with(ids: &[&str]) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        for id in ids {
            store.put("tours", &Record::new(*id)).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_scan_pages_in_id_order() {
        let store = store_with(&["c", "a", "b", "d", "e"]);

        let first = store.scan_page("tours", 2, None).await.unwrap();
        let ids: Vec<_> = first.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let second = store
            .scan_page("tours", 2, first.next_cursor.as_ref())
            .await
            .unwrap();
        let third = store
            .scan_page("tours", 2, second.next_cursor.as_ref())
            .await
            .unwrap();
        assert_eq!(third.records.len(), 1);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_probe_matches_key_and_reference() {
        let store = store_with(&[]);
        store
            .put(
                "tours",
                &Record::new("a")
                    .with_field("license_key", "LIC2")
                    .with_field("company_id", "  "),
            )
            .unwrap();
        store
            .put(
                "tours",
                &Record::new("b")
                    .with_field("license_key", "LIC2")
                    .with_field("company_id", "T9"),
            )
            .unwrap();

        let filter = ProbeFilter::new()
            .eq("license_key", "LIC2")
            .non_empty("company_id");
        let found = store.probe_one("tours", &filter).await.unwrap().unwrap();
        assert_eq!(found.id, "b");

        let none = ProbeFilter::new()
            .eq("license_key", "LIC404")
            .non_empty("company_id");
        assert!(store.probe_one("tours", &none).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_skips_reference_shorter_than_rule() {
        let store = store_with(&[]);
        for (id, company) in [("a", " ab "), ("b", "T99")] {
            store
                .put(
                    "tours",
                    &Record::new(id)
                        .with_field("license_key", "LIC1")
                        .with_field("company_id", company),
                )
                .unwrap();
        }

        let filter = ProbeFilter::new()
            .eq("license_key", "LIC1")
            .valid_ref("company_id", TargetRefRule::new(3));
        let found = store.probe_one("tours", &filter).await.unwrap().unwrap();
        assert_eq!(found.id, "b");

        let stricter = ProbeFilter::new()
            .eq("license_key", "LIC1")
            .valid_ref("company_id", TargetRefRule::new(4));
        assert!(store.probe_one("tours", &stricter).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_call_timeout_fires_while_connection_is_busy() {
        let store = store_with(&["a"]);

        let guard = store.lock().unwrap();
        let result = with_timeout(
            Some(Duration::from_millis(50)),
            store.scan_page("tours", 10, None),
        )
        .await;
        drop(guard);

        assert!(matches!(result, Err(ReconcileError::Timeout(_))));
        let page = store.scan_page("tours", 10, None).await.unwrap();
        assert_eq!(page.records.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_merges_fields_atomically() {
        let store = store_with(&["a", "b"]);
        store
            .commit_batch(&[FieldUpdate::set("tours", "a", "company_id", "C-1")])
            .await
            .unwrap();
        assert_eq!(
            store.get("tours", "a").unwrap().unwrap().get_str("company_id"),
            Some("C-1")
        );

        let err = store
            .commit_batch(&[
                FieldUpdate::set("tours", "b", "company_id", "C-2"),
                FieldUpdate::set("tours", "zzz", "company_id", "C-2"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound { .. }));
        assert!(!store.get("tours", "b").unwrap().unwrap().has_field("company_id"));
    }

    #[tokio::test]
    async fn test_create_and_persist_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("docs.sqlite");

        let id = {
            let store = SqliteStore::open(&path).unwrap();
            let mut fields = Fields::new();
            fields.insert("name".into(), Value::String("Acme".into()));
            store.create_record("companies", fields).await.unwrap()
        };

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.count("companies").unwrap(), 1);
        assert_eq!(
            reopened.get("companies", &id).unwrap().unwrap().get_str("name"),
            Some("Acme")
        );
    }
}
