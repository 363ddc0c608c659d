//! Centralized configuration for the reconciliation engine.
//!
//! [`EngineDefaults`] holds the constants, [`EngineConfig`] the tunable
//! runtime values, and [`MigrationSpec`] the parameters that turn the
//! generic engine into one concrete migration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ReconcileError, Result};
use crate::record::Record;
use crate::retry::RetryConfig;

/// Default values for engine configuration.
pub struct EngineDefaults;

impl EngineDefaults {
    // Scanning
    pub const PAGE_SIZE: usize = 100;
    pub const MAX_SCAN_PAGES: usize = 1000;
    pub const PAGE_DELAY: Duration = Duration::from_millis(100);

    // Processing
    pub const INDIVIDUAL_BATCH_SIZE: usize = 10;
    pub const MAX_BATCH_WRITES: usize = 500;
    pub const UNIT_DELAY: Duration = Duration::from_millis(250);

    // Observability
    pub const BATCH_HISTORY_LEN: usize = 10;
    pub const DEBUG_LOG_LEN: usize = 200;

    // Validation
    pub const MIN_TARGET_REF_LEN: usize = 3;

    // Store calls
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const RETRY_ATTEMPTS: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
}

/// Tunable runtime configuration for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    /// Records fetched per scan page.
    pub page_size: usize,
    /// Safety ceiling on pages per scan.
    pub max_scan_pages: usize,
    /// Individual records per unit of work.
    pub individual_batch_size: usize,
    /// Upper bound on documents in one batch commit.
    pub max_batch_writes: usize,
    /// Completed batches kept in the history.
    pub batch_history_len: usize,
    /// Lines kept in the debug log.
    pub debug_log_len: usize,
    /// Minimum length of a valid target reference.
    pub min_target_ref_len: usize,
    /// Pause after each scanned page.
    pub page_delay: Duration,
    /// Pause after each unit of work.
    pub unit_delay: Duration,
    /// Deadline for a single store call (`None` = adapter default).
    pub call_timeout: Option<Duration>,
    /// Retry policy applied to every store call.
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: EngineDefaults::PAGE_SIZE,
            max_scan_pages: EngineDefaults::MAX_SCAN_PAGES,
            individual_batch_size: EngineDefaults::INDIVIDUAL_BATCH_SIZE,
            max_batch_writes: EngineDefaults::MAX_BATCH_WRITES,
            batch_history_len: EngineDefaults::BATCH_HISTORY_LEN,
            debug_log_len: EngineDefaults::DEBUG_LOG_LEN,
            min_target_ref_len: EngineDefaults::MIN_TARGET_REF_LEN,
            page_delay: EngineDefaults::PAGE_DELAY,
            unit_delay: EngineDefaults::UNIT_DELAY,
            call_timeout: Some(EngineDefaults::CALL_TIMEOUT),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_scan_pages(mut self, pages: usize) -> Self {
        self.max_scan_pages = pages;
        self
    }

    pub fn with_individual_batch_size(mut self, size: usize) -> Self {
        self.individual_batch_size = size;
        self
    }

    pub fn with_max_batch_writes(mut self, size: usize) -> Self {
        self.max_batch_writes = size;
        self
    }

    pub fn with_batch_history_len(mut self, len: usize) -> Self {
        self.batch_history_len = len;
        self
    }

    pub fn with_debug_log_len(mut self, len: usize) -> Self {
        self.debug_log_len = len;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Remove the page and unit delays.
    ///
    /// Intended for tests and for stores that apply their own rate limit.
    pub fn without_throttle(mut self) -> Self {
        self.page_delay = Duration::ZERO;
        self.unit_delay = Duration::ZERO;
        self
    }

    /// Parse a config from JSON. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or break a run.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("page_size", self.page_size),
            ("max_scan_pages", self.max_scan_pages),
            ("individual_batch_size", self.individual_batch_size),
            ("max_batch_writes", self.max_batch_writes),
            ("batch_history_len", self.batch_history_len),
            ("debug_log_len", self.debug_log_len),
            ("min_target_ref_len", self.min_target_ref_len),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ReconcileError::Config {
                    message: format!("{} must be greater than zero", name),
                });
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ReconcileError::Config {
                message: "retry.max_attempts must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Input handed to a [`TargetBuilder`] when a target record is created.
#[derive(Debug, Clone, Copy)]
pub struct TargetSeed<'a> {
    /// Linking key shared by the members, `None` for an individual record.
    pub group_key: Option<&'a str>,
    /// Records that will reference the new target.
    pub members: &'a [Record],
}

/// Builds the field map of a newly created target record.
pub type TargetBuilder = Arc<dyn Fn(&MigrationSpec, TargetSeed<'_>) -> Map<String, Value> + Send + Sync>;

/// Parameters of one concrete migration.
///
/// The engine is generic; each dashboard flow is one of these.
#[derive(Clone)]
pub struct MigrationSpec {
    /// Human-readable name used in log lines and batch results.
    pub name: String,
    /// Collection scanned for records to reconcile.
    pub collection: String,
    /// Field on each record that references its target (e.g. `company_id`).
    pub target_field: String,
    /// Field whose value groups records onto a shared target (e.g. `license_key`).
    pub key_field: String,
    /// Collection where new target records are created.
    pub target_collection: String,
    /// Fields a record must carry (non-null) before it may be written.
    pub required_fields: Vec<String>,
    /// Builder for new target documents.
    pub target_builder: TargetBuilder,
}

impl fmt::Debug for MigrationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationSpec")
            .field("name", &self.name)
            .field("collection", &self.collection)
            .field("target_field", &self.target_field)
            .field("key_field", &self.key_field)
            .field("target_collection", &self.target_collection)
            .field("required_fields", &self.required_fields)
            .finish()
    }
}

impl MigrationSpec {
    /// Create a spec with the default target builder and no required fields.
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        target_field: impl Into<String>,
        key_field: impl Into<String>,
        target_collection: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            target_field: target_field.into(),
            key_field: key_field.into(),
            target_collection: target_collection.into(),
            required_fields: Vec::new(),
            target_builder: Arc::new(default_target_fields),
        }
    }

    /// Require a field to be present on every record that gets written.
    pub fn require_field(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    /// Replace the target builder.
    pub fn with_target_builder<F>(mut self, builder: F) -> Self
    where
        F: Fn(&MigrationSpec, TargetSeed<'_>) -> Map<String, Value> + Send + Sync + 'static,
    {
        self.target_builder = Arc::new(builder);
        self
    }

    /// Build the fields of a new target record.
    pub fn build_target(&self, seed: TargetSeed<'_>) -> Map<String, Value> {
        (self.target_builder)(self, seed)
    }

    /// Reject specs with empty names.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("collection", &self.collection),
            ("target_field", &self.target_field),
            ("key_field", &self.key_field),
            ("target_collection", &self.target_collection),
        ];
        for (name, value) in checks {
            if value.trim().is_empty() {
                return Err(ReconcileError::Config {
                    message: format!("migration {} must not be empty", name),
                });
            }
        }
        Ok(())
    }
}

/// Default target document: provenance plus the linking key when grouped.
pub fn default_target_fields(spec: &MigrationSpec, seed: TargetSeed<'_>) -> Map<String, Value> {
    let mut fields = Map::new();
    if let Some(key) = seed.group_key {
        fields.insert(spec.key_field.clone(), Value::String(key.to_string()));
    }
    fields.insert(
        "source_collection".into(),
        Value::String(spec.collection.clone()),
    );
    fields.insert(
        "source_record_ids".into(),
        Value::Array(
            seed.members
                .iter()
                .map(|r| Value::String(r.id.clone()))
                .collect(),
        ),
    );
    fields.insert("migration".into(), Value::String(spec.name.clone()));
    fields.insert(
        "created_at".into(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    fields
}
