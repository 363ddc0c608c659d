//! Record classification.
//!
//! [`TargetRefRule`] is the one place where "does this record already
//! point at a valid target" is decided. Scan-time classification, grouping
//! resolution and final write validation all go through it.

use serde::Serialize;
use serde_json::Value;

use crate::config::{EngineDefaults, MigrationSpec};
use crate::record::Record;

/// Validity rule for target references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetRefRule {
    pub min_len: usize,
}

impl Default for TargetRefRule {
    fn default() -> Self {
        Self {
            min_len: EngineDefaults::MIN_TARGET_REF_LEN,
        }
    }
}

impl TargetRefRule {
    pub fn new(min_len: usize) -> Self {
        Self { min_len }
    }

    /// Return the trimmed reference if the value is a valid one.
    ///
    /// Invalid: absent, null, not a string, blank, or shorter than `min_len`
    /// characters after trimming.
    pub fn valid_ref<'a>(&self, value: Option<&'a Value>) -> Option<&'a str> {
        let trimmed = value?.as_str()?.trim();
        if trimmed.is_empty() || trimmed.chars().count() < self.min_len {
            None
        } else {
            Some(trimmed)
        }
    }

    pub fn is_valid(&self, value: Option<&Value>) -> bool {
        self.valid_ref(value).is_some()
    }

    /// Check a candidate reference string before it is written.
    pub fn is_valid_str(&self, value: &str) -> bool {
        let trimmed = value.trim();
        !trimmed.is_empty() && trimmed.chars().count() >= self.min_len
    }
}

/// A record annotated with its classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedRecord {
    pub record: Record,
    pub needs_reconciliation: bool,
    /// Linking key for keyed records, `None` for individual ones.
    pub group_key: Option<String>,
}

impl ClassifiedRecord {
    pub fn is_keyed(&self) -> bool {
        self.group_key.is_some()
    }
}

/// Extract a usable linking key: a string, non-empty after trimming.
///
/// The trimmed value is returned so that `"LIC1"` and `" LIC1 "` group
/// together.
pub fn linking_key<'a>(record: &'a Record, key_field: &str) -> Option<&'a str> {
    let trimmed = record.get_str(key_field)?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Pure classifier for one migration.
#[derive(Debug, Clone)]
pub struct Classifier {
    target_field: String,
    key_field: String,
    rule: TargetRefRule,
}

impl Classifier {
    pub fn new(target_field: impl Into<String>, key_field: impl Into<String>, rule: TargetRefRule) -> Self {
        Self {
            target_field: target_field.into(),
            key_field: key_field.into(),
            rule,
        }
    }

    /// Classifier for a migration spec.
    pub fn for_spec(spec: &MigrationSpec, rule: TargetRefRule) -> Self {
        Self::new(spec.target_field.clone(), spec.key_field.clone(), rule)
    }

    pub fn rule(&self) -> TargetRefRule {
        self.rule
    }

    pub fn target_field(&self) -> &str {
        &self.target_field
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Whether the record lacks a valid target reference.
    pub fn needs_reconciliation(&self, record: &Record) -> bool {
        !self.rule.is_valid(record.get(&self.target_field))
    }

    /// The record's current valid target reference, if any.
    pub fn existing_target<'a>(&self, record: &'a Record) -> Option<&'a str> {
        self.rule.valid_ref(record.get(&self.target_field))
    }

    /// Classify a record. Total and side-effect free.
    pub fn classify(&self, record: Record) -> ClassifiedRecord {
        let needs_reconciliation = self.needs_reconciliation(&record);
        let group_key = linking_key(&record, &self.key_field).map(str::to_string);
        ClassifiedRecord {
            record,
            needs_reconciliation,
            group_key,
        }
    }
}
