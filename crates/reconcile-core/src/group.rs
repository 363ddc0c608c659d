//! Grouping of keyed records onto shared targets.
//!
//! Records that share a linking key should end up pointing at one target.
//! For each key the [`Grouper`] issues exactly one bounded probe (limit 1)
//! asking whether some record with that key already carries a valid
//! target reference. It never scans the collection per group.
//!
//! Assumption: a linking key maps to at most one distinct existing target.
//! If two records with the same key hold different targets, whichever the
//! store returns first wins; conflicts are not detected.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::classify::Classifier;
use crate::config::MigrationSpec;
use crate::error::{ReconcileError, Result};
use crate::record::{ProbeFilter, Record};
use crate::retry::{retry_async, with_timeout, RetryConfig, RetryStats};
use crate::store::DocumentStore;

/// Keyed records that will share one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationGroup {
    pub group_key: String,
    pub members: Vec<Record>,
    pub existing_target_id: Option<String>,
    /// Always `existing_target_id.is_none()`.
    pub needs_new_target: bool,
}

impl ReconciliationGroup {
    /// Build a group; `needs_new_target` is derived from `existing_target_id`.
    pub fn new(
        group_key: impl Into<String>,
        members: Vec<Record>,
        existing_target_id: Option<String>,
    ) -> Self {
        let needs_new_target = existing_target_id.is_none();
        Self {
            group_key: group_key.into(),
            members,
            existing_target_id,
            needs_new_target,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Partition keyed records by key.
///
/// Groups come out in the order their key was first seen and members keep
/// their input order, so the result is deterministic for a given input.
pub fn partition_by_key(
    keyed: impl IntoIterator<Item = (String, Record)>,
) -> Vec<(String, Vec<Record>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<Record>)> = Vec::new();

    for (key, record) in keyed {
        match index.get(&key) {
            Some(&pos) => groups[pos].1.push(record),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![record]));
            }
        }
    }
    groups
}

/// Resolves groups against the store.
///
/// The lookup requires a reference accepted by the classifier's
/// [`TargetRefRule`](crate::classify::TargetRefRule), so a holder with a
/// too-short reference never hides a valid one behind it.
///
/// Group keys are trimmed, but the lookup compares the trimmed key with
/// the stored field as-is. A holder stored as `" LIC1"` joins the `LIC1`
/// group during the scan yet is not found by the lookup, so the group gets
/// a new target when that holder is its only source of one.
pub struct Grouper<'a> {
    store: &'a dyn DocumentStore,
    spec: &'a MigrationSpec,
    classifier: &'a Classifier,
    retry: &'a RetryConfig,
    call_timeout: Option<Duration>,
}

impl<'a> Grouper<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        spec: &'a MigrationSpec,
        classifier: &'a Classifier,
        retry: &'a RetryConfig,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            spec,
            classifier,
            retry,
            call_timeout,
        }
    }

    /// The probe issued for a key.
    pub fn probe_filter(&self, key: &str) -> ProbeFilter {
        ProbeFilter::new()
            .eq(self.spec.key_field.clone(), key)
            .valid_ref(self.spec.target_field.clone(), self.classifier.rule())
    }

    /// Probe the store for one key and build its group.
    ///
    /// The probe is retried on transient errors. The returned stats let the
    /// caller log each retried attempt.
    pub async fn resolve(
        &self,
        key: String,
        members: Vec<Record>,
    ) -> (Result<ReconciliationGroup>, RetryStats) {
        let filter = self.probe_filter(&key);
        let collection = self.spec.collection.as_str();
        let call_timeout = self.call_timeout;

        let (found, stats) = retry_async(
            self.retry,
            || with_timeout(call_timeout, self.store.probe_one(collection, &filter)),
            ReconcileError::is_transient,
        )
        .await;

        let found = match found {
            Ok(found) => found,
            Err(e) => return (Err(e), stats),
        };

        let existing = found.as_ref().and_then(|holder| {
            let target = self.classifier.existing_target(holder);
            if target.is_none() {
                // Only reachable with a store that ignores the reference condition
                warn!(
                    "Probe for key {} returned {} whose reference fails validation",
                    key, holder.id
                );
            }
            target.map(str::to_string)
        });

        debug!(
            "Group {} ({} members): existing target {:?}",
            key,
            members.len(),
            existing
        );
        (Ok(ReconciliationGroup::new(key, members, existing)), stats)
    }

    /// Partition keyed records and resolve every group.
    ///
    /// Fails on the first probe that still errors after retries.
    pub async fn build_groups(
        &self,
        keyed: impl IntoIterator<Item = (String, Record)>,
    ) -> Result<Vec<ReconciliationGroup>> {
        let mut groups = Vec::new();
        for (key, members) in partition_by_key(keyed) {
            let (group, _) = self.resolve(key, members).await;
            groups.push(group?);
        }
        Ok(groups)
    }
}
