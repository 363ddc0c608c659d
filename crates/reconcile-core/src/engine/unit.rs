//! Processing: phase 1 (groups) then phase 2 (individual sub-batches).

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::config::TargetSeed;
use crate::error::{ReconcileError, Result};
use crate::group::ReconciliationGroup;
use crate::record::{FieldUpdate, Record};
use crate::state::{BatchResult, LogLevel, OperationType};

use super::ReconcileEngine;

/// One unit of work, committed as a whole.
#[derive(Debug, Clone)]
enum Unit {
    Group(ReconciliationGroup),
    Individuals(Vec<Record>),
}

impl Unit {
    fn members(&self) -> &[Record] {
        match self {
            Unit::Group(group) => &group.members,
            Unit::Individuals(records) => records,
        }
    }
}

/// Counters for one unit, turned into a [`BatchResult`] at the end.
#[derive(Debug, Default)]
struct UnitTally {
    successful: usize,
    skipped: usize,
    errors: usize,
    targets_created: usize,
    error_messages: Vec<String>,
}

impl ReconcileEngine {
    /// Work through every unit not yet settled.
    ///
    /// On resume the remaining units are recomputed from the discovered
    /// groups and individuals, dropping anything whose records are all
    /// settled already.
    pub(super) async fn process(&mut self) -> Result<()> {
        let units = self.remaining_units();
        self.state.progress.total_batches = self.state.progress.current_batch + units.len();

        for unit in units {
            self.pause.check()?;
            self.process_unit(unit).await?;

            if !self.config.unit_delay.is_zero() {
                tokio::time::sleep(self.config.unit_delay).await;
            }
        }
        Ok(())
    }

    fn remaining_units(&self) -> Vec<Unit> {
        let progress = &self.state.progress;
        let unsettled = |r: &Record| !progress.is_settled(&r.id);

        let mut units: Vec<Unit> = self
            .state
            .discovery
            .groups
            .iter()
            .filter(|group| group.members.iter().any(unsettled))
            .cloned()
            .map(Unit::Group)
            .collect();

        let individuals: Vec<Record> = self
            .state
            .discovery
            .individuals
            .iter()
            .filter(|r| unsettled(r))
            .cloned()
            .collect();
        let batch_size = self.config.individual_batch_size.max(1);
        units.extend(
            individuals
                .chunks(batch_size)
                .map(|chunk| Unit::Individuals(chunk.to_vec())),
        );
        units
    }

    /// Process one unit: skip settled members, validate, resolve targets,
    /// commit, then record a [`BatchResult`].
    ///
    /// Record-level failures are counted and the unit continues. A commit
    /// that still fails after retries is returned as `Err` and ends the run.
    async fn process_unit(&mut self, unit: Unit) -> Result<()> {
        let started = Instant::now();
        let total_in_batch = unit.members().len();
        let batch_number = self.state.progress.current_batch + 1;
        let mut tally = UnitTally::default();

        self.state.current_batch = unit.members().to_vec();
        self.emit();

        let (operation_type, group_key, label) = match &unit {
            Unit::Group(group) => (
                OperationType::Group,
                Some(group.group_key.clone()),
                format!("group {}", group.group_key),
            ),
            Unit::Individuals(_) => (
                OperationType::Individual,
                None,
                format!("individual batch {}", batch_number),
            ),
        };

        let (existing_target, members) = match unit {
            Unit::Group(group) => (Some(group.existing_target_id), group.members),
            Unit::Individuals(records) => (None, records),
        };

        let writable = self.admit_members(members, &mut tally);

        let staged = match existing_target {
            Some(existing) => {
                self.resolve_group_target(group_key.as_deref(), existing, writable, &mut tally)
                    .await
            }
            None => self.resolve_individual_targets(writable, &mut tally).await,
        };

        self.commit_staged(&label, &staged).await?;
        for (record_id, _) in &staged {
            self.state.progress.record_success(record_id);
        }
        tally.successful += staged.len();

        let result = BatchResult {
            batch_number,
            total_in_batch,
            successful: tally.successful,
            skipped: tally.skipped,
            errors: tally.errors,
            targets_created: tally.targets_created,
            error_messages: tally.error_messages,
            processing_time_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
            operation_type,
            group_key,
        };

        self.state.progress.current_batch = batch_number;
        self.state.current_batch.clear();
        self.state.batch_history.push(result);
        self.log(
            LogLevel::Info,
            format!(
                "Unit {}/{} ({}): {} successful, {} skipped, {} errors, {} targets created",
                batch_number,
                self.state.progress.total_batches,
                label,
                tally.successful,
                tally.skipped,
                tally.errors,
                tally.targets_created
            ),
        );
        Ok(())
    }

    /// Drop settled members (skipped) and members failing validation (errors).
    fn admit_members(&mut self, members: Vec<Record>, tally: &mut UnitTally) -> Vec<Record> {
        let mut writable = Vec::with_capacity(members.len());
        for record in members {
            if self.state.progress.is_settled(&record.id) {
                self.state.progress.record_skip();
                tally.skipped += 1;
                continue;
            }
            match self.validate_record(&record) {
                Ok(()) => writable.push(record),
                Err(e) => self.record_failure(&record.id, &e, tally),
            }
        }
        writable
    }

    fn validate_record(&self, record: &Record) -> Result<()> {
        if record.id.trim().is_empty() {
            return Err(ReconcileError::validation("id", "record id is empty"));
        }
        for field in &self.spec.required_fields {
            if !record.has_field(field) {
                return Err(ReconcileError::validation(
                    field.clone(),
                    format!("missing on record {}", record.id),
                ));
            }
        }
        Ok(())
    }

    fn record_failure(&mut self, record_id: &str, err: &ReconcileError, tally: &mut UnitTally) {
        self.state.progress.record_error(record_id);
        tally.errors += 1;
        let message = format!("{}: {}", record_id, err);
        tally.error_messages.push(message);
        self.log(
            LogLevel::Warn,
            format!(
                "Record {} failed ({}): {}",
                record_id,
                err.class(),
                err.detailed()
            ),
        );
    }

    /// One target for the whole group: the existing one, or a single new one.
    async fn resolve_group_target(
        &mut self,
        group_key: Option<&str>,
        existing: Option<String>,
        members: Vec<Record>,
        tally: &mut UnitTally,
    ) -> Vec<(String, String)> {
        if members.is_empty() {
            return Vec::new();
        }

        let target = match existing {
            Some(target) => Ok(target),
            None => {
                let result = self.create_target(group_key, &members).await;
                if result.is_ok() {
                    tally.targets_created += 1;
                }
                result
            }
        };

        let target = target.and_then(|id| self.check_target_ref(id));
        match target {
            Ok(target) => members
                .into_iter()
                .map(|record| (record.id, target.clone()))
                .collect(),
            Err(e) => {
                for record in &members {
                    self.record_failure(&record.id, &e, tally);
                }
                Vec::new()
            }
        }
    }

    /// A fresh target per record. Individuals never share a target.
    async fn resolve_individual_targets(
        &mut self,
        members: Vec<Record>,
        tally: &mut UnitTally,
    ) -> Vec<(String, String)> {
        let mut staged = Vec::with_capacity(members.len());
        for record in members {
            let created = self
                .create_target(None, std::slice::from_ref(&record))
                .await;
            if created.is_ok() {
                tally.targets_created += 1;
            }
            match created.and_then(|id| self.check_target_ref(id)) {
                Ok(target) => staged.push((record.id, target)),
                Err(e) => self.record_failure(&record.id, &e, tally),
            }
        }
        staged
    }

    async fn create_target(&mut self, group_key: Option<&str>, members: &[Record]) -> Result<String> {
        let store = Arc::clone(&self.store);
        let collection = self.spec.target_collection.clone();
        let fields = self.spec.build_target(TargetSeed {
            group_key,
            members,
        });
        let what = match group_key {
            Some(key) => format!("Creating target for group {}", key),
            None => format!(
                "Creating target for record {}",
                members.first().map(|r| r.id.as_str()).unwrap_or("?")
            ),
        };

        let id = self
            .retrying(&what, || store.create_record(&collection, fields.clone()))
            .await?;
        self.state.progress.targets_created += 1;
        self.log(LogLevel::Debug, format!("{}: created {}", what, id));
        Ok(id)
    }

    /// The write-time check of a target reference, using the shared rule.
    fn check_target_ref(&self, target: String) -> Result<String> {
        if self.classifier.rule().is_valid_str(&target) {
            Ok(target.trim().to_string())
        } else {
            Err(ReconcileError::validation(
                self.spec.target_field.clone(),
                format!("target reference {:?} is not valid", target),
            ))
        }
    }

    /// Commit staged `(record id, target id)` pairs in bounded chunks.
    async fn commit_staged(&mut self, label: &str, staged: &[(String, String)]) -> Result<()> {
        if staged.is_empty() {
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let chunk_size = self
            .config
            .max_batch_writes
            .min(store.max_batch_size())
            .max(1);
        let chunks = staged.len().div_ceil(chunk_size);

        for (index, chunk) in staged.chunks(chunk_size).enumerate() {
            let updates: Vec<FieldUpdate> = chunk
                .iter()
                .map(|(record_id, target)| {
                    FieldUpdate::set(
                        self.spec.collection.clone(),
                        record_id.clone(),
                        self.spec.target_field.clone(),
                        target.clone(),
                    )
                })
                .collect();

            let what = if chunks > 1 {
                format!("Committing {} (chunk {}/{})", label, index + 1, chunks)
            } else {
                format!("Committing {}", label)
            };
            self.retrying(&what, || store.commit_batch(&updates)).await?;
        }
        Ok(())
    }
}
