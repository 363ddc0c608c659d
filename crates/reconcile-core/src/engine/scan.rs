//! Discovery: paged scan, classification and grouping probes.

use std::sync::Arc;

use crate::error::Result;
use crate::group::{partition_by_key, Grouper};
use crate::state::LogLevel;

use super::ReconcileEngine;

impl ReconcileEngine {
    /// Scan the collection and resolve every group.
    ///
    /// Resumable: the cursor, the classified records and the groups still
    /// to probe all live in `RunState`, so a pause at any check point loses
    /// nothing. Nothing here writes to the store.
    pub(super) async fn discover(&mut self) -> Result<()> {
        self.scan_pages().await?;

        if !self.state.discovery.partitioned {
            let keyed = std::mem::take(&mut self.state.discovery.keyed);
            self.state.discovery.pending_groups = partition_by_key(keyed).into();
            self.state.discovery.partitioned = true;
            let message = format!(
                "Found {} linking keys to probe",
                self.state.discovery.pending_groups.len()
            );
            self.log(LogLevel::Debug, message);
        }

        self.probe_groups().await?;

        let groups = self.state.discovery.groups.len();
        let individuals = self.state.discovery.individuals.len();
        let batch_size = self.config.individual_batch_size.max(1);
        self.state.progress.total_batches = groups + individuals.div_ceil(batch_size);

        let p = &self.state.progress;
        let message = format!(
            "Scan complete: {} records in {} pages, {} need reconciliation ({} in {} groups, {} individual)",
            p.scanned_records, p.pages_scanned, p.total_needing_work, p.keyed_records, groups, individuals
        );
        self.log(LogLevel::Info, message);
        Ok(())
    }

    async fn scan_pages(&mut self) -> Result<()> {
        let store = Arc::clone(&self.store);
        let collection = self.spec.collection.clone();
        let page_size = self.config.page_size;

        while !self.state.discovery.scan_done {
            self.pause.check()?;

            let cursor = self.state.discovery.cursor.clone();
            let page_number = self.state.progress.pages_scanned + 1;
            let page = self
                .retrying(&format!("Fetching page {}", page_number), || {
                    store.scan_page(&collection, page_size, cursor.as_ref())
                })
                .await?;

            let fetched = page.records.len();
            let mut needing = 0;
            for record in page.records {
                let classified = self.classifier.classify(record);
                if !classified.needs_reconciliation {
                    continue;
                }
                needing += 1;
                let progress = &mut self.state.progress;
                progress.total_needing_work += 1;
                match classified.group_key {
                    Some(key) => {
                        progress.keyed_records += 1;
                        self.state.discovery.keyed.push((key, classified.record));
                    }
                    None => {
                        progress.individual_records += 1;
                        self.state.discovery.individuals.push(classified.record);
                    }
                }
            }

            self.state.progress.pages_scanned = page_number;
            self.state.progress.scanned_records += fetched;
            self.state.discovery.cursor = page.next_cursor;

            self.log(
                LogLevel::Debug,
                format!(
                    "Page {}: {} records, {} need reconciliation",
                    page_number, fetched, needing
                ),
            );

            if self.state.discovery.cursor.is_none() {
                self.state.discovery.scan_done = true;
            } else if page_number >= self.config.max_scan_pages {
                self.state.discovery.scan_done = true;
                self.state.progress.scan_truncated = true;
                self.log(
                    LogLevel::Warn,
                    format!(
                        "Scan stopped at the {} page ceiling with records left unread",
                        self.config.max_scan_pages
                    ),
                );
            } else if !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }
        Ok(())
    }

    async fn probe_groups(&mut self) -> Result<()> {
        loop {
            self.pause.check()?;

            let Some((key, members)) = self.state.discovery.pending_groups.pop_front() else {
                return Ok(());
            };

            let (resolved, stats) = Grouper::new(
                self.store.as_ref(),
                &self.spec,
                &self.classifier,
                &self.config.retry,
                self.config.call_timeout,
            )
            .resolve(key.clone(), members.clone())
            .await;

            self.log_retries(&format!("Probe for {}", key), &stats);

            let group = match resolved {
                Ok(group) => group,
                Err(e) => {
                    self.state.discovery.pending_groups.push_front((key, members));
                    return Err(e);
                }
            };

            let message = match &group.existing_target_id {
                Some(target) => format!(
                    "Group {} ({} records) reuses existing target {}",
                    group.group_key,
                    group.len(),
                    target
                ),
                None => {
                    self.state.progress.no_target_found += 1;
                    format!(
                        "Group {} ({} records) has no existing target",
                        group.group_key,
                        group.len()
                    )
                }
            };
            self.state.discovery.groups.push(group);
            self.log(LogLevel::Debug, message);
        }
    }
}
