//! Batch transfer driver.
//!
//! Reads source records page by page, regroups them into batches of
//! `batch_size`, transforms each batch through the resolver and creates it in
//! the target org. Every new source-to-target pair is recorded in the mapping
//! store, and the store is flushed after each batch.
//!
//! Batches are not atomic: records that succeed inside a partially failed
//! call stay in the target. A batch call the target rejects outright is
//! resubmitted one record at a time. A batch that still cannot be created,
//! or whose call kept failing transiently, is reported with its offset and
//! the run moves on.

use crate::config::MigrationConfig;
use crate::core::{MigrateError, Record, Result, SaveResult, record_str};
use crate::mapping::MappingStore;
use crate::plan::EntityPlan;
use crate::report::{BatchFailure, EntityReport, RecordOutcome};
use crate::resolver::IdResolver;
use crate::retry::execute_with_retry;
use crate::transform::{TransformStats, Transformed, transform_record};
use crate::transport::{MAX_RECORDS_PER_CALL, OrgTransport, QueryCursor};
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

/// Number of distinct errors echoed in the end-of-entity summary.
const SUMMARY_ERRORS: usize = 3;

/// Splits `total` records into `(offset, len)` batches of at most `batch_size`.
pub fn batch_bounds(total: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = batch_size.max(1);
    (0..total)
        .step_by(batch_size)
        .map(|offset| (offset, batch_size.min(total - offset)))
        .collect()
}

pub struct BatchDriver<'a, S: ?Sized, T: ?Sized> {
    source: &'a S,
    target: &'a T,
    store: &'a mut MappingStore,
    config: &'a MigrationConfig,
    run_id: Uuid,
    write_reports: bool,
}

impl<'a, S, T> BatchDriver<'a, S, T>
where
    S: OrgTransport + ?Sized,
    T: OrgTransport + ?Sized,
{
    pub fn new(
        source: &'a S,
        target: &'a T,
        store: &'a mut MappingStore,
        config: &'a MigrationConfig,
    ) -> Self {
        Self {
            source,
            target,
            store,
            config,
            run_id: Uuid::new_v4(),
            write_reports: true,
        }
    }

    /// Shares one run id across several entity reports.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Keeps reports in memory only.
    pub fn without_report_files(mut self) -> Self {
        self.write_reports = false;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Migrates every source record selected by `plan`.
    ///
    /// Fails only when the plan is invalid, the source cannot be read, or the
    /// mapping store cannot be flushed. Batch failures end up in the report.
    pub async fn migrate(&mut self, plan: &EntityPlan) -> Result<EntityReport> {
        plan.validate()?;
        let span = info_span!(
            "migrate.entity",
            entity = %plan.entity,
            run_id = %self.run_id
        );
        self.migrate_inner(plan).instrument(span).await
    }

    async fn migrate_inner(&mut self, plan: &EntityPlan) -> Result<EntityReport> {
        let batch_size = self.config.batch_size.clamp(1, MAX_RECORDS_PER_CALL);
        let soql = plan.soql();
        let mut report = EntityReport::new(self.run_id, &plan.entity);

        event!(Level::INFO, batch_size, soql = %soql, "starting entity migration");

        let source = self.source;
        let mut cursor = QueryCursor::new(source, &soql, &self.config.retry);
        let mut pending: Vec<Record> = Vec::new();
        let mut offset = 0usize;
        let mut first_page = true;

        loop {
            let page = match cursor.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(err) => {
                    event!(
                        Level::ERROR,
                        entity = %plan.entity,
                        offset,
                        error = %err,
                        "source query failed, aborting entity"
                    );
                    return Err(err);
                }
            };
            if first_page {
                first_page = false;
                if let Some(total) = cursor.total_size() {
                    event!(Level::INFO, total, "source records matched");
                }
            }
            report.read += page.len();
            pending.extend(page);

            while pending.len() >= batch_size {
                let batch: Vec<Record> = pending.drain(..batch_size).collect();
                self.run_batch(plan, batch, offset, &mut report).await?;
                offset += batch_size;
            }
        }
        if !pending.is_empty() {
            let batch = std::mem::take(&mut pending);
            self.run_batch(plan, batch, offset, &mut report).await?;
        }

        report.finish();
        self.log_summary(&report);
        if self.write_reports {
            match report.write_json(&self.config.reports_dir()) {
                Ok(path) => event!(Level::INFO, path = %path.display(), "report written"),
                Err(err) => event!(Level::WARN, error = %err, "failed to write report"),
            }
        }
        Ok(report)
    }

    async fn run_batch(
        &mut self,
        plan: &EntityPlan,
        batch: Vec<Record>,
        offset: usize,
        report: &mut EntityReport,
    ) -> Result<()> {
        report.batches += 1;
        let batch_len = batch.len();

        let mut stats = TransformStats::default();
        let mut source_ids: Vec<String> = Vec::with_capacity(batch_len);
        let mut payload: Vec<Record> = Vec::with_capacity(batch_len);
        {
            let resolver = IdResolver::new(&*self.store, self.config.fallback_owner_id.as_deref());
            for record in &batch {
                let source_id = record_str(record, "Id").unwrap_or_default().to_string();
                match transform_record(plan, &resolver, record, &mut stats) {
                    Transformed::Ready(out) => {
                        source_ids.push(source_id);
                        payload.push(out);
                    }
                    Transformed::Skipped(reason) => {
                        event!(Level::DEBUG, source_id = %source_id, reason = %reason, "record skipped");
                        report.record(RecordOutcome::skipped(&source_id, reason));
                    }
                }
            }
        }
        report.references.merge(stats);

        if payload.is_empty() {
            event!(Level::INFO, offset, batch_size = batch_len, "batch had nothing to create");
            return Ok(());
        }

        let target = self.target;
        let sobject = plan.target_name();
        let label = format!("create {sobject} batch@{offset}");
        let result = execute_with_retry(
            &self.config.retry,
            MigrateError::is_transient,
            &label,
            || target.create(sobject, &payload),
        )
        .await
        .and_then(|results| {
            if results.len() == payload.len() {
                Ok(results)
            } else {
                Err(MigrateError::Protocol(format!(
                    "expected {} save results, got {}",
                    payload.len(),
                    results.len()
                )))
            }
        });

        let results = match result {
            Ok(results) => results,
            Err(err) if !err.is_transient() && payload.len() > 1 => {
                event!(
                    Level::WARN,
                    entity = %plan.entity,
                    offset,
                    batch_size = payload.len(),
                    error = %err,
                    "batch call rejected, submitting records one at a time"
                );
                report.record_fallbacks += 1;
                return self
                    .create_one_by_one(plan, source_ids, payload, offset, err, report)
                    .await;
            }
            Err(err) => {
                event!(
                    Level::ERROR,
                    entity = %plan.entity,
                    offset,
                    batch_size = payload.len(),
                    error = %err,
                    "batch failed, continuing with next batch"
                );
                report.record_batch_failure(BatchFailure {
                    entity: plan.entity.clone(),
                    offset,
                    size: payload.len(),
                    error: err.to_string(),
                    source_ids,
                    recovered: 0,
                });
                return Ok(());
            }
        };

        let scope = plan.mapping_scope();
        let mut created = 0usize;
        for (source_id, result) in source_ids.iter().zip(results) {
            if self.apply_result(scope, source_id, result, report) {
                created += 1;
            }
        }

        self.store.flush()?;
        event!(
            Level::INFO,
            offset,
            batch_size = batch_len,
            created,
            failed = payload.len() - created,
            "batch committed"
        );
        Ok(())
    }

    /// Resubmits the records of a rejected batch call individually, so one
    /// malformed record cannot sink its siblings.
    async fn create_one_by_one(
        &mut self,
        plan: &EntityPlan,
        source_ids: Vec<String>,
        payload: Vec<Record>,
        offset: usize,
        batch_error: MigrateError,
        report: &mut EntityReport,
    ) -> Result<()> {
        let target = self.target;
        let sobject = plan.target_name();
        let scope = plan.mapping_scope();
        let submitted = payload.len();
        let mut still_failed: Vec<String> = Vec::new();
        let mut recovered = 0usize;

        for (source_id, record) in source_ids.into_iter().zip(payload) {
            let label = format!("create {sobject} {source_id}");
            let single = [record];
            let result = execute_with_retry(
                &self.config.retry,
                MigrateError::is_transient,
                &label,
                || target.create(sobject, &single),
            )
            .await;

            let created = match result {
                Ok(mut results) if results.len() == 1 => {
                    let saved = results.swap_remove(0);
                    self.apply_result(scope, &source_id, saved, report)
                }
                Ok(results) => {
                    report.record(RecordOutcome::failed(
                        &source_id,
                        format!("expected 1 save result, got {}", results.len()),
                    ));
                    false
                }
                Err(err) => {
                    report.record(RecordOutcome::failed(&source_id, err.to_string()));
                    false
                }
            };
            if created {
                recovered += 1;
            } else {
                still_failed.push(source_id);
            }
        }

        self.store.flush()?;
        event!(
            Level::INFO,
            offset,
            batch_size = submitted,
            recovered,
            failed = still_failed.len(),
            "batch committed record by record"
        );
        if !still_failed.is_empty() {
            report.batch_failures.push(BatchFailure {
                entity: plan.entity.clone(),
                offset,
                size: submitted,
                error: batch_error.to_string(),
                source_ids: still_failed,
                recovered,
            });
        }
        Ok(())
    }

    /// Records one save result; true when the record was created.
    fn apply_result(
        &mut self,
        scope: &str,
        source_id: &str,
        result: SaveResult,
        report: &mut EntityReport,
    ) -> bool {
        match (result.success, result.id.as_deref()) {
            (true, Some(target_id)) => {
                self.store.insert(scope, source_id, target_id);
                report.record(RecordOutcome::created(source_id, target_id));
                true
            }
            (true, None) => {
                report.record(RecordOutcome::failed(source_id, "created without an id"));
                false
            }
            (false, _) => {
                let message = result.error_message();
                event!(
                    Level::WARN,
                    source_id = %source_id,
                    error = %message,
                    "record rejected"
                );
                report.record(RecordOutcome::failed(source_id, message));
                false
            }
        }
    }

    fn log_summary(&self, report: &EntityReport) {
        event!(
            Level::INFO,
            entity = %report.entity,
            read = report.read,
            batches = report.batches,
            created = report.created,
            failed = report.failed,
            skipped = report.skipped,
            fallback_substitutions = report.references.fallback_substitutions,
            unmapped_references = report.references.unmapped_references,
            success_rate = report.success_rate(),
            "entity migration finished"
        );
        for error in report.first_errors(SUMMARY_ERRORS) {
            event!(Level::WARN, entity = %report.entity, error = %error, "sample failure");
        }
    }
}
