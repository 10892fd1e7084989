//! Attachment transfer with parent remapping.
//!
//! Attachments are moved one record per create call, since each carries its
//! base64 body. The body is staged on disk before upload and the staged copy
//! is removed once the target accepts it. Failed uploads leave the staged
//! file behind for a manual re-run.

use crate::batch::batch_bounds;
use crate::config::MigrationConfig;
use crate::core::{MigrateError, Record, Result, record_str};
use crate::mapping::MappingStore;
use crate::plan::{DEFAULT_OWNER_SCOPE, validate_identifier};
use crate::report::{EntityReport, RecordOutcome};
use crate::resolver::{IdResolver, Resolution};
use crate::retry::execute_with_retry;
use crate::transport::{OrgTransport, query_all};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

pub const ATTACHMENT: &str = "Attachment";
pub const NO_PARENT_MAPPING: &str = "no target parent mapping";

/// Processed attachments between progress lines.
const PROGRESS_INTERVAL: usize = 50;

#[derive(Debug, Clone)]
pub struct AttachmentRequest {
    /// Parent object; also the mapping scope parents are resolved in.
    pub parent: String,
    /// Narrows the parent set, e.g. `IsPersonAccount = false`.
    pub condition: Option<String>,
}

impl AttachmentRequest {
    pub fn new(parent: &str) -> Self {
        Self {
            parent: parent.to_string(),
            condition: None,
        }
    }

    pub fn condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn soql(&self) -> String {
        let parents = match self.condition.as_deref().map(str::trim) {
            Some(condition) if !condition.is_empty() => {
                format!("SELECT Id FROM {} WHERE {}", self.parent, condition)
            }
            _ => format!("SELECT Id FROM {}", self.parent),
        };
        format!(
            "SELECT Id, Name, ParentId, OwnerId, ContentType FROM {ATTACHMENT} WHERE ParentId IN ({parents})"
        )
    }
}

pub struct AttachmentMigrator<'a, S: ?Sized, T: ?Sized> {
    source: &'a S,
    target: &'a T,
    store: &'a mut MappingStore,
    config: &'a MigrationConfig,
    run_id: Uuid,
    write_reports: bool,
}

impl<'a, S, T> AttachmentMigrator<'a, S, T>
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

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn without_report_files(mut self) -> Self {
        self.write_reports = false;
        self
    }

    pub async fn migrate(&mut self, request: &AttachmentRequest) -> Result<EntityReport> {
        validate_identifier(&request.parent).map_err(MigrateError::Config)?;
        let span = info_span!(
            "migrate.attachments",
            parent = %request.parent,
            run_id = %self.run_id
        );
        self.migrate_inner(request).instrument(span).await
    }

    async fn migrate_inner(&mut self, request: &AttachmentRequest) -> Result<EntityReport> {
        let mut report = EntityReport::new(self.run_id, ATTACHMENT);
        let staging = self.config.staging_dir();
        tokio::fs::create_dir_all(&staging).await.map_err(|e| {
            MigrateError::Io(format!(
                "Failed to create staging directory '{}': {}",
                staging.display(),
                e
            ))
        })?;

        let records = query_all(self.source, &request.soql(), &self.config.retry).await?;
        report.read = records.len();
        event!(Level::INFO, total = records.len(), "attachments matched");

        let mut processed = 0usize;
        for (offset, len) in batch_bounds(records.len(), self.config.batch_size) {
            report.batches += 1;
            for record in &records[offset..offset + len] {
                let outcome = self.transfer_one(request, record, &staging, &mut report).await;
                report.record(outcome);

                processed += 1;
                if processed % PROGRESS_INTERVAL == 0 {
                    event!(
                        Level::INFO,
                        processed,
                        created = report.created,
                        failed = report.failed,
                        skipped = report.skipped,
                        "attachment progress"
                    );
                }
            }
            self.store.flush()?;
        }

        report.finish();
        event!(
            Level::INFO,
            read = report.read,
            created = report.created,
            failed = report.failed,
            skipped = report.skipped,
            success_rate = report.success_rate(),
            "attachment migration finished"
        );
        if self.write_reports {
            match report.write_json(&self.config.reports_dir()) {
                Ok(path) => event!(Level::INFO, path = %path.display(), "report written"),
                Err(err) => event!(Level::WARN, error = %err, "failed to write report"),
            }
        }
        Ok(report)
    }

    async fn transfer_one(
        &mut self,
        request: &AttachmentRequest,
        record: &Record,
        staging: &Path,
        report: &mut EntityReport,
    ) -> RecordOutcome {
        let source_id = record_str(record, "Id").unwrap_or_default().to_string();
        let name = record_str(record, "Name").unwrap_or("attachment").to_string();

        let (parent, owner) = {
            let resolver =
                IdResolver::new(&*self.store, self.config.fallback_owner_id.as_deref());
            let parent = record_str(record, "ParentId")
                .map(|id| resolver.resolve_reference(&request.parent, id))
                .unwrap_or(Resolution::Unmapped);
            let owner = record_str(record, "OwnerId")
                .map(|id| resolver.resolve_owner(DEFAULT_OWNER_SCOPE, id))
                .unwrap_or(Resolution::Unmapped);
            (parent, owner)
        };

        let Some(parent_id) = parent.target_id().map(str::to_string) else {
            report.references.unmapped_references += 1;
            event!(Level::DEBUG, source_id = %source_id, "attachment parent not mapped");
            return RecordOutcome::skipped(&source_id, NO_PARENT_MAPPING);
        };
        match &owner {
            Resolution::Fallback(_) => report.references.fallback_substitutions += 1,
            Resolution::Unmapped if record.get("OwnerId").is_some_and(Value::is_string) => {
                report.references.unmapped_references += 1
            }
            _ => {}
        }

        let source = self.source;
        let label = format!("download {ATTACHMENT} {source_id}");
        let body = match execute_with_retry(
            &self.config.retry,
            MigrateError::is_transient,
            &label,
            || source.fetch_blob(ATTACHMENT, &source_id, "Body"),
        )
        .await
        {
            Ok(body) => body,
            Err(err) => {
                event!(Level::ERROR, source_id = %source_id, error = %err, "download failed");
                return RecordOutcome::failed(&source_id, format!("download failed: {err}"));
            }
        };

        let staged = staged_path(staging, &source_id, &name);
        if let Err(err) = tokio::fs::write(&staged, &body).await {
            event!(Level::ERROR, source_id = %source_id, error = %err, "staging failed");
            return RecordOutcome::failed(&source_id, format!("staging failed: {err}"));
        }

        let mut payload = Record::new();
        payload.insert("ParentId".into(), Value::String(parent_id));
        payload.insert("Name".into(), Value::String(name));
        payload.insert("Body".into(), Value::String(STANDARD.encode(&body)));
        if let Some(content_type) = record.get("ContentType").filter(|v| v.is_string()) {
            payload.insert("ContentType".into(), content_type.clone());
        }
        if let Some(owner_id) = owner.target_id() {
            payload.insert("OwnerId".into(), Value::String(owner_id.to_string()));
        }

        let target = self.target;
        let label = format!("upload {ATTACHMENT} {source_id}");
        let records = [payload];
        let result = execute_with_retry(
            &self.config.retry,
            MigrateError::is_transient,
            &label,
            || target.create(ATTACHMENT, &records),
        )
        .await;

        let save = match result {
            Ok(mut results) if !results.is_empty() => results.swap_remove(0),
            Ok(_) => {
                return RecordOutcome::failed(&source_id, "no save result returned");
            }
            Err(err) => {
                event!(
                    Level::ERROR,
                    source_id = %source_id,
                    staged = %staged.display(),
                    error = %err,
                    "upload failed, staged file kept"
                );
                return RecordOutcome::failed(&source_id, err.to_string());
            }
        };

        match (save.success, save.id.as_deref()) {
            (true, Some(target_id)) => {
                self.store.insert(ATTACHMENT, &source_id, target_id);
                if let Err(err) = tokio::fs::remove_file(&staged).await {
                    event!(Level::WARN, staged = %staged.display(), error = %err, "could not remove staged file");
                }
                RecordOutcome::created(&source_id, target_id)
            }
            _ => {
                let message = save.error_message();
                event!(
                    Level::WARN,
                    source_id = %source_id,
                    staged = %staged.display(),
                    error = %message,
                    "attachment rejected, staged file kept"
                );
                RecordOutcome::failed(&source_id, message)
            }
        }
    }
}

/// `<dir>/<id>_<name>` with characters that are invalid in file names
/// replaced by `_`.
pub fn staged_path(dir: &Path, source_id: &str, name: &str) -> PathBuf {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid =
        INVALID.get_or_init(|| Regex::new(r#"[:<>"/\\|?*\x00-\x1F]"#).expect("valid regex"));
    let mut clean = invalid.replace_all(name.trim(), "_").into_owned();
    if clean.is_empty() {
        clean = "file.bin".to_string();
    }
    dir.join(format!("{source_id}_{clean}"))
}
