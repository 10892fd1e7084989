//! File transfer: content documents, their links and public distributions.
//!
//! A document is found through its links to the requested parent records.
//! All of its links are then read, including shares with users, so sharing
//! survives the move. The latest version's binary is downloaded, staged on
//! disk and uploaded as a new `ContentVersion` published on the first
//! remapped parent. The platform creates the target document from it. Every
//! remaining link is recreated against its remapped entity with the source
//! share type and visibility. Inferred (`I`) shares become viewer (`V`)
//! shares, since `I` cannot be set through the API.
//!
//! Documents, versions, links and distributions are all recorded in the
//! mapping store. A re-run reuses documents that are already mapped and only
//! adds the links and distributions that are still missing.

use crate::attachments::{NO_PARENT_MAPPING, staged_path};
use crate::batch::batch_bounds;
use crate::config::MigrationConfig;
use crate::core::{MigrateError, Record, Result, SaveResult, record_str};
use crate::mapping::MappingStore;
use crate::mapping::seed::LOOKUP_CHUNK_SIZE;
use crate::plan::validate_identifier;
use crate::report::{EntityReport, RecordOutcome};
use crate::resolver::IdResolver;
use crate::retry::execute_with_retry;
use crate::transport::{MAX_RECORDS_PER_CALL, OrgTransport, escape_soql, query_all, soql_in_list};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

pub const CONTENT_DOCUMENT: &str = "ContentDocument";
pub const CONTENT_VERSION: &str = "ContentVersion";
pub const CONTENT_DOCUMENT_LINK: &str = "ContentDocumentLink";
pub const CONTENT_DISTRIBUTION: &str = "ContentDistribution";

pub const ALREADY_MIGRATED: &str = "already migrated";
pub const DOCUMENT_NOT_MIGRATED: &str = "document not migrated";

const DEFAULT_SHARE_TYPE: &str = "V";
const INFERRED_SHARE_TYPE: &str = "I";
const DEFAULT_VISIBILITY: &str = "AllUsers";
const USER_SCOPE: &str = "User";

/// Distribution settings copied as they are.
const DISTRIBUTION_PREFERENCES: [&str; 9] = [
    "PreferencesAllowPDFDownload",
    "PreferencesAllowOriginalDownload",
    "PreferencesPasswordRequired",
    "PreferencesNotifyOnVisit",
    "PreferencesLinkLatestVersion",
    "PreferencesAllowViewInBrowser",
    "PreferencesExpires",
    "PreferencesNotifyRndtnComplete",
    "ExpiryDate",
];

#[derive(Debug, Clone)]
pub struct FileRequest {
    /// Parent object whose files move; also the default mapping scope for
    /// links whose entity type is unknown.
    pub parent: String,
    /// Narrows the parent set.
    pub condition: Option<String>,
    /// Extra filter on the parent links, e.g.
    /// `ContentDocument.CreatedDate >= LAST_N_MONTHS:24`.
    pub document_condition: Option<String>,
    /// Target `ContentVersion` field that receives the source version id.
    pub legacy_id_field: Option<String>,
    pub distributions: bool,
}

impl FileRequest {
    pub fn new(parent: &str) -> Self {
        Self {
            parent: parent.to_string(),
            condition: None,
            document_condition: None,
            legacy_id_field: None,
            distributions: true,
        }
    }

    pub fn condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn document_condition(mut self, condition: &str) -> Self {
        self.document_condition = Some(condition.to_string());
        self
    }

    pub fn legacy_id_field(mut self, field: &str) -> Self {
        self.legacy_id_field = Some(field.to_string());
        self
    }

    pub fn without_distributions(mut self) -> Self {
        self.distributions = false;
        self
    }

    pub fn parent_soql(&self) -> String {
        match non_empty(self.condition.as_deref()) {
            Some(condition) => format!("SELECT Id FROM {} WHERE {}", self.parent, condition),
            None => format!("SELECT Id FROM {}", self.parent),
        }
    }

    fn parent_links_soql(&self, parent_ids: &[String]) -> String {
        let mut soql = format!(
            "SELECT Id, ContentDocumentId FROM {CONTENT_DOCUMENT_LINK} WHERE LinkedEntityId IN ({})",
            soql_in_list(parent_ids)
        );
        if let Some(condition) = non_empty(self.document_condition.as_deref()) {
            soql.push_str(" AND ");
            soql.push_str(condition);
        }
        soql
    }

    fn validate(&self) -> Result<()> {
        validate_identifier(&self.parent).map_err(MigrateError::Config)?;
        if let Some(field) = &self.legacy_id_field {
            validate_identifier(field).map_err(MigrateError::Config)?;
        }
        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// One report per kind of record a file transfer creates.
#[derive(Debug, Clone, PartialEq)]
pub struct FileTransferReport {
    pub documents: EntityReport,
    pub links: EntityReport,
    pub distributions: EntityReport,
}

impl FileTransferReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            documents: EntityReport::new(run_id, CONTENT_DOCUMENT),
            links: EntityReport::new(run_id, CONTENT_DOCUMENT_LINK),
            distributions: EntityReport::new(run_id, CONTENT_DISTRIBUTION),
        }
    }

    pub fn reports(&self) -> [&EntityReport; 3] {
        [&self.documents, &self.links, &self.distributions]
    }

    fn finish(&mut self) {
        self.documents.finish();
        self.links.finish();
        self.distributions.finish();
    }
}

/// A source document with every link it has and its latest version.
#[derive(Debug)]
struct SourceDocument {
    id: String,
    links: Vec<Record>,
    version: Option<Record>,
}

/// Target entity for each link of a document, in link order.
struct LinkTargets {
    targets: Vec<Option<String>>,
    /// First remapped parent, preferring links to the requested parent type.
    publish_location: Option<String>,
}

pub struct FileMigrator<'a, S: ?Sized, T: ?Sized> {
    source: &'a S,
    target: &'a T,
    store: &'a mut MappingStore,
    config: &'a MigrationConfig,
    run_id: Uuid,
    write_reports: bool,
}

impl<'a, S, T> FileMigrator<'a, S, T>
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

    pub async fn migrate(&mut self, request: &FileRequest) -> Result<FileTransferReport> {
        request.validate()?;
        let span = info_span!(
            "migrate.files",
            parent = %request.parent,
            run_id = %self.run_id
        );
        self.migrate_inner(request).instrument(span).await
    }

    async fn migrate_inner(&mut self, request: &FileRequest) -> Result<FileTransferReport> {
        let mut report = FileTransferReport::new(self.run_id);
        let staging = self.config.staging_dir();
        tokio::fs::create_dir_all(&staging).await.map_err(|e| {
            MigrateError::Io(format!(
                "Failed to create staging directory '{}': {}",
                staging.display(),
                e
            ))
        })?;

        let documents = self.collect_documents(request).await?;
        report.documents.read = documents.len();
        report.links.read = documents.iter().map(|d| d.links.len()).sum();
        event!(
            Level::INFO,
            documents = report.documents.read,
            links = report.links.read,
            "documents matched"
        );

        // source document id -> target version id, for distributions
        let mut versions: HashMap<String, String> = HashMap::new();
        for (offset, len) in batch_bounds(documents.len(), self.config.batch_size) {
            report.documents.batches += 1;
            for document in &documents[offset..offset + len] {
                let targets = self.link_targets(request, document);
                let Some(target) = self
                    .transfer_document(request, document, &targets, &staging, &mut report)
                    .await?
                else {
                    continue;
                };
                self.link_document(document, &targets, &target, &mut report.links)
                    .await?;
                if let Some(version_id) = target.version_id {
                    versions.insert(document.id.clone(), version_id);
                }
            }
            self.store.flush()?;
            event!(
                Level::INFO,
                offset,
                batch_size = len,
                created = report.documents.created,
                failed = report.documents.failed,
                "document batch committed"
            );
        }

        if request.distributions && !versions.is_empty() {
            self.copy_distributions(request, &versions, &mut report.distributions)
                .await?;
            self.store.flush()?;
        }

        report.finish();
        for entity in report.reports() {
            event!(
                Level::INFO,
                entity = %entity.entity,
                read = entity.read,
                created = entity.created,
                failed = entity.failed,
                skipped = entity.skipped,
                success_rate = entity.success_rate(),
                "file migration finished"
            );
            if self.write_reports {
                match entity.write_json(&self.config.reports_dir()) {
                    Ok(path) => event!(Level::INFO, path = %path.display(), "report written"),
                    Err(err) => event!(Level::WARN, error = %err, "failed to write report"),
                }
            }
        }
        Ok(report)
    }

    async fn collect_documents(&self, request: &FileRequest) -> Result<Vec<SourceDocument>> {
        let policy = &self.config.retry;
        let parent_ids: Vec<String> = query_all(self.source, &request.parent_soql(), policy)
            .await?
            .iter()
            .filter_map(|r| record_str(r, "Id").map(str::to_string))
            .collect();

        let mut document_ids: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for chunk in parent_ids.chunks(LOOKUP_CHUNK_SIZE) {
            let links = query_all(self.source, &request.parent_links_soql(chunk), policy).await?;
            for link in &links {
                if let Some(document_id) = record_str(link, "ContentDocumentId") {
                    if seen.insert(document_id.to_string()) {
                        document_ids.push(document_id.to_string());
                    }
                }
            }
        }

        let mut links: HashMap<String, Vec<Record>> = HashMap::new();
        let mut versions: HashMap<String, Record> = HashMap::new();
        for chunk in document_ids.chunks(LOOKUP_CHUNK_SIZE) {
            let in_list = soql_in_list(chunk);
            let soql = format!(
                "SELECT Id, ContentDocumentId, LinkedEntityId, ShareType, Visibility, LinkedEntity.Type \
                 FROM {CONTENT_DOCUMENT_LINK} WHERE ContentDocumentId IN ({in_list})"
            );
            for link in query_all(self.source, &soql, policy).await? {
                if let Some(document_id) = record_str(&link, "ContentDocumentId") {
                    links.entry(document_id.to_string()).or_default().push(link);
                }
            }

            let soql = format!(
                "SELECT Id, ContentDocumentId, Title, PathOnClient FROM {CONTENT_VERSION} \
                 WHERE IsLatest = true AND ContentDocumentId IN ({in_list})"
            );
            for version in query_all(self.source, &soql, policy).await? {
                if let Some(document_id) = record_str(&version, "ContentDocumentId") {
                    versions.insert(document_id.to_string(), version);
                }
            }
        }

        Ok(document_ids
            .into_iter()
            .map(|id| SourceDocument {
                links: links.remove(&id).unwrap_or_default(),
                version: versions.remove(&id),
                id,
            })
            .collect())
    }

    /// Resolves each link's entity in the scope named by its entity type.
    /// User shares resolve like any other reference and never fall back.
    fn link_targets(&self, request: &FileRequest, document: &SourceDocument) -> LinkTargets {
        let resolver = IdResolver::new(&*self.store, None);
        let mut targets = Vec::with_capacity(document.links.len());
        let mut preferred: Option<String> = None;
        let mut any: Option<String> = None;

        for link in &document.links {
            let scope = link_scope(link, &request.parent);
            let target = record_str(link, "LinkedEntityId")
                .and_then(|id| resolver.resolve_reference(scope, id).target_id().map(str::to_string));
            if let Some(id) = &target {
                if preferred.is_none() && scope == request.parent {
                    preferred = Some(id.clone());
                }
                if any.is_none() && scope != USER_SCOPE {
                    any = Some(id.clone());
                }
            }
            targets.push(target);
        }

        LinkTargets {
            targets,
            publish_location: preferred.or(any),
        }
    }

    /// Uploads the document's latest version, or finds the copy an earlier
    /// run made. `None` when the document could not be placed in the target.
    async fn transfer_document(
        &mut self,
        request: &FileRequest,
        document: &SourceDocument,
        targets: &LinkTargets,
        staging: &Path,
        report: &mut FileTransferReport,
    ) -> Result<Option<DocumentTarget>> {
        let source_version = document
            .version
            .as_ref()
            .and_then(|v| record_str(v, "Id"))
            .map(str::to_string);

        if let Some(document_id) = self.store.get(CONTENT_DOCUMENT, &document.id) {
            let target = DocumentTarget {
                document_id: document_id.to_string(),
                version_id: source_version
                    .as_deref()
                    .and_then(|id| self.store.get(CONTENT_VERSION, id))
                    .map(str::to_string),
            };
            event!(Level::DEBUG, document = %document.id, target = %target.document_id, "document already migrated");
            report.documents.record(RecordOutcome::skipped(&document.id, ALREADY_MIGRATED));
            return Ok(Some(target));
        }

        let (Some(version), Some(version_id)) = (document.version.as_ref(), source_version) else {
            report.documents.record(RecordOutcome::failed(
                &document.id,
                "no latest ContentVersion found",
            ));
            skip_links(document, &mut report.links, DOCUMENT_NOT_MIGRATED);
            return Ok(None);
        };

        let Some(location) = targets.publish_location.clone() else {
            report.documents.references.unmapped_references += 1;
            event!(Level::DEBUG, document = %document.id, "no remapped parent for document");
            report.documents.record(RecordOutcome::skipped(&document.id, NO_PARENT_MAPPING));
            skip_links(document, &mut report.links, NO_PARENT_MAPPING);
            return Ok(None);
        };

        let title = record_str(version, "Title")
            .filter(|t| !t.trim().is_empty())
            .unwrap_or("File")
            .to_string();
        let path_on_client = record_str(version, "PathOnClient")
            .filter(|p| !p.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{title}.bin"));

        let source = self.source;
        let label = format!("download {CONTENT_VERSION} {version_id}");
        let body = match execute_with_retry(
            &self.config.retry,
            MigrateError::is_transient,
            &label,
            || source.fetch_blob(CONTENT_VERSION, &version_id, "VersionData"),
        )
        .await
        {
            Ok(body) => body,
            Err(err) => {
                event!(Level::ERROR, document = %document.id, error = %err, "download failed");
                report
                    .documents
                    .record(RecordOutcome::failed(&document.id, format!("download failed: {err}")));
                skip_links(document, &mut report.links, DOCUMENT_NOT_MIGRATED);
                return Ok(None);
            }
        };

        let staged = staged_path(staging, &version_id, &path_on_client);
        if let Err(err) = tokio::fs::write(&staged, &body).await {
            event!(Level::ERROR, document = %document.id, error = %err, "staging failed");
            report
                .documents
                .record(RecordOutcome::failed(&document.id, format!("staging failed: {err}")));
            skip_links(document, &mut report.links, DOCUMENT_NOT_MIGRATED);
            return Ok(None);
        }

        let mut payload = Record::new();
        payload.insert("Title".into(), Value::String(title));
        payload.insert("PathOnClient".into(), Value::String(path_on_client));
        payload.insert("VersionData".into(), Value::String(STANDARD.encode(&body)));
        payload.insert("FirstPublishLocationId".into(), Value::String(location));
        if let Some(field) = &request.legacy_id_field {
            payload.insert(field.clone(), Value::String(version_id.clone()));
        }

        let target = self.target;
        let label = format!("upload {CONTENT_VERSION} {version_id}");
        let records = [payload];
        let saved = execute_with_retry(
            &self.config.retry,
            MigrateError::is_transient,
            &label,
            || target.create(CONTENT_VERSION, &records),
        )
        .await
        .and_then(single_result);

        let new_version = match saved {
            Ok(saved) if saved.success => saved.id,
            Ok(saved) => {
                let message = saved.error_message();
                event!(
                    Level::WARN,
                    document = %document.id,
                    staged = %staged.display(),
                    error = %message,
                    "file rejected, staged file kept"
                );
                report.documents.record(RecordOutcome::failed(&document.id, message));
                skip_links(document, &mut report.links, DOCUMENT_NOT_MIGRATED);
                return Ok(None);
            }
            Err(err) => {
                event!(
                    Level::ERROR,
                    document = %document.id,
                    staged = %staged.display(),
                    error = %err,
                    "upload failed, staged file kept"
                );
                report.documents.record(RecordOutcome::failed(&document.id, err.to_string()));
                skip_links(document, &mut report.links, DOCUMENT_NOT_MIGRATED);
                return Ok(None);
            }
        };
        let Some(new_version) = new_version else {
            report
                .documents
                .record(RecordOutcome::failed(&document.id, "created without an id"));
            skip_links(document, &mut report.links, DOCUMENT_NOT_MIGRATED);
            return Ok(None);
        };
        self.store.insert(CONTENT_VERSION, &version_id, &new_version);

        let soql = format!(
            "SELECT Id, ContentDocumentId FROM {CONTENT_VERSION} WHERE Id = '{}'",
            escape_soql(&new_version)
        );
        let created = query_all(self.target, &soql, &self.config.retry).await?;
        let Some(document_id) = created
            .first()
            .and_then(|v| record_str(v, "ContentDocumentId"))
            .map(str::to_string)
        else {
            report.documents.record(RecordOutcome::failed(
                &document.id,
                format!("no ContentDocumentId for new version {new_version}"),
            ));
            skip_links(document, &mut report.links, DOCUMENT_NOT_MIGRATED);
            return Ok(None);
        };

        self.store.insert(CONTENT_DOCUMENT, &document.id, &document_id);
        if let Err(err) = tokio::fs::remove_file(&staged).await {
            event!(Level::WARN, staged = %staged.display(), error = %err, "could not remove staged file");
        }
        report
            .documents
            .record(RecordOutcome::created(&document.id, &document_id));
        Ok(Some(DocumentTarget {
            document_id,
            version_id: Some(new_version),
        }))
    }

    /// Recreates the document's links that the target does not have yet.
    async fn link_document(
        &mut self,
        document: &SourceDocument,
        targets: &LinkTargets,
        target: &DocumentTarget,
        report: &mut EntityReport,
    ) -> Result<()> {
        let soql = format!(
            "SELECT Id, LinkedEntityId FROM {CONTENT_DOCUMENT_LINK} WHERE ContentDocumentId = '{}'",
            escape_soql(&target.document_id)
        );
        let mut existing: HashMap<String, String> = HashMap::new();
        for link in query_all(self.target, &soql, &self.config.retry).await? {
            if let (Some(id), Some(entity)) =
                (record_str(&link, "Id"), record_str(&link, "LinkedEntityId"))
            {
                existing.insert(entity.to_string(), id.to_string());
            }
        }

        let mut queued: HashSet<String> = HashSet::new();
        let mut source_ids: Vec<String> = Vec::new();
        let mut payload: Vec<Record> = Vec::new();
        for (link, entity) in document.links.iter().zip(&targets.targets) {
            let link_id = record_str(link, "Id").unwrap_or_default().to_string();
            let Some(entity) = entity else {
                report.references.unmapped_references += 1;
                let reason = format!(
                    "no target mapping for {} {}",
                    link_type(link).unwrap_or("entity"),
                    record_str(link, "LinkedEntityId").unwrap_or_default()
                );
                report.record(RecordOutcome::skipped(&link_id, reason));
                continue;
            };
            if let Some(existing_id) = existing.get(entity) {
                self.store.insert(CONTENT_DOCUMENT_LINK, &link_id, existing_id);
                report.record(RecordOutcome::created(&link_id, existing_id));
                continue;
            }
            if !queued.insert(entity.clone()) {
                report.record(RecordOutcome::skipped(&link_id, "duplicate link"));
                continue;
            }

            let share_type = match record_str(link, "ShareType") {
                Some(INFERRED_SHARE_TYPE) | None => DEFAULT_SHARE_TYPE,
                Some(share_type) => share_type,
            };
            let visibility = record_str(link, "Visibility").unwrap_or(DEFAULT_VISIBILITY);
            let mut record = Record::new();
            record.insert(
                "ContentDocumentId".into(),
                Value::String(target.document_id.clone()),
            );
            record.insert("LinkedEntityId".into(), Value::String(entity.clone()));
            record.insert("ShareType".into(), Value::String(share_type.to_string()));
            record.insert("Visibility".into(), Value::String(visibility.to_string()));
            source_ids.push(link_id);
            payload.push(record);
        }

        self.create_all(CONTENT_DOCUMENT_LINK, &source_ids, &payload, report)
            .await;
        Ok(())
    }

    async fn copy_distributions(
        &mut self,
        request: &FileRequest,
        versions: &HashMap<String, String>,
        report: &mut EntityReport,
    ) -> Result<()> {
        let mut document_ids: Vec<&String> = versions.keys().collect();
        document_ids.sort();

        let mut source_ids: Vec<String> = Vec::new();
        let mut payload: Vec<Record> = Vec::new();
        for chunk in document_ids.chunks(LOOKUP_CHUNK_SIZE) {
            let soql = format!(
                "SELECT Id, Name, ContentVersionId, ContentDocumentId, RelatedRecordId, RelatedRecord.Type, {} \
                 FROM {CONTENT_DISTRIBUTION} WHERE ContentDocumentId IN ({})",
                DISTRIBUTION_PREFERENCES.join(", "),
                soql_in_list(chunk)
            );
            let distributions = query_all(self.source, &soql, &self.config.retry).await?;
            report.read += distributions.len();

            let resolver = IdResolver::new(&*self.store, None);
            for distribution in &distributions {
                let source_id = record_str(distribution, "Id").unwrap_or_default().to_string();
                if self.store.contains(CONTENT_DISTRIBUTION, &source_id) {
                    report.record(RecordOutcome::skipped(&source_id, ALREADY_MIGRATED));
                    continue;
                }
                let Some(version_id) = record_str(distribution, "ContentDocumentId")
                    .and_then(|id| versions.get(id))
                else {
                    report.record(RecordOutcome::skipped(&source_id, DOCUMENT_NOT_MIGRATED));
                    continue;
                };

                let mut record = Record::new();
                if let Some(name) = distribution.get("Name").filter(|v| v.is_string()) {
                    record.insert("Name".into(), name.clone());
                }
                record.insert("ContentVersionId".into(), Value::String(version_id.clone()));
                if let Some(related) = record_str(distribution, "RelatedRecordId") {
                    let scope = distribution
                        .get("RelatedRecord")
                        .and_then(|r| r.get("Type"))
                        .and_then(Value::as_str)
                        .unwrap_or(request.parent.as_str());
                    match resolver.resolve_reference(scope, related).target_id() {
                        Some(id) => {
                            record.insert("RelatedRecordId".into(), Value::String(id.to_string()));
                        }
                        None => report.references.unmapped_references += 1,
                    }
                }
                for field in DISTRIBUTION_PREFERENCES {
                    if let Some(value) = distribution.get(field).filter(|v| !v.is_null()) {
                        record.insert(field.to_string(), value.clone());
                    }
                }
                source_ids.push(source_id);
                payload.push(record);
            }
        }

        report.batches += payload.len().div_ceil(MAX_RECORDS_PER_CALL);
        self.create_all(CONTENT_DISTRIBUTION, &source_ids, &payload, report)
            .await;
        Ok(())
    }

    /// Creates `payload` in calls of at most [`MAX_RECORDS_PER_CALL`] and
    /// records every outcome under `sobject`'s mapping scope.
    async fn create_all(
        &mut self,
        sobject: &str,
        source_ids: &[String],
        payload: &[Record],
        report: &mut EntityReport,
    ) {
        let target = self.target;
        for (ids, chunk) in source_ids
            .chunks(MAX_RECORDS_PER_CALL)
            .zip(payload.chunks(MAX_RECORDS_PER_CALL))
        {
            let label = format!("create {sobject} x{}", chunk.len());
            let result = execute_with_retry(
                &self.config.retry,
                MigrateError::is_transient,
                &label,
                || target.create(sobject, chunk),
            )
            .await;

            let results = match result {
                Ok(results) if results.len() == chunk.len() => results,
                Ok(results) => {
                    let message = format!(
                        "expected {} save results, got {}",
                        chunk.len(),
                        results.len()
                    );
                    ids.iter()
                        .for_each(|id| report.record(RecordOutcome::failed(id, message.clone())));
                    continue;
                }
                Err(err) => {
                    event!(Level::ERROR, sobject, error = %err, "create failed");
                    ids.iter()
                        .for_each(|id| report.record(RecordOutcome::failed(id, err.to_string())));
                    continue;
                }
            };

            for (source_id, saved) in ids.iter().zip(results) {
                match (saved.success, saved.id.as_deref()) {
                    (true, Some(target_id)) => {
                        self.store.insert(sobject, source_id, target_id);
                        report.record(RecordOutcome::created(source_id, target_id));
                    }
                    (true, None) => {
                        report.record(RecordOutcome::failed(source_id, "created without an id"));
                    }
                    (false, _) => {
                        let message = saved.error_message();
                        event!(Level::WARN, sobject, source_id = %source_id, error = %message, "record rejected");
                        report.record(RecordOutcome::failed(source_id, message));
                    }
                }
            }
        }
    }
}

/// Where a source document lives in the target org.
#[derive(Debug, Clone)]
struct DocumentTarget {
    document_id: String,
    version_id: Option<String>,
}

fn single_result(mut results: Vec<SaveResult>) -> Result<SaveResult> {
    if results.len() == 1 {
        Ok(results.swap_remove(0))
    } else {
        Err(MigrateError::Protocol(format!(
            "expected 1 save result, got {}",
            results.len()
        )))
    }
}

fn link_type(link: &Record) -> Option<&str> {
    link.get("LinkedEntity")
        .and_then(|entity| entity.get("Type"))
        .and_then(Value::as_str)
}

fn link_scope<'r>(link: &'r Record, parent: &'r str) -> &'r str {
    link_type(link).unwrap_or(parent)
}

fn skip_links(document: &SourceDocument, report: &mut EntityReport, reason: &str) {
    for link in &document.links {
        let link_id = record_str(link, "Id").unwrap_or_default();
        report.record(RecordOutcome::skipped(link_id, reason));
    }
}
