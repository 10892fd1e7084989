//! Masking of personal data on migrated target records.
//!
//! A mask plan names one target object and the fields to scrub on it. Only
//! records that carry a legacy id are touched, so data created natively in
//! the target is left alone:
//!
//! ```json
//! {
//!   "entity": "Contact",
//!   "legacy_id_field": "Card_Legacy_Id__c",
//!   "fields": {
//!     "Phone": "phone",
//!     "Email": "email",
//!     "Social_Security_Number__c": "text"
//!   }
//! }
//! ```
//!
//! Masking is idempotent: values that already carry the mask are not sent
//! again, and a record with nothing left to mask is skipped.

use crate::config::MigrationConfig;
use crate::core::{MigrateError, Record, Result, SaveResult, record_str};
use crate::plan::validate_identifier;
use crate::report::{BatchFailure, EntityReport, RecordOutcome};
use crate::retry::execute_with_retry;
use crate::transport::{MAX_RECORDS_PER_CALL, OrgTransport, QueryCursor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

pub const MASKED_PHONE: &str = "0000000000";
pub const MASKED_EMAIL_SUFFIX: &str = ".invalid";
pub const MASKED_TEXT: &str = "MASKED";
pub const NOTHING_TO_MASK: &str = "nothing to mask";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskRule {
    Phone,
    /// Keeps the address readable but undeliverable.
    Email,
    Text,
}

impl MaskRule {
    /// Masked form of `value`, or `None` when it is empty or already masked.
    pub fn apply(&self, value: &str) -> Option<String> {
        if value.is_empty() {
            return None;
        }
        match self {
            Self::Phone => (value != MASKED_PHONE).then(|| MASKED_PHONE.to_string()),
            Self::Email => {
                (!value.ends_with(MASKED_EMAIL_SUFFIX)).then(|| format!("{value}{MASKED_EMAIL_SUFFIX}"))
            }
            Self::Text => (value != MASKED_TEXT).then(|| MASKED_TEXT.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskPlan {
    /// Target object name.
    pub entity: String,
    pub fields: BTreeMap<String, MaskRule>,
    /// Only records with this field set are masked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_id_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl MaskPlan {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            fields: BTreeMap::new(),
            legacy_id_field: None,
            condition: None,
        }
    }

    pub fn field(mut self, field: &str, rule: MaskRule) -> Self {
        self.fields.insert(field.to_string(), rule);
        self
    }

    pub fn legacy_id_field(mut self, field: &str) -> Self {
        self.legacy_id_field = Some(field.to_string());
        self
    }

    pub fn condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn report_name(&self) -> String {
        format!("{}_masking", self.entity)
    }

    pub fn soql(&self) -> String {
        let fields: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        let mut soql = format!("SELECT Id, {} FROM {}", fields.join(", "), self.entity);

        let mut filters: Vec<String> = Vec::new();
        if let Some(field) = &self.legacy_id_field {
            filters.push(format!("{field} != NULL"));
        }
        if let Some(condition) = self.condition.as_deref().map(str::trim) {
            if !condition.is_empty() {
                filters.push(format!("({condition})"));
            }
        }
        if !filters.is_empty() {
            soql.push_str(" WHERE ");
            soql.push_str(&filters.join(" AND "));
        }
        soql
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| MigrateError::Plan(format!("mask plan '{}': {msg}", self.entity));
        validate_identifier(&self.entity).map_err(invalid)?;
        if self.fields.is_empty() {
            return Err(invalid("at least one field is required".into()));
        }
        for field in self.fields.keys() {
            validate_identifier(field).map_err(invalid)?;
            if field.eq_ignore_ascii_case("Id") {
                return Err(invalid("'Id' cannot be masked".into()));
            }
        }
        if let Some(field) = &self.legacy_id_field {
            validate_identifier(field).map_err(invalid)?;
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(json)
            .map_err(|e| MigrateError::Plan(format!("invalid mask plan JSON: {e}")))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Io(format!("Failed to read mask plan '{}': {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }
}

/// Update payload for `record`: its `Id` plus every field whose value
/// changes. `None` when nothing would change.
pub fn masked_update(plan: &MaskPlan, record: &Record) -> Option<Record> {
    let id = record_str(record, "Id")?;
    let mut update = Record::new();
    for (field, rule) in &plan.fields {
        if let Some(masked) = record_str(record, field).and_then(|v| rule.apply(v)) {
            update.insert(field.clone(), Value::String(masked));
        }
    }
    if update.is_empty() {
        return None;
    }
    update.insert("Id".into(), Value::String(id.to_string()));
    Some(update)
}

/// Runs mask plans against one org.
pub struct Masker<'a, T: ?Sized> {
    target: &'a T,
    config: &'a MigrationConfig,
    run_id: Uuid,
    write_reports: bool,
}

impl<'a, T> Masker<'a, T>
where
    T: OrgTransport + ?Sized,
{
    pub fn new(target: &'a T, config: &'a MigrationConfig) -> Self {
        Self {
            target,
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

    pub async fn mask(&self, plan: &MaskPlan) -> Result<EntityReport> {
        plan.validate()?;
        let span = info_span!("mask.entity", entity = %plan.entity, run_id = %self.run_id);
        self.mask_inner(plan).instrument(span).await
    }

    async fn mask_inner(&self, plan: &MaskPlan) -> Result<EntityReport> {
        let batch_size = self.config.batch_size.clamp(1, MAX_RECORDS_PER_CALL);
        let soql = plan.soql();
        let mut report = EntityReport::new(self.run_id, &plan.report_name());
        event!(Level::INFO, batch_size, soql = %soql, "starting masking");

        let mut cursor = QueryCursor::new(self.target, &soql, &self.config.retry);
        let mut pending: Vec<Record> = Vec::new();
        let mut offset = 0usize;
        while let Some(page) = cursor.next_page().await? {
            report.read += page.len();
            pending.extend(page);
            while pending.len() >= batch_size {
                let batch: Vec<Record> = pending.drain(..batch_size).collect();
                self.mask_batch(plan, &batch, offset, &mut report).await;
                offset += batch_size;
            }
        }
        if !pending.is_empty() {
            self.mask_batch(plan, &pending, offset, &mut report).await;
        }

        report.finish();
        event!(
            Level::INFO,
            read = report.read,
            updated = report.updated,
            failed = report.failed,
            skipped = report.skipped,
            "masking finished"
        );
        if self.write_reports {
            match report.write_json(&self.config.reports_dir()) {
                Ok(path) => event!(Level::INFO, path = %path.display(), "report written"),
                Err(err) => event!(Level::WARN, error = %err, "failed to write report"),
            }
        }
        Ok(report)
    }

    async fn mask_batch(
        &self,
        plan: &MaskPlan,
        batch: &[Record],
        offset: usize,
        report: &mut EntityReport,
    ) {
        report.batches += 1;
        let mut pending: Vec<Record> = Vec::with_capacity(batch.len());
        for record in batch {
            match masked_update(plan, record) {
                Some(update) => pending.push(update),
                None => {
                    let id = record_str(record, "Id").unwrap_or_default();
                    report.record(RecordOutcome::skipped(id, NOTHING_TO_MASK));
                }
            }
        }
        if pending.is_empty() {
            return;
        }

        // records rejected for lock contention are resubmitted on their own
        let rounds = self.config.retry.attempts();
        let submitted = pending.len();
        let mut updated = 0usize;
        for round in 1..=rounds {
            let results = match self.update(plan, &pending, offset).await {
                Ok(results) => results,
                Err(err) => {
                    event!(
                        Level::ERROR,
                        offset,
                        batch_size = pending.len(),
                        error = %err,
                        "mask batch failed, continuing with next batch"
                    );
                    report.record_batch_failure(BatchFailure {
                        entity: plan.entity.clone(),
                        offset,
                        size: pending.len(),
                        error: err.to_string(),
                        source_ids: pending
                            .iter()
                            .filter_map(|r| record_str(r, "Id").map(str::to_string))
                            .collect(),
                        recovered: 0,
                    });
                    return;
                }
            };

            let mut retry: Vec<Record> = Vec::new();
            for (update, result) in pending.into_iter().zip(results) {
                let id = record_str(&update, "Id").unwrap_or_default().to_string();
                if result.success {
                    updated += 1;
                    report.record(RecordOutcome::updated(&id));
                } else if round < rounds && result.errors.iter().any(|e| e.is_transient()) {
                    retry.push(update);
                } else {
                    let message = result.error_message();
                    event!(Level::WARN, id = %id, error = %message, "record not masked");
                    report.record(RecordOutcome::failed(&id, message));
                }
            }
            if retry.is_empty() {
                break;
            }
            event!(Level::WARN, offset, records = retry.len(), round, "resubmitting rejected records");
            pending = retry;
        }

        event!(Level::INFO, offset, submitted, updated, "mask batch committed");
    }

    async fn update(&self, plan: &MaskPlan, records: &[Record], offset: usize) -> Result<Vec<SaveResult>> {
        let target = self.target;
        let label = format!("mask {} batch@{offset}", plan.entity);
        let results = execute_with_retry(
            &self.config.retry,
            MigrateError::is_transient,
            &label,
            || target.update(&plan.entity, records),
        )
        .await?;
        if results.len() != records.len() {
            return Err(MigrateError::Protocol(format!(
                "expected {} save results, got {}",
                records.len(),
                results.len()
            )));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_mask_rules() {
        assert_eq!(MaskRule::Phone.apply("+1 555 0100"), Some("0000000000".into()));
        assert_eq!(MaskRule::Phone.apply("0000000000"), None);
        assert_eq!(MaskRule::Email.apply("a@example.com"), Some("a@example.com.invalid".into()));
        assert_eq!(MaskRule::Email.apply("a@example.com.invalid"), None);
        assert_eq!(MaskRule::Text.apply("123-45-6789"), Some("MASKED".into()));
        assert_eq!(MaskRule::Text.apply("MASKED"), None);
        assert_eq!(MaskRule::Text.apply(""), None);
    }

    #[test]
    fn test_soql_filters_on_legacy_id() {
        let plan = MaskPlan::new("Contact")
            .field("Phone", MaskRule::Phone)
            .field("Email", MaskRule::Email)
            .legacy_id_field("Card_Legacy_Id__c");
        assert_eq!(
            plan.soql(),
            "SELECT Id, Email, Phone FROM Contact WHERE Card_Legacy_Id__c != NULL"
        );
        assert_eq!(
            plan.clone().condition("IsDeleted = false").soql(),
            "SELECT Id, Email, Phone FROM Contact WHERE Card_Legacy_Id__c != NULL AND (IsDeleted = false)"
        );
        assert_eq!(
            MaskPlan::new("User").field("Phone", MaskRule::Phone).soql(),
            "SELECT Id, Phone FROM User"
        );
    }

    #[test]
    fn test_masked_update_only_carries_changes() {
        let plan = MaskPlan::new("Contact")
            .field("Phone", MaskRule::Phone)
            .field("Email", MaskRule::Email)
            .field("Fax", MaskRule::Phone);
        let update = masked_update(
            &plan,
            &record(json!({
                "Id": "003A",
                "Phone": "555",
                "Email": "a@example.com.invalid",
                "Fax": null
            })),
        )
        .unwrap();
        assert_eq!(
            Value::Object(update),
            json!({ "Id": "003A", "Phone": "0000000000" })
        );

        let done = record(json!({ "Id": "003B", "Phone": "0000000000" }));
        assert!(masked_update(&plan, &done).is_none());
    }

    #[test]
    fn test_plan_json_and_validation() {
        let plan = MaskPlan::from_json(
            &json!({
                "entity": "Account",
                "legacy_id_field": "Card_Legacy_Id__c",
                "fields": { "Phone": "phone", "Federal_Tax_ID__c": "text" }
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(plan.fields["Federal_Tax_ID__c"], MaskRule::Text);
        assert_eq!(plan.report_name(), "Account_masking");

        assert!(MaskPlan::new("Account").validate().is_err());
        assert!(MaskPlan::new("Account").field("Id", MaskRule::Text).validate().is_err());
        assert!(
            MaskPlan::from_json(r#"{"entity":"Account","fields":{"Phone":"scramble"}}"#).is_err()
        );
    }
}
