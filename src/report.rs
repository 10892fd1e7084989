//! Per-entity run report, persisted as JSON so failed slices can be re-run
//! by hand.

use crate::core::{MigrateError, Result};
use crate::transform::TransformStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Created,
    Updated,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RecordOutcome {
    pub fn created(source_id: &str, target_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            target_id: Some(target_id.to_string()),
            status: OutcomeStatus::Created,
            message: None,
        }
    }

    /// An existing target record changed in place.
    pub fn updated(target_id: &str) -> Self {
        Self {
            source_id: target_id.to_string(),
            target_id: Some(target_id.to_string()),
            status: OutcomeStatus::Updated,
            message: None,
        }
    }

    pub fn failed(source_id: &str, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.to_string(),
            target_id: None,
            status: OutcomeStatus::Failed,
            message: Some(message.into()),
        }
    }

    pub fn skipped(source_id: &str, reason: impl Into<String>) -> Self {
        Self {
            source_id: source_id.to_string(),
            target_id: None,
            status: OutcomeStatus::Skipped,
            message: Some(reason.into()),
        }
    }
}

/// A batch call the target rejected as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub entity: String,
    /// Position of the batch's first record in the source stream.
    pub offset: usize,
    /// Records submitted in the failed call. Records skipped before
    /// submission are not counted.
    pub size: usize,
    pub error: String,
    /// Records that still have no target counterpart.
    pub source_ids: Vec<String>,
    /// Records created afterwards by submitting them one at a time.
    #[serde(default)]
    pub recovered: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    pub run_id: Uuid,
    pub entity: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub read: usize,
    pub batches: usize,
    pub created: usize,
    #[serde(default)]
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Batches resubmitted record by record after the call was rejected.
    #[serde(default)]
    pub record_fallbacks: usize,
    #[serde(flatten)]
    pub references: TransformStats,
    pub batch_failures: Vec<BatchFailure>,
    pub outcomes: Vec<RecordOutcome>,
}

impl EntityReport {
    pub fn new(run_id: Uuid, entity: &str) -> Self {
        Self {
            run_id,
            entity: entity.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            read: 0,
            batches: 0,
            created: 0,
            updated: 0,
            failed: 0,
            skipped: 0,
            record_fallbacks: 0,
            references: TransformStats::default(),
            batch_failures: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome.status {
            OutcomeStatus::Created => self.created += 1,
            OutcomeStatus::Updated => self.updated += 1,
            OutcomeStatus::Failed => self.failed += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
        }
        self.outcomes.push(outcome);
    }

    /// Marks every record of a failed batch and keeps the failure itself.
    pub fn record_batch_failure(&mut self, failure: BatchFailure) {
        for source_id in &failure.source_ids {
            self.record(RecordOutcome::failed(source_id, failure.error.clone()));
        }
        self.batch_failures.push(failure);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Records that reached the target, over records submitted or skipped.
    pub fn success_rate(&self) -> f64 {
        let succeeded = self.created + self.updated;
        let total = succeeded + self.failed + self.skipped;
        if total == 0 {
            return 0.0;
        }
        succeeded as f64 * 100.0 / total as f64
    }

    /// First `limit` distinct failure messages.
    pub fn first_errors(&self, limit: usize) -> Vec<&str> {
        let mut errors: Vec<&str> = Vec::new();
        for outcome in &self.outcomes {
            if outcome.status != OutcomeStatus::Failed {
                continue;
            }
            if let Some(message) = outcome.message.as_deref() {
                if !errors.contains(&message) {
                    errors.push(message);
                    if errors.len() == limit {
                        break;
                    }
                }
            }
        }
        errors
    }

    /// Writes `<dir>/<entity>_<timestamp>.json` atomically and returns its path.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| {
            MigrateError::Io(format!(
                "Failed to create report directory '{}': {}",
                dir.display(),
                e
            ))
        })?;
        let stamp = self
            .finished_at
            .unwrap_or(self.started_at)
            .format("%Y%m%dT%H%M%S%3fZ");
        let path = dir.join(format!("{}_{}.json", self.entity, stamp));

        let temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
        }
        temp.persist(&path).map_err(|e| {
            MigrateError::Io(format!(
                "Failed to write report '{}': {}",
                path.display(),
                e.error
            ))
        })?;
        Ok(path)
    }
}
