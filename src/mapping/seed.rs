//! Seeds the mapping store from records that already exist in the target org
//! and carry their source id in a legacy-id field.

use super::MappingStore;
use crate::core::{MigrateError, Result, record_str};
use crate::plan::validate_identifier;
use crate::retry::RetryPolicy;
use crate::transport::{OrgTransport, query_all, soql_in_list};
use log::{debug, info};
use std::collections::HashMap;

/// Upper bound on ids per `IN (...)` list.
pub const LOOKUP_CHUNK_SIZE: usize = 200;

#[derive(Debug, Clone)]
pub struct SeedRequest {
    /// Object queried in both orgs.
    pub entity: String,
    /// Target field that holds the source id.
    pub legacy_field: String,
    /// Mapping scope to write into; defaults to the entity name.
    pub scope: Option<String>,
    /// Extra `WHERE` clause applied to the source query.
    pub condition: Option<String>,
}

impl SeedRequest {
    pub fn new(entity: &str, legacy_field: &str) -> Self {
        Self {
            entity: entity.to_string(),
            legacy_field: legacy_field.to_string(),
            scope: None,
            condition: None,
        }
    }

    pub fn scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    pub fn condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn effective_scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(&self.entity)
    }

    fn source_soql(&self) -> String {
        match self.condition.as_deref().map(str::trim) {
            Some(condition) if !condition.is_empty() => {
                format!("SELECT Id FROM {} WHERE {}", self.entity, condition)
            }
            _ => format!("SELECT Id FROM {}", self.entity),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub source_ids: usize,
    pub mapped: usize,
}

/// Looks up target records whose `legacy_field` holds one of `source_ids`.
/// Returns source id to target id.
pub async fn lookup_legacy_ids<T>(
    target: &T,
    entity: &str,
    legacy_field: &str,
    source_ids: &[String],
    policy: &RetryPolicy,
) -> Result<HashMap<String, String>>
where
    T: OrgTransport + ?Sized,
{
    validate_identifier(entity).map_err(MigrateError::Config)?;
    validate_identifier(legacy_field).map_err(MigrateError::Config)?;

    let mut found = HashMap::new();
    for chunk in source_ids.chunks(LOOKUP_CHUNK_SIZE) {
        let soql = format!(
            "SELECT Id, {legacy_field} FROM {entity} WHERE {legacy_field} IN ({})",
            soql_in_list(chunk)
        );
        for record in query_all(target, &soql, policy).await? {
            if let (Some(target_id), Some(source_id)) =
                (record_str(&record, "Id"), record_str(&record, legacy_field))
            {
                found.insert(source_id.to_string(), target_id.to_string());
            }
        }
        debug!(
            "Looked up {} legacy ids on {}.{}, {} matched so far",
            chunk.len(),
            entity,
            legacy_field,
            found.len()
        );
    }
    Ok(found)
}

/// Queries source ids, matches them against the target legacy field, inserts
/// every pair found and flushes the store.
pub async fn seed_from_legacy_ids<S, T>(
    source: &S,
    target: &T,
    store: &mut MappingStore,
    request: &SeedRequest,
    policy: &RetryPolicy,
) -> Result<SeedSummary>
where
    S: OrgTransport + ?Sized,
    T: OrgTransport + ?Sized,
{
    validate_identifier(&request.entity).map_err(MigrateError::Config)?;

    let source_ids: Vec<String> = query_all(source, &request.source_soql(), policy)
        .await?
        .iter()
        .filter_map(|r| record_str(r, "Id").map(str::to_string))
        .collect();

    let pairs = lookup_legacy_ids(
        target,
        &request.entity,
        &request.legacy_field,
        &source_ids,
        policy,
    )
    .await?;

    let scope = request.effective_scope();
    let mut mapped = 0usize;
    for source_id in &source_ids {
        if let Some(target_id) = pairs.get(source_id) {
            store.insert(scope, source_id, target_id);
            mapped += 1;
        }
    }
    store.flush()?;

    info!(
        "Seeded {} of {} {} ids from {}",
        mapped,
        source_ids.len(),
        scope,
        request.legacy_field
    );
    Ok(SeedSummary {
        source_ids: source_ids.len(),
        mapped,
    })
}
