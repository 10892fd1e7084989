//! Process-wide migration settings, built once at startup and passed by
//! reference into every component.

use crate::connection::config::{DEFAULT_API_VERSION, OrgConfig, OrgDomain};
use crate::core::{MigrateError, Result};
use crate::retry::RetryPolicy;
use crate::transport::MAX_RECORDS_PER_CALL;
use std::path::{Path, PathBuf};

pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_DATA_DIR: &str = "files";

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub source: OrgConfig,
    pub target: OrgConfig,
    /// Records per transfer unit.
    pub batch_size: usize,
    /// Target-org user substituted for unresolvable owners.
    pub fallback_owner_id: Option<String>,
    /// Root for the mapping store, staged downloads and reports.
    pub data_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl MigrationConfig {
    pub fn new(source: OrgConfig, target: OrgConfig) -> Self {
        Self {
            source,
            target,
            batch_size: DEFAULT_BATCH_SIZE,
            fallback_owner_id: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            retry: RetryPolicy::default(),
        }
    }

    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let api_version = get("SF_API_VERSION").unwrap_or_else(|| DEFAULT_API_VERSION.to_string());

        let org = |prefix: &str| -> Result<OrgConfig> {
            let var = |name: &str| get(&format!("SF_{prefix}_{name}"));
            let domain = var("DOMAIN")
                .map(|d| d.parse::<OrgDomain>())
                .transpose()
                .map_err(MigrateError::Config)?
                .unwrap_or_default();
            let insecure = parse_flag(&format!("SF_{prefix}_INSECURE_TLS"), var("INSECURE_TLS"))?;

            Ok(OrgConfig::new(
                &var("USERNAME").unwrap_or_default(),
                &var("PASSWORD").unwrap_or_default(),
                &var("SECURITY_TOKEN").unwrap_or_default(),
            )
            .domain(domain)
            .api_version(&api_version)
            .accept_invalid_certs(insecure))
        };

        let mut config = Self::new(org("SOURCE")?, org("TARGET")?);

        if let Some(size) = get("MIGRATION_CHUNK_SIZE") {
            config.batch_size = parse_number("MIGRATION_CHUNK_SIZE", &size)?;
        }
        config.fallback_owner_id = get("MIGRATION_FALLBACK_OWNER_ID").map(|v| v.trim().to_string());
        if let Some(dir) = get("MIGRATION_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(attempts) = get("MIGRATION_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_number("MIGRATION_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(delay) = get("MIGRATION_RETRY_DELAY_MS") {
            config.retry.base_backoff_ms = parse_number("MIGRATION_RETRY_DELAY_MS", &delay)?;
        }

        Ok(config)
    }

    /// Set the batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the fallback owner
    pub fn fallback_owner(mut self, owner_id: &str) -> Self {
        self.fallback_owner_id = Some(owner_id.to_string());
        self
    }

    /// Set the local state directory
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.data_dir.join("id_mappings.json")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("attachments")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    /// Validates everything except org credentials.
    pub fn validate_local(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_RECORDS_PER_CALL {
            return Err(MigrateError::Config(format!(
                "batch size must be between 1 and {MAX_RECORDS_PER_CALL}, got {}",
                self.batch_size
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(MigrateError::Config("max attempts must be >= 1".into()));
        }
        if self
            .fallback_owner_id
            .as_deref()
            .is_some_and(|id| !is_record_id(id))
        {
            return Err(MigrateError::Config(format!(
                "fallback owner '{}' is not a 15 or 18 character record id",
                self.fallback_owner_id.as_deref().unwrap_or_default()
            )));
        }
        if self.data_dir == Path::new("") {
            return Err(MigrateError::Config("data directory cannot be empty".into()));
        }
        Ok(())
    }

    /// Validates the whole configuration, including both orgs.
    pub fn validate(&self) -> Result<()> {
        self.validate_local()?;
        self.source
            .validate()
            .map_err(|e| MigrateError::Config(format!("source org: {e}")))?;
        self.target
            .validate()
            .map_err(|e| MigrateError::Config(format!("target org: {e}")))?;
        Ok(())
    }
}

/// Platform record ids are 15 (case-sensitive) or 18 alphanumeric characters.
pub fn is_record_id(value: &str) -> bool {
    matches!(value.len(), 15 | 18) && value.chars().all(|c| c.is_ascii_alphanumeric())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MigrateError::Config(format!("{key} must be a non-negative integer, got '{value}'")))
}

fn parse_flag(key: &str, value: Option<String>) -> Result<bool> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(MigrateError::Config(format!("{key} must be a boolean, got '{v}'"))),
    }
}
