//! Entity plans: which source records to read and how each field travels to
//! the target org.
//!
//! Plans are loaded from JSON files, one entity per file:
//!
//! ```json
//! {
//!   "entity": "Task",
//!   "fields": ["Subject", "Description", "OwnerId", "WhatId", "WhoId", "What.Type"],
//!   "condition": "What.Type = 'Account'",
//!   "legacy_id_field": "Legacy_Id__c",
//!   "rules": {
//!     "OwnerId": { "rule": "owner", "scope": "User" },
//!     "WhatId": { "rule": "reference", "scope": "Account" },
//!     "WhoId": { "rule": "reference", "scope": "Contact" },
//!     "Description": { "rule": "strip_html" }
//!   },
//!   "constants": { "RecordTypeId": "012000000000001" },
//!   "require_any_of": ["WhatId", "WhoId"]
//! }
//! ```

use crate::core::{MigrateError, Record, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

pub const DEFAULT_OWNER_SCOPE: &str = "User";

/// How a single source field is carried over.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FieldRule {
    #[default]
    Copy,
    Drop,
    /// Removes markup tags from rich text.
    StripHtml,
    /// Owner or creator lookup; falls back to the configured owner.
    Owner {
        #[serde(default = "default_owner_scope")]
        scope: String,
    },
    /// Relationship lookup; left out when unmapped.
    Reference { scope: String },
}

fn default_owner_scope() -> String {
    DEFAULT_OWNER_SCOPE.to_string()
}

impl FieldRule {
    pub fn owner(scope: &str) -> Self {
        Self::Owner {
            scope: scope.to_string(),
        }
    }

    pub fn reference(scope: &str) -> Self {
        Self::Reference {
            scope: scope.to_string(),
        }
    }

    fn scope(&self) -> Option<&str> {
        match self {
            Self::Owner { scope } | Self::Reference { scope } => Some(scope),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPlan {
    /// Source object name.
    pub entity: String,
    /// Target object name, when it differs from the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_entity: Option<String>,
    /// Mapping scope the created ids are recorded under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Target field that receives the source `Id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_id_field: Option<String>,
    #[serde(default)]
    pub rules: BTreeMap<String, FieldRule>,
    /// Values written on every created record.
    #[serde(default)]
    pub constants: Record,
    /// Skip a record unless at least one of these reference fields resolves.
    #[serde(default)]
    pub require_any_of: Vec<String>,
}

impl EntityPlan {
    pub fn new<S: AsRef<str>>(entity: &str, fields: &[S]) -> Self {
        Self {
            entity: entity.to_string(),
            target_entity: None,
            scope: None,
            fields: fields.iter().map(|f| f.as_ref().to_string()).collect(),
            condition: None,
            legacy_id_field: None,
            rules: BTreeMap::new(),
            constants: Record::new(),
            require_any_of: Vec::new(),
        }
    }

    pub fn condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn target_entity(mut self, name: &str) -> Self {
        self.target_entity = Some(name.to_string());
        self
    }

    pub fn scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    pub fn legacy_id_field(mut self, field: &str) -> Self {
        self.legacy_id_field = Some(field.to_string());
        self
    }

    pub fn rule(mut self, field: &str, rule: FieldRule) -> Self {
        self.rules.insert(field.to_string(), rule);
        self
    }

    pub fn constant(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.constants.insert(field.to_string(), value.into());
        self
    }

    pub fn require_any_of<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.require_any_of = fields.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    pub fn target_name(&self) -> &str {
        self.target_entity.as_deref().unwrap_or(&self.entity)
    }

    pub fn mapping_scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(&self.entity)
    }

    /// Rule for a returned field. Field names match without regard to ASCII
    /// case, since the platform echoes its own spelling of each field.
    pub fn rule_for(&self, field: &str) -> &FieldRule {
        static COPY: FieldRule = FieldRule::Copy;
        self.find_rule(field).unwrap_or(&COPY)
    }

    fn find_rule(&self, field: &str) -> Option<&FieldRule> {
        self.rules.get(field).or_else(|| {
            self.rules
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(field))
                .map(|(_, rule)| rule)
        })
    }

    fn selects(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f.eq_ignore_ascii_case(field))
    }

    /// Renders the source query. `Id` is always selected first.
    pub fn soql(&self) -> String {
        let mut fields = vec!["Id"];
        fields.extend(
            self.fields
                .iter()
                .map(String::as_str)
                .filter(|f| !f.eq_ignore_ascii_case("Id")),
        );
        let mut soql = format!("SELECT {} FROM {}", fields.join(", "), self.entity);
        if let Some(condition) = self.condition.as_deref().map(str::trim) {
            if !condition.is_empty() {
                soql.push_str(" WHERE ");
                soql.push_str(condition);
            }
        }
        soql
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| MigrateError::Plan(format!("{}: {}", self.entity, msg));

        validate_identifier(&self.entity).map_err(invalid)?;
        if let Some(target) = &self.target_entity {
            validate_identifier(target).map_err(invalid)?;
        }
        if self.fields.is_empty() {
            return Err(invalid("at least one field is required".into()));
        }
        for field in &self.fields {
            validate_field_path(field).map_err(invalid)?;
        }
        let mut ruled: Vec<&str> = Vec::with_capacity(self.rules.len());
        for (field, rule) in &self.rules {
            if !self.selects(field) {
                return Err(invalid(format!("rule for '{field}' which is not selected")));
            }
            if ruled.iter().any(|seen| seen.eq_ignore_ascii_case(field)) {
                return Err(invalid(format!("more than one rule for '{field}'")));
            }
            ruled.push(field);
            if let Some(scope) = rule.scope() {
                if scope.trim().is_empty() {
                    return Err(invalid(format!("rule for '{field}' has an empty scope")));
                }
            }
        }
        if let Some(field) = &self.legacy_id_field {
            validate_identifier(field).map_err(invalid)?;
        }
        for field in self.constants.keys() {
            validate_identifier(field).map_err(invalid)?;
            if field.eq_ignore_ascii_case("Id") {
                return Err(invalid("'Id' cannot be a constant".into()));
            }
        }
        for field in &self.require_any_of {
            if !matches!(
                self.find_rule(field),
                Some(FieldRule::Owner { .. } | FieldRule::Reference { .. })
            ) {
                return Err(invalid(format!(
                    "require_any_of field '{field}' needs an owner or reference rule"
                )));
            }
        }
        Ok(())
    }

    /// Parses and validates a plan.
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(json)
            .map_err(|e| MigrateError::Plan(format!("invalid plan JSON: {e}")))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Io(format!("Failed to read plan '{}': {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }
}

/// Accepts a plain API name such as `Account` or `Legacy_Id__c`.
pub fn validate_identifier(name: &str) -> std::result::Result<(), String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid regex"));
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(format!("'{name}' is not a valid API name"))
    }
}

/// Accepts an API name or a dotted relationship path such as `What.Type`.
pub fn validate_field_path(path: &str) -> std::result::Result<(), String> {
    path.split('.')
        .try_for_each(validate_identifier)
        .map_err(|_| format!("'{path}' is not a valid field path"))
}
