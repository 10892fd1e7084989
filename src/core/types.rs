use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record as returned by the remote API: field name to JSON value.
pub type Record = Map<String, Value>;

/// Metadata key the platform attaches to every returned record.
pub const ATTRIBUTES_KEY: &str = "attributes";

/// One page of a query result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    #[serde(default)]
    pub total_size: usize,
    pub done: bool,
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_records_url: Option<String>,
}

impl QueryPage {
    pub fn last(records: Vec<Record>) -> Self {
        Self {
            total_size: records.len(),
            done: true,
            records,
            next_records_url: None,
        }
    }
}

/// Per-record error returned by create/update calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveError {
    #[serde(default)]
    pub status_code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl SaveError {
    pub fn new(status_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status_code: status_code.into(),
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Lock contention and similar per-record conditions that clear on resubmit.
    pub fn is_transient(&self) -> bool {
        super::error::TRANSIENT_CODES.contains(&self.status_code.as_str())
    }
}

/// Per-record outcome of a create/update call, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResult {
    #[serde(default)]
    pub id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<SaveError>,
}

impl SaveResult {
    pub fn created(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            success: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(error: SaveError) -> Self {
        Self {
            id: None,
            success: false,
            errors: vec![error],
        }
    }

    /// Joins all error messages with `"; "`.
    pub fn error_message(&self) -> String {
        self.errors
            .iter()
            .map(|e| {
                if e.status_code.is_empty() {
                    e.message.clone()
                } else {
                    format!("{}: {}", e.status_code, e.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Reads a string field from a record, ignoring nulls and non-strings.
pub fn record_str<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}
