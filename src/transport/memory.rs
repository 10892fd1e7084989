//! In-memory org. Tests use it as the transport double on both sides;
//! `orgshift migrate --dry-run` uses it as the target so plans run against
//! real source data without writing anywhere.
//!
//! Understands the subset of SOQL the migration core emits: a field list,
//! one object, and `AND`-joined `=`, `!=` and `IN (...)` filters, including
//! `IN (SELECT Id FROM ...)` subqueries. Failures can be scripted per
//! operation and individual records can be rejected by field value.
//!
//! Creating a `ContentVersion` publishes it the way the platform does: a
//! `ContentDocument` is created alongside, and a `FirstPublishLocationId`
//! gets a `ContentDocumentLink`.

use super::OrgTransport;
use crate::core::{
    ATTRIBUTES_KEY, MigrateError, QueryPage, Record, Result, SaveError, SaveResult, record_str,
};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, OnceLock};

const DEFAULT_KEY_PREFIX: &str = "a00";
const CONTENT_VERSION: &str = "ContentVersion";
const CONTENT_DOCUMENT: &str = "ContentDocument";
const CONTENT_DOCUMENT_LINK: &str = "ContentDocumentLink";

/// Remote operations that can be counted or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Query,
    QueryMore,
    Create,
    Update,
    FetchBlob,
}

#[derive(Debug, Clone)]
struct RejectRule {
    sobject: String,
    field: String,
    value: String,
    error: SaveError,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Vec<Record>>,
    blobs: HashMap<(String, String, String), Vec<u8>>,
    key_prefixes: HashMap<String, String>,
    next_id: u64,
    next_cursor: u64,
    cursors: HashMap<String, VecDeque<Record>>,
    failures: HashMap<Operation, VecDeque<MigrateError>>,
    calls: HashMap<Operation, usize>,
    create_batches: Vec<(String, usize)>,
    reject_rules: Vec<RejectRule>,
}

/// An org whose data lives in process memory.
#[derive(Debug)]
pub struct MemoryOrg {
    state: Mutex<State>,
    page_size: usize,
}

impl Default for MemoryOrg {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOrg {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: 2_000,
        }
    }

    /// Sets how many records each query page returns.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets the three-character id prefix used for new records of `sobject`.
    pub fn with_key_prefix(self, sobject: &str, prefix: &str) -> Self {
        self.lock()
            .key_prefixes
            .insert(sobject.to_string(), prefix.to_string());
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a record directly, bypassing failure scripting. Keeps an `Id`
    /// if the record has one; otherwise generates it. Returns the id.
    pub fn insert(&self, sobject: &str, mut record: Record) -> String {
        let mut state = self.lock();
        let id = match record_str(&record, "Id") {
            Some(id) => id.to_string(),
            None => {
                let id = state.generate_id(sobject);
                record.insert("Id".into(), Value::String(id.clone()));
                id
            }
        };
        state
            .tables
            .entry(sobject.to_string())
            .or_default()
            .push(record);
        id
    }

    /// Stores binary content for a record field.
    pub fn put_blob(&self, sobject: &str, id: &str, field: &str, bytes: Vec<u8>) {
        self.lock().blobs.insert(
            (sobject.to_string(), id.to_string(), field.to_string()),
            bytes,
        );
    }

    /// Makes the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: Operation, error: MigrateError) {
        self.fail_next_n(operation, 1, error);
    }

    /// Makes the next `times` calls of `operation` fail with `error`.
    pub fn fail_next_n(&self, operation: Operation, times: usize, error: MigrateError) {
        let mut state = self.lock();
        let queue = state.failures.entry(operation).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Rejects created/updated records of `sobject` whose `field` equals `value`.
    pub fn reject_records_where(&self, sobject: &str, field: &str, value: &str, error: SaveError) {
        self.lock().reject_rules.push(RejectRule {
            sobject: sobject.to_string(),
            field: field.to_string(),
            value: value.to_string(),
            error,
        });
    }

    pub fn records(&self, sobject: &str) -> Vec<Record> {
        self.lock().tables.get(sobject).cloned().unwrap_or_default()
    }

    pub fn count(&self, sobject: &str) -> usize {
        self.lock().tables.get(sobject).map_or(0, Vec::len)
    }

    pub fn get(&self, sobject: &str, id: &str) -> Option<Record> {
        self.lock()
            .tables
            .get(sobject)
            .and_then(|rows| rows.iter().find(|r| record_str(r, "Id") == Some(id)).cloned())
    }

    /// Number of calls made for `operation`, including failed ones.
    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Sizes of every create call for `sobject`, in call order.
    pub fn create_batch_sizes(&self, sobject: &str) -> Vec<usize> {
        self.lock()
            .create_batches
            .iter()
            .filter(|(name, _)| name == sobject)
            .map(|(_, size)| *size)
            .collect()
    }

    fn begin(&self, operation: Operation) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_insert(0) += 1;
        if let Some(err) = state
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(state)
    }

    fn page_from(&self, state: &mut State, mut rows: VecDeque<Record>, total: usize) -> QueryPage {
        if rows.len() <= self.page_size {
            return QueryPage {
                total_size: total,
                done: true,
                records: rows.into_iter().collect(),
                next_records_url: None,
            };
        }
        let records: Vec<Record> = rows.drain(..self.page_size).collect();
        state.next_cursor += 1;
        let cursor = format!("memory-{}", state.next_cursor);
        state.cursors.insert(cursor.clone(), rows);
        QueryPage {
            total_size: total,
            done: false,
            records,
            next_records_url: Some(format!("/services/data/query/{cursor}")),
        }
    }
}

impl State {
    fn generate_id(&mut self, sobject: &str) -> String {
        self.next_id += 1;
        let prefix = self
            .key_prefixes
            .get(sobject)
            .map_or(DEFAULT_KEY_PREFIX, String::as_str);
        format!("{prefix}{:0>12}", self.next_id)
    }

    /// Creates the document behind a new content version, plus its first
    /// link when a publish location is given.
    fn publish(&mut self, version: &mut Record) {
        if version.contains_key("ContentDocumentId") {
            return;
        }
        let version_id = record_str(version, "Id").unwrap_or_default().to_string();
        let document_id = self.generate_id(CONTENT_DOCUMENT);
        let mut document = Record::new();
        document.insert("Id".into(), Value::String(document_id.clone()));
        document.insert("LatestPublishedVersionId".into(), Value::String(version_id));
        if let Some(title) = version.get("Title") {
            document.insert("Title".into(), title.clone());
        }
        self.push(CONTENT_DOCUMENT, document);

        version.insert("ContentDocumentId".into(), Value::String(document_id.clone()));
        version.insert("IsLatest".into(), Value::Bool(true));

        if let Some(location) = record_str(version, "FirstPublishLocationId").map(str::to_string) {
            let link_id = self.generate_id(CONTENT_DOCUMENT_LINK);
            let link = json!({
                "Id": link_id,
                "ContentDocumentId": document_id,
                "LinkedEntityId": location,
                "ShareType": "I",
                "Visibility": "AllUsers"
            });
            if let Value::Object(link) = link {
                self.push(CONTENT_DOCUMENT_LINK, link);
            }
        }
    }

    fn push(&mut self, sobject: &str, record: Record) {
        self.tables
            .entry(sobject.to_string())
            .or_default()
            .push(record);
    }

    fn rejection(&self, sobject: &str, record: &Record) -> Option<SaveError> {
        self.reject_rules
            .iter()
            .find(|rule| {
                rule.sobject == sobject
                    && lookup(record, &rule.field).as_deref() == Some(rule.value.as_str())
            })
            .map(|rule| rule.error.clone())
    }

    fn select(&self, soql: &str) -> Result<(String, Vec<Record>)> {
        let parsed = ParsedQuery::parse(soql)?;
        let rows = self.tables.get(&parsed.sobject).cloned().unwrap_or_default();

        let mut filters = Vec::new();
        for condition in &parsed.conditions {
            filters.push(Filter::parse(condition, self)?);
        }

        let mut matched: Vec<Record> = rows
            .iter()
            .filter(|row| filters.iter().all(|f| f.matches(row)))
            .map(|row| project(row, &parsed.sobject, &parsed.fields))
            .collect();
        if let Some(limit) = parsed.limit {
            matched.truncate(limit);
        }
        Ok((parsed.sobject, matched))
    }
}

#[async_trait]
impl OrgTransport for MemoryOrg {
    async fn query(&self, soql: &str) -> Result<QueryPage> {
        let mut state = self.begin(Operation::Query)?;
        let (_, rows) = state.select(soql)?;
        let total = rows.len();
        Ok(self.page_from(&mut state, rows.into(), total))
    }

    async fn query_more(&self, locator: &str) -> Result<QueryPage> {
        let mut state = self.begin(Operation::QueryMore)?;
        let cursor = locator.rsplit('/').next().unwrap_or(locator).to_string();
        let rows = state
            .cursors
            .remove(&cursor)
            .ok_or_else(|| MigrateError::http(400, Some("INVALID_QUERY_LOCATOR"), cursor))?;
        let total = rows.len();
        Ok(self.page_from(&mut state, rows, total))
    }

    async fn create(&self, sobject: &str, records: &[Record]) -> Result<Vec<SaveResult>> {
        let mut state = self.begin(Operation::Create)?;
        state.create_batches.push((sobject.to_string(), records.len()));

        let mut results = Vec::with_capacity(records.len());
        for record in records {
            if record.contains_key("Id") {
                results.push(SaveResult::failed(SaveError::new(
                    "INVALID_FIELD_FOR_INSERT_UPDATE",
                    "cannot specify Id in an insert call",
                )));
                continue;
            }
            if let Some(error) = state.rejection(sobject, record) {
                results.push(SaveResult::failed(error));
                continue;
            }
            let id = state.generate_id(sobject);
            let mut stored = record.clone();
            stored.remove(ATTRIBUTES_KEY);
            stored.insert("Id".into(), Value::String(id.clone()));
            if sobject == CONTENT_VERSION {
                state.publish(&mut stored);
            }
            state
                .tables
                .entry(sobject.to_string())
                .or_default()
                .push(stored);
            results.push(SaveResult::created(id));
        }
        Ok(results)
    }

    async fn update(&self, sobject: &str, records: &[Record]) -> Result<Vec<SaveResult>> {
        let mut state = self.begin(Operation::Update)?;

        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let Some(id) = record_str(record, "Id").map(str::to_string) else {
                results.push(SaveResult::failed(SaveError::new(
                    "MISSING_ARGUMENT",
                    "Id not specified in an update call",
                )));
                continue;
            };
            if let Some(error) = state.rejection(sobject, record) {
                results.push(SaveResult::failed(error));
                continue;
            }
            let existing = state
                .tables
                .get_mut(sobject)
                .and_then(|rows| {
                    rows.iter_mut()
                        .find(|r| record_str(r, "Id") == Some(id.as_str()))
                });
            match existing {
                Some(row) => {
                    for (field, value) in record {
                        if field != ATTRIBUTES_KEY {
                            row.insert(field.clone(), value.clone());
                        }
                    }
                    results.push(SaveResult::created(id));
                }
                None => results.push(SaveResult::failed(SaveError::new(
                    "ENTITY_IS_DELETED",
                    format!("entity {id} does not exist"),
                ))),
            }
        }
        Ok(results)
    }

    async fn fetch_blob(&self, sobject: &str, id: &str, field: &str) -> Result<Vec<u8>> {
        let state = self.begin(Operation::FetchBlob)?;
        state
            .blobs
            .get(&(sobject.to_string(), id.to_string(), field.to_string()))
            .cloned()
            .ok_or_else(|| {
                MigrateError::http(
                    404,
                    Some("NOT_FOUND"),
                    format!("{sobject}/{id}/{field} not found"),
                )
            })
    }
}

// ============================================================================
// SOQL subset
// ============================================================================

struct ParsedQuery {
    fields: Vec<String>,
    sobject: String,
    conditions: Vec<String>,
    limit: Option<usize>,
}

impl ParsedQuery {
    fn parse(soql: &str) -> Result<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(
                r"(?is)^\s*SELECT\s+(?P<fields>.+?)\s+FROM\s+(?P<obj>\w+)(?:\s+WHERE\s+(?P<cond>.+?))?(?:\s+LIMIT\s+(?P<limit>\d+))?\s*$",
            )
            .expect("valid regex")
        });

        let caps = pattern
            .captures(soql)
            .ok_or_else(|| MigrateError::http(400, Some("MALFORMED_QUERY"), soql.to_string()))?;

        let fields = caps["fields"]
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        let conditions = caps
            .name("cond")
            .map(|c| split_top_level_and(c.as_str()))
            .unwrap_or_default();
        let limit = caps.name("limit").and_then(|l| l.as_str().parse().ok());

        Ok(Self {
            fields,
            sobject: caps["obj"].to_string(),
            conditions,
            limit,
        })
    }
}

enum Filter {
    In(String, HashSet<String>),
    Eq(String, Option<String>),
    NotEq(String, Option<String>),
}

impl Filter {
    fn parse(condition: &str, state: &State) -> Result<Self> {
        static IN_PATTERN: OnceLock<Regex> = OnceLock::new();
        static CMP_PATTERN: OnceLock<Regex> = OnceLock::new();
        let in_pattern = IN_PATTERN.get_or_init(|| {
            Regex::new(r"(?is)^(?P<field>[\w.]+)\s+IN\s*\((?P<body>.*)\)$").expect("valid regex")
        });
        let cmp_pattern = CMP_PATTERN.get_or_init(|| {
            Regex::new(r"(?is)^(?P<field>[\w.]+)\s*(?P<op>!=|=)\s*(?P<value>'(?:[^'\\]|\\.)*'|\w+)$")
                .expect("valid regex")
        });

        let condition = strip_outer_parens(condition.trim());

        if let Some(caps) = in_pattern.captures(condition) {
            let field = caps["field"].to_string();
            let body = caps["body"].trim();
            let values = if body.get(..6).is_some_and(|p| p.eq_ignore_ascii_case("SELECT")) {
                let (_, rows) = state.select(body)?;
                rows.iter()
                    .filter_map(|r| record_str(r, "Id").map(str::to_string))
                    .collect()
            } else {
                quoted_values(body)
            };
            return Ok(Self::In(field, values));
        }

        if let Some(caps) = cmp_pattern.captures(condition) {
            let field = caps["field"].to_string();
            let raw = &caps["value"];
            let value = if raw.eq_ignore_ascii_case("null") {
                None
            } else if let Some(inner) = raw.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
                Some(inner.replace("\\'", "'").replace("\\\\", "\\"))
            } else {
                Some(raw.to_ascii_lowercase())
            };
            return Ok(match &caps["op"] {
                "=" => Self::Eq(field, value),
                _ => Self::NotEq(field, value),
            });
        }

        Err(MigrateError::Query(format!(
            "unsupported filter for in-memory org: {condition}"
        )))
    }

    fn matches(&self, record: &Record) -> bool {
        match self {
            Self::In(field, values) => lookup(record, field).is_some_and(|v| values.contains(&v)),
            Self::Eq(field, value) => lookup(record, field) == *value,
            Self::NotEq(field, value) => lookup(record, field) != *value,
        }
    }
}

fn quoted_values(body: &str) -> HashSet<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"'((?:[^'\\]|\\.)*)'").expect("valid regex"));
    pattern
        .captures_iter(body)
        .map(|c| c[1].replace("\\'", "'").replace("\\\\", "\\"))
        .collect()
}

/// Splits on `AND` outside parentheses and quotes.
fn split_top_level_and(condition: &str) -> Vec<String> {
    let chars: Vec<char> = condition.chars().collect();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let ch = chars[i];
        if in_quote {
            if ch == '\\' {
                i += 1;
            } else if ch == '\'' {
                in_quote = false;
            }
        } else {
            match ch {
                '\'' => in_quote = true,
                '(' => depth += 1,
                ')' => depth -= 1,
                _ if depth == 0 && is_and_at(&chars, i) => {
                    parts.push(chars[start..i].iter().collect::<String>());
                    i += 4;
                    start = i;
                    continue;
                }
                _ => {}
            }
        }
        i += 1;
    }
    parts.push(chars[start..].iter().collect::<String>());
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn is_and_at(chars: &[char], i: usize) -> bool {
    if i == 0 || !chars[i - 1].is_whitespace() || i + 4 > chars.len() {
        return false;
    }
    let word: String = chars[i..i + 3].iter().collect();
    word.eq_ignore_ascii_case("and") && chars[i + 3].is_whitespace()
}

fn strip_outer_parens(condition: &str) -> &str {
    let mut current = condition;
    while current.starts_with('(') && current.ends_with(')') && wraps_whole(current) {
        current = current[1..current.len() - 1].trim();
    }
    current
}

fn wraps_whole(condition: &str) -> bool {
    let mut depth = 0i32;
    for (idx, ch) in condition.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 && idx != condition.len() - 1 {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// Resolves a possibly dotted field path to a comparable string.
fn lookup(record: &Record, path: &str) -> Option<String> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    match current {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn project(row: &Record, sobject: &str, fields: &[String]) -> Record {
    let mut projected = Record::new();
    projected.insert(ATTRIBUTES_KEY.into(), json!({ "type": sobject }));
    for field in fields {
        let root = field.split('.').next().unwrap_or(field);
        if let Some(value) = row.get(root) {
            projected.insert(root.to_string(), value.clone());
        }
    }
    projected
}
