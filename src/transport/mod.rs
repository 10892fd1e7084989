//! Remote org capability consumed by the migration core.
//!
//! The core never talks HTTP directly; it only sees [`OrgTransport`]. The
//! production implementation lives in [`crate::connection::RestTransport`],
//! the in-memory one in [`memory::MemoryOrg`].

pub mod memory;

use crate::core::{MigrateError, QueryPage, Record, Result, SaveResult};
use crate::retry::{RetryPolicy, execute_with_retry};
use async_trait::async_trait;

/// Maximum number of records accepted by a single create/update call.
pub const MAX_RECORDS_PER_CALL: usize = 200;

/// Authenticated query/insert/update capability against one org.
#[async_trait]
pub trait OrgTransport: Send + Sync {
    /// Runs a query and returns its first page.
    async fn query(&self, soql: &str) -> Result<QueryPage>;

    /// Fetches the page behind a `nextRecordsUrl` locator.
    async fn query_more(&self, locator: &str) -> Result<QueryPage>;

    /// Creates records of `sobject`; results are in submission order.
    async fn create(&self, sobject: &str, records: &[Record]) -> Result<Vec<SaveResult>>;

    /// Updates records of `sobject` by their `Id` field.
    async fn update(&self, sobject: &str, records: &[Record]) -> Result<Vec<SaveResult>>;

    /// Downloads a binary field such as `Attachment.Body`.
    async fn fetch_blob(&self, sobject: &str, id: &str, field: &str) -> Result<Vec<u8>>;
}

/// Pull-based reader over the pages of one query.
///
/// Each page call goes through [`execute_with_retry`]. After the last page, or
/// after an error, [`QueryCursor::next_page`] returns `Ok(None)`.
pub struct QueryCursor<'a, T: OrgTransport + ?Sized> {
    transport: &'a T,
    policy: &'a RetryPolicy,
    soql: String,
    state: CursorState,
    total_size: Option<usize>,
}

enum CursorState {
    Start,
    Next(String),
    Done,
}

impl<'a, T: OrgTransport + ?Sized> QueryCursor<'a, T> {
    pub fn new(transport: &'a T, soql: &str, policy: &'a RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            soql: soql.to_string(),
            state: CursorState::Start,
            total_size: None,
        }
    }

    /// `totalSize` reported by the first page, once it has been fetched.
    pub fn total_size(&self) -> Option<usize> {
        self.total_size
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<Record>>> {
        let transport = self.transport;
        let page = match std::mem::replace(&mut self.state, CursorState::Done) {
            CursorState::Done => return Ok(None),
            CursorState::Start => {
                let soql = self.soql.as_str();
                let page = execute_with_retry(self.policy, MigrateError::is_transient, "query", || {
                    transport.query(soql)
                })
                .await?;
                self.total_size = Some(page.total_size);
                page
            }
            CursorState::Next(locator) => {
                execute_with_retry(self.policy, MigrateError::is_transient, "query_more", || {
                    transport.query_more(&locator)
                })
                .await?
            }
        };

        if !page.done {
            match page.next_records_url {
                Some(locator) => self.state = CursorState::Next(locator),
                None => {
                    return Err(MigrateError::Protocol(
                        "query page is not done but has no nextRecordsUrl".into(),
                    ));
                }
            }
        }
        Ok(Some(page.records))
    }
}

/// Follows a query through all of its pages, handing each page to `on_page`
/// as soon as it arrives.
pub async fn for_each_page<T, F>(
    transport: &T,
    soql: &str,
    policy: &RetryPolicy,
    mut on_page: F,
) -> Result<usize>
where
    T: OrgTransport + ?Sized,
    F: FnMut(Vec<Record>) -> Result<()>,
{
    let mut cursor = QueryCursor::new(transport, soql, policy);
    let mut total = 0usize;
    while let Some(records) = cursor.next_page().await? {
        total += records.len();
        on_page(records)?;
    }
    Ok(total)
}

/// Collects every record of a query.
pub async fn query_all<T>(transport: &T, soql: &str, policy: &RetryPolicy) -> Result<Vec<Record>>
where
    T: OrgTransport + ?Sized,
{
    let mut records = Vec::new();
    for_each_page(transport, soql, policy, |page| {
        records.extend(page);
        Ok(())
    })
    .await?;
    Ok(records)
}

/// Renders ids as a quoted SOQL `IN` list body: `'a','b'`.
pub fn soql_in_list<S: AsRef<str>>(ids: &[S]) -> String {
    ids.iter()
        .map(|id| format!("'{}'", escape_soql(id.as_ref())))
        .collect::<Vec<_>>()
        .join(",")
}

/// Escapes a value for use inside a single-quoted SOQL literal.
pub fn escape_soql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
