//! REST transport against a live org.

pub mod auth;
pub mod config;

use crate::core::{ATTRIBUTES_KEY, MigrateError, QueryPage, Record, Result, SaveResult};
use crate::transport::{MAX_RECORDS_PER_CALL, OrgTransport};
use async_trait::async_trait;
use auth::{OrgSession, login};
use config::OrgConfig;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

/// Authenticated REST client for one org.
///
/// Created through [`RestTransport::connect`], which logs in and keeps the
/// session for all later calls.
#[derive(Debug, Clone)]
pub struct RestTransport {
    client: Client,
    session: OrgSession,
    api_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error_code: Option<String>,
}

impl RestTransport {
    /// Builds an HTTP client from `config` and logs in.
    pub async fn connect(config: &OrgConfig) -> Result<Self> {
        if config.accept_invalid_certs {
            warn!(
                "TLS certificate verification is DISABLED for '{}' ({})",
                config.username, config.domain
            );
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| MigrateError::Config(format!("failed to build HTTP client: {e}")))?;

        let session = login(&client, config).await?;
        Ok(Self::from_session(client, session, &config.api_version))
    }

    pub fn from_session(client: Client, session: OrgSession, api_version: &str) -> Self {
        Self {
            client,
            session,
            api_version: api_version.to_string(),
        }
    }

    pub fn session(&self) -> &OrgSession {
        &self.session
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/services/data/v{}/{}",
            self.session.instance_url(),
            self.api_version,
            path.trim_start_matches('/')
        )
    }

    fn locator_url(&self, locator: &str) -> String {
        absolute_url(self.session.instance_url(), locator)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.session.session_id())
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| {
            MigrateError::Serialization(format!("unexpected response body: {e}"))
        })
    }

    async fn save(&self, sobject: &str, records: &[Record], update: bool) -> Result<Vec<SaveResult>> {
        let url = self.data_url("composite/sobjects");
        let mut results = Vec::with_capacity(records.len());
        for chunk in records.chunks(MAX_RECORDS_PER_CALL) {
            let body = json!({
                "allOrNone": false,
                "records": chunk.iter().map(|r| with_type(sobject, r)).collect::<Vec<_>>(),
            });
            let request = if update {
                self.client.patch(&url)
            } else {
                self.client.post(&url)
            };
            let saved: Vec<SaveResult> = self.send_json(request.json(&body)).await?;
            debug!(
                "{} {} {} records: {} ok",
                if update { "Updated" } else { "Created" },
                chunk.len(),
                sobject,
                saved.iter().filter(|r| r.success).count()
            );
            results.extend(saved);
        }
        Ok(results)
    }
}

#[async_trait]
impl OrgTransport for RestTransport {
    async fn query(&self, soql: &str) -> Result<QueryPage> {
        debug!("query: {}", soql);
        let request = self.client.get(self.data_url("query")).query(&[("q", soql)]);
        self.send_json(request).await
    }

    async fn query_more(&self, locator: &str) -> Result<QueryPage> {
        self.send_json(self.client.get(self.locator_url(locator))).await
    }

    async fn create(&self, sobject: &str, records: &[Record]) -> Result<Vec<SaveResult>> {
        self.save(sobject, records, false).await
    }

    async fn update(&self, sobject: &str, records: &[Record]) -> Result<Vec<SaveResult>> {
        self.save(sobject, records, true).await
    }

    async fn fetch_blob(&self, sobject: &str, id: &str, field: &str) -> Result<Vec<u8>> {
        let url = self.data_url(&format!("sobjects/{sobject}/{id}/{field}"));
        let response = self.authorized(self.client.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Maps an error response to [`MigrateError`], keeping the platform error code
/// so transient codes can be recognised.
fn api_error(status: StatusCode, body: &str) -> MigrateError {
    let first = serde_json::from_str::<Vec<ApiError>>(body)
        .ok()
        .and_then(|errors| errors.into_iter().next())
        .or_else(|| serde_json::from_str::<ApiError>(body).ok());

    let (code, message) = match first {
        Some(err) => (err.error_code, err.message),
        None => (None, body.trim().to_string()),
    };

    if status == StatusCode::UNAUTHORIZED {
        return MigrateError::Auth(match code {
            Some(code) => format!("{code}: {message}"),
            None => message,
        });
    }
    MigrateError::http(status.as_u16(), code.as_deref(), message)
}

fn absolute_url(instance_url: &str, locator: &str) -> String {
    if locator.starts_with("http://") || locator.starts_with("https://") {
        locator.to_string()
    } else {
        format!("{}/{}", instance_url, locator.trim_start_matches('/'))
    }
}

fn with_type(sobject: &str, record: &Record) -> Value {
    let mut out = record.clone();
    out.insert(ATTRIBUTES_KEY.into(), json!({ "type": sobject }));
    Value::Object(out)
}
