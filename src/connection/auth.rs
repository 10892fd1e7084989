use crate::connection::config::OrgConfig;
use crate::core::{MigrateError, Result};
use log::{debug, info};
use regex::Regex;
use reqwest::{Client, Url};
use std::sync::OnceLock;

/// An authenticated session against one org.
#[derive(Clone, PartialEq, Eq)]
pub struct OrgSession {
    session_id: String,
    instance_url: String,
    username: String,
}

impl OrgSession {
    pub fn new(session_id: &str, instance_url: &str, username: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            instance_url: instance_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Scheme and host of the org instance, without a trailing slash.
    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl std::fmt::Debug for OrgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrgSession")
            .field("instance_url", &self.instance_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Performs the username/password/token SOAP login and returns a session.
pub async fn login(client: &Client, config: &OrgConfig) -> Result<OrgSession> {
    config.validate().map_err(MigrateError::Config)?;

    let url = config.login_url();
    debug!("Logging in as '{}' via {}", config.username, url);

    let response = client
        .post(&url)
        .header("Content-Type", "text/xml; charset=UTF-8")
        .header("SOAPAction", "login")
        .body(login_envelope(config))
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;

    if let Some(fault) = capture(fault_pattern(), &body) {
        return Err(MigrateError::Auth(format!("{} ({})", fault, config.username)));
    }
    if !status.is_success() {
        return Err(MigrateError::http(status.as_u16(), None, body));
    }

    let session = parse_login_response(&body, &config.username)?;
    info!(
        "Authenticated '{}' against {}",
        config.username,
        session.instance_url()
    );
    Ok(session)
}

fn login_envelope(config: &OrgConfig) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8" ?>"#,
            r#"<env:Envelope xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
            r#"xmlns:env="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:urn="urn:partner.soap.sforce.com">"#,
            r#"<env:Header><urn:CallOptions><urn:client>orgshift</urn:client></urn:CallOptions></env:Header>"#,
            r#"<env:Body><n1:login xmlns:n1="urn:partner.soap.sforce.com">"#,
            r#"<n1:username>{}</n1:username><n1:password>{}{}</n1:password>"#,
            r#"</n1:login></env:Body></env:Envelope>"#
        ),
        xml_escape(&config.username),
        xml_escape(&config.password),
        xml_escape(&config.security_token),
    )
}

/// Extracts the session id and instance origin from a login response body.
pub(crate) fn parse_login_response(body: &str, username: &str) -> Result<OrgSession> {
    let session_id = capture(session_pattern(), body)
        .ok_or_else(|| MigrateError::Protocol("login response has no sessionId".into()))?;
    let server_url = capture(server_url_pattern(), body)
        .ok_or_else(|| MigrateError::Protocol("login response has no serverUrl".into()))?;

    let parsed = Url::parse(&server_url)
        .map_err(|e| MigrateError::Protocol(format!("invalid serverUrl '{server_url}': {e}")))?;
    let origin = parsed.origin().ascii_serialization();

    Ok(OrgSession::new(&session_id, &origin, username))
}

fn capture(pattern: &Regex, body: &str) -> Option<String> {
    pattern
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn session_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<(?:\w+:)?sessionId>([^<]+)</").expect("valid regex"))
}

fn server_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<(?:\w+:)?serverUrl>([^<]+)</").expect("valid regex"))
}

fn fault_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<faultstring>([^<]*)</faultstring>").expect("valid regex"))
}

fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
