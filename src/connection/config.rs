use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// API version used for both the login endpoint and the REST data endpoints.
pub const DEFAULT_API_VERSION: &str = "61.0";

/// Selects which login host an org authenticates against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OrgDomain {
    /// `login.salesforce.com`
    #[default]
    Production,
    /// `test.salesforce.com`
    Sandbox,
    /// A My Domain prefix such as `acme.my` or `acme--uat.sandbox.my`.
    Custom(String),
}

impl OrgDomain {
    pub fn host(&self) -> String {
        match self {
            Self::Production => "login.salesforce.com".to_string(),
            Self::Sandbox => "test.salesforce.com".to_string(),
            Self::Custom(prefix) => format!("{prefix}.salesforce.com"),
        }
    }
}

impl FromStr for OrgDomain {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "" | "login" | "production" => Ok(Self::Production),
            "test" | "sandbox" => Ok(Self::Sandbox),
            _ => {
                let prefix = value.trim_end_matches(".salesforce.com");
                if prefix.is_empty() || prefix.contains('/') || prefix.contains(' ') {
                    return Err(format!("Invalid org domain '{value}'"));
                }
                Ok(Self::Custom(prefix.to_string()))
            }
        }
    }
}

impl fmt::Display for OrgDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "login"),
            Self::Sandbox => write!(f, "test"),
            Self::Custom(prefix) => write!(f, "{prefix}"),
        }
    }
}

/// Credentials and transport options for one org.
///
/// `Debug` output never contains the password or the security token.
#[derive(Clone)]
pub struct OrgConfig {
    /// Username for authentication
    pub username: String,

    /// Password for authentication
    pub password: String,

    /// Security token appended to the password at login
    pub security_token: String,

    /// Login host selector
    pub domain: OrgDomain,

    /// REST/SOAP API version, e.g. `61.0`
    pub api_version: String,

    /// Per-request timeout applied by the HTTP client
    pub request_timeout: Duration,

    /// Skip TLS certificate verification. Off unless explicitly requested.
    pub accept_invalid_certs: bool,
}

impl OrgConfig {
    pub fn new(username: &str, password: &str, security_token: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            security_token: security_token.to_string(),
            domain: OrgDomain::Production,
            api_version: DEFAULT_API_VERSION.to_string(),
            request_timeout: Duration::from_secs(120),
            accept_invalid_certs: false,
        }
    }

    /// Set the login domain
    pub fn domain(mut self, domain: OrgDomain) -> Self {
        self.domain = domain;
        self
    }

    /// Set the API version
    pub fn api_version(mut self, version: &str) -> Self {
        self.api_version = version.to_string();
        self
    }

    /// Set the per-request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Opt in to unverified TLS
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// SOAP login endpoint for this org.
    pub fn login_url(&self) -> String {
        format!(
            "https://{}/services/Soap/u/{}",
            self.domain.host(),
            self.api_version
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.username.is_empty() {
            return Err("Username cannot be empty".to_string());
        }

        if self.password.is_empty() {
            return Err(format!("Password for '{}' cannot be empty", self.username));
        }

        let version_ok = self
            .api_version
            .split_once('.')
            .is_some_and(|(major, minor)| {
                major.parse::<u32>().is_ok() && minor.parse::<u32>().is_ok()
            });
        if !version_ok {
            return Err(format!("Invalid API version '{}'", self.api_version));
        }

        Ok(())
    }
}

impl fmt::Debug for OrgConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrgConfig")
            .field("username", &self.username)
            .field("password", &"***")
            .field("security_token", &"***")
            .field("domain", &self.domain)
            .field("api_version", &self.api_version)
            .field("request_timeout", &self.request_timeout)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}
