use thiserror::Error;

/// Platform error codes that indicate a temporary condition on the remote side.
pub(crate) const TRANSIENT_CODES: &[&str] = &[
    "REQUEST_LIMIT_EXCEEDED",
    "UNABLE_TO_LOCK_ROW",
    "SERVER_UNAVAILABLE",
    "QUERY_TIMEOUT",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrateError {
    #[error("HTTP {status}{}: {message}", code_suffix(.code))]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Invalid entity plan: {0}")]
    Plan(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Coarse classification used by the retry helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl MigrateError {
    /// Builds an HTTP error from a status code and a platform error code.
    pub fn http(status: u16, code: Option<&str>, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// Returns `true` for rate limiting, timeouts and temporary unavailability.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Http { status, code, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
                    || code
                        .as_deref()
                        .is_some_and(|code| TRANSIENT_CODES.contains(&code))
            }
            _ => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, MigrateError>;

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for MigrateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::Connection(err.to_string())
        } else if err.is_decode() {
            Self::Serialization(err.to_string())
        } else if let Some(status) = err.status() {
            Self::http(status.as_u16(), None, err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_and_unavailable_are_transient() {
        assert!(MigrateError::http(429, None, "slow down").is_transient());
        assert!(MigrateError::http(503, None, "maintenance").is_transient());
        assert!(MigrateError::Timeout("read".into()).is_transient());
        assert!(MigrateError::Connection("reset".into()).is_transient());
    }

    #[test]
    fn test_platform_codes_are_transient_even_on_400() {
        let err = MigrateError::http(400, Some("UNABLE_TO_LOCK_ROW"), "row locked");
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_validation_and_permission_are_permanent() {
        let validation = MigrateError::http(400, Some("FIELD_CUSTOM_VALIDATION_EXCEPTION"), "bad");
        let permission = MigrateError::http(403, Some("INSUFFICIENT_ACCESS"), "denied");
        assert_eq!(validation.class(), ErrorClass::Permanent);
        assert_eq!(permission.class(), ErrorClass::Permanent);
        assert!(!MigrateError::Auth("invalid login".into()).is_transient());
        assert!(!MigrateError::Io("disk full".into()).is_transient());
    }

    #[test]
    fn test_http_display_includes_code() {
        let err = MigrateError::http(400, Some("MALFORMED_QUERY"), "unexpected token");
        assert_eq!(err.to_string(), "HTTP 400 (MALFORMED_QUERY): unexpected token");
        let bare = MigrateError::http(502, None, "bad gateway");
        assert_eq!(bare.to_string(), "HTTP 502: bad gateway");
    }
}
