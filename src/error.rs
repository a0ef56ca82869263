//! Error types for the intake pipeline.
//!
//! Document- and operation-level failures are `IntakeError`. Failures of the
//! external extraction or ledger calls are `AdapterError`. Per-field conversion
//! problems never become errors here; see [`crate::convert::ConversionError`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IntakeError>;

/// Failure of an external call (AI extraction or ledger connector).
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Rejected before any network traffic.
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("{0} is not configured")]
    MissingCredentials(&'static str),

    #[error("could not read document: {0}")]
    Unreadable(#[from] std::io::Error),

    #[error("upstream call timed out after {0}s")]
    Timeout(u64),

    #[error("upstream failure: {message}")]
    Upstream { message: String, retryable: bool },

    /// The upstream answered, but not in a shape we can use at all.
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Timeout(_) => true,
            AdapterError::Upstream { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::UnsupportedFileType(_) => "unsupported_file_type",
            AdapterError::MissingCredentials(_) => "missing_credentials",
            AdapterError::Unreadable(_) => "unreadable_document",
            AdapterError::Timeout(_) => "upstream_timeout",
            AdapterError::Upstream { .. } => "upstream_failure",
            AdapterError::Malformed(_) => "malformed_response",
        }
    }

    /// Maps a transport error from reqwest onto the adapter taxonomy.
    pub(crate) fn from_transport(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout(timeout_secs)
        } else if err.is_connect() {
            AdapterError::Upstream {
                message: format!("connection failed: {}", err),
                retryable: true,
            }
        } else {
            AdapterError::Upstream {
                message: err.to_string(),
                retryable: false,
            }
        }
    }

    /// Classifies a non-success HTTP status.
    pub(crate) fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let retryable = status.is_server_error() || status.as_u16() == 429;
        let detail = body.trim();
        let message = if detail.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, truncate(detail, 300))
        };
        AdapterError::Upstream { message, retryable }
    }
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Operation not allowed in the document's current state.
    #[error("invalid state: {0}")]
    State(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl IntakeError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        IntakeError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IntakeError::NotFound { .. } => "not_found",
            IntakeError::State(_) => "state_conflict",
            IntakeError::Validation(_) => "validation",
            IntakeError::InsufficientCredits { .. } => "insufficient_credits",
            IntakeError::Adapter(e) => e.kind(),
            IntakeError::Storage(_) => "storage",
            IntakeError::Json(_) => "json",
            IntakeError::Io(_) => "io",
            IntakeError::Config(_) => "config",
            IntakeError::LockPoisoned(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            IntakeError::Adapter(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for IntakeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        IntakeError::LockPoisoned(err.to_string())
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_only_for_timeouts_and_flagged_upstream() {
        assert!(AdapterError::Timeout(5).is_retryable());
        assert!(AdapterError::Upstream { message: "503".into(), retryable: true }.is_retryable());
        assert!(!AdapterError::MissingCredentials("GEMINI_API_KEY").is_retryable());
        assert!(!AdapterError::UnsupportedFileType("txt".into()).is_retryable());
    }

    #[test]
    fn status_classification() {
        let e = AdapterError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(e.is_retryable());
        let e = AdapterError::from_status(reqwest::StatusCode::UNAUTHORIZED, "bad key");
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("bad key"));
    }

    #[test]
    fn intake_error_kind_delegates_to_adapter() {
        let e: IntakeError = AdapterError::Timeout(3).into();
        assert_eq!(e.kind(), "upstream_timeout");
        assert!(e.is_retryable());
        assert_eq!(IntakeError::not_found("document", 7).to_string(), "document not found: 7");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("₹₹₹", 2), "₹₹");
        assert_eq!(truncate("ab", 5), "ab");
    }
}
