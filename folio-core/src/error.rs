//! Error types for Folio operations

use serde_json::Value;
use thiserror::Error;

/// Caller-side validation errors. These fail fast and never reach the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid resource name {resource:?}: {reason}")]
    InvalidResource { resource: String, reason: String },

    #[error("Invalid parameter {key:?} for {resource}: {reason}")]
    InvalidParam {
        resource: String,
        key: String,
        reason: String,
    },

    #[error("Duplicate parameter {key:?} for {resource}")]
    DuplicateParam { resource: String, key: String },

    #[error("Parameters for {resource} must serialize to an object: {reason}")]
    InvalidParams { resource: String, reason: String },

    #[error("Cached data for {fingerprint} does not match the requested type: {reason}")]
    Decode { fingerprint: String, reason: String },

    #[error("Value for {fingerprint} cannot be stored: {reason}")]
    Encode { fingerprint: String, reason: String },
}

/// Master error type for all Folio errors.
///
/// Every variant is `Clone` so one failed fetch can be handed to every caller
/// that shared it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FolioError {
    /// No response was received.
    #[error("Network error: {reason}")]
    Network { reason: String },

    /// The server responded with a failure status.
    #[error("Request failed with status {status}")]
    Http { status: u16, body: Option<Value> },

    /// The external wallet rejected or failed an operation.
    #[error("Wallet error: {reason}")]
    Wallet { reason: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A 401 arrived while a session token was held.
    #[error("Session expired (status {status})")]
    SessionExpired { status: u16 },
}

/// Discriminant of [`FolioError`], for logging and matching without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Http,
    Wallet,
    Validation,
    SessionExpired,
}

impl FolioError {
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn http(status: u16, body: Option<Value>) -> Self {
        Self::Http { status, body }
    }

    pub fn wallet(reason: impl Into<String>) -> Self {
        Self::Wallet {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Http { .. } => ErrorKind::Http,
            Self::Wallet { .. } => ErrorKind::Wallet,
            Self::Validation(_) => ErrorKind::Validation,
            Self::SessionExpired { .. } => ErrorKind::SessionExpired,
        }
    }

    /// Whether a read that failed with this error may be attempted again.
    ///
    /// Only network failures and HTTP failure statuses qualify. Wallet and
    /// validation errors are deterministic; an expired session needs a new
    /// sign-in first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Http { .. })
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired { .. })
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } | Self::SessionExpired { status } => Some(*status),
            _ => None,
        }
    }

    /// Apply the uniform classification rules.
    ///
    /// A 401 received while a token was held becomes [`FolioError::SessionExpired`].
    /// Everything else is returned unchanged.
    pub fn classify(self, token_present: bool) -> Self {
        match self {
            Self::Http { status: 401, .. } if token_present => Self::SessionExpired { status: 401 },
            other => other,
        }
    }

    /// Human-readable message from a structured error body (`message` or
    /// `error` field), if the server sent one.
    pub fn server_message(&self) -> Option<&str> {
        let Self::Http {
            body: Some(body), ..
        } = self
        else {
            return None;
        };
        body.get("message")
            .or_else(|| body.get("error"))
            .and_then(Value::as_str)
    }
}

/// Result type alias for Folio operations.
pub type FolioResult<T> = Result<T, FolioError>;

// =============================================================================
// TESTS
// =============================================================================
