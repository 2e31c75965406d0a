use std::fmt;

use thiserror::Error;

use crate::models::AttemptRecord;

/// Errors raised by collaborators (transport, authenticator, extractor) and
/// by configuration loading.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed for a reason other than timeout or connect.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The remote endpoint refused our credentials.
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// The remote endpoint served an anti-bot response.
    #[error("Blocked by remote: {0}")]
    Blocked(String),

    /// Payload was fetched but could not be turned into a record.
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// The request could not be built from the task (bad target URL and
    /// the like). Never the egress's fault; not worth a retry.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem access failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }
}

/// Task-level failure classification returned from `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Timeout or connection error; retryable on another proxy.
    TransientNetworkError,
    /// Remote rejected the session (redirect to login, 401/403).
    AuthRejected,
    /// Remote served an anti-bot response; the proxy is burned.
    BlockedByRemote,
    /// No eligible proxy remains for this task.
    ProxyExhausted,
    /// No session could be checked out and the refresh budget is spent.
    SessionUnavailable,
    /// The payload was fetched but could not be parsed.
    ExtractionError,
    /// Non-success response that no rule explains (e.g. 404).
    RemoteRejected,
    /// The task's cancellation signal or deadline fired.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientNetworkError => "transient_network_error",
            FailureKind::AuthRejected => "auth_rejected",
            FailureKind::BlockedByRemote => "blocked_by_remote",
            FailureKind::ProxyExhausted => "proxy_exhausted",
            FailureKind::SessionUnavailable => "session_unavailable",
            FailureKind::ExtractionError => "extraction_error",
            FailureKind::RemoteRejected => "remote_rejected",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// True for failures that happened before or during the fetch, as
    /// opposed to layout drift detected after a successful fetch.
    pub fn is_fetch_failure(&self) -> bool {
        !matches!(self, FailureKind::ExtractionError)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The only error surfaced to callers of the orchestrator.
///
/// Carries every attempt made for the task so operators can see which
/// proxies and sessions were involved.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct TerminalFailure {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: Vec<AttemptRecord>,
}

impl TerminalFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts,
        }
    }
}
