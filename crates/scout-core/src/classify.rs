//! Response classification policy.
//!
//! Anti-bot responses change over time, so the signals that separate a
//! block from an auth wall from a transient hiccup live in a
//! [`ClassifierConfig`] that can be loaded from JSON rather than in code.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, FailureKind};
use crate::models::{AttemptOutcome, RawPayload};

/// What the retry loop should make of one fetch result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    /// Timeout, connection reset, 5xx. Retry on another proxy after backoff.
    Transient(String),
    /// Login wall or 401/403. The session is burned.
    AuthRejected(String),
    /// CAPTCHA or ban page. The proxy is burned.
    Blocked(String),
    /// A non-success response no rule explains. Not worth retrying.
    Rejected(String),
}

impl Classification {
    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            Classification::Success => AttemptOutcome::Succeeded,
            Classification::Transient(_) => AttemptOutcome::Transient,
            Classification::AuthRejected(_) => AttemptOutcome::AuthRejected,
            Classification::Blocked(_) => AttemptOutcome::Blocked,
            Classification::Rejected(_) => AttemptOutcome::Rejected,
        }
    }

    /// Task-level failure kind if the task ends on this classification.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Classification::Success => None,
            Classification::Transient(_) => Some(FailureKind::TransientNetworkError),
            Classification::AuthRejected(_) => Some(FailureKind::AuthRejected),
            Classification::Blocked(_) => Some(FailureKind::BlockedByRemote),
            Classification::Rejected(_) => Some(FailureKind::RemoteRejected),
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Classification::Success => None,
            Classification::Transient(d)
            | Classification::AuthRejected(d)
            | Classification::Blocked(d)
            | Classification::Rejected(d) => Some(d),
        }
    }
}

/// Maps fetch results to a [`Classification`].
pub trait ResponseClassifier: Send + Sync + Clone {
    fn classify(&self, payload: &RawPayload) -> Classification;

    fn classify_error(&self, error: &AppError) -> Classification;
}

/// Signals used by [`RuleClassifier`]. Every field has a default, so a
/// partial JSON file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub auth_statuses: Vec<u16>,
    pub block_statuses: Vec<u16>,
    pub transient_statuses: Vec<u16>,
    /// Substrings of the final URL that indicate a redirect to a login wall.
    pub login_url_markers: Vec<String>,
    /// Case-insensitive body substrings that indicate an anti-bot page.
    pub block_body_markers: Vec<String>,
    /// Case-insensitive body substrings that indicate a soft auth wall.
    pub auth_body_markers: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            auth_statuses: vec![401, 403],
            block_statuses: vec![429, 999],
            transient_statuses: vec![408, 500, 502, 503, 504],
            login_url_markers: strings(&[
                "/login",
                "/authwall",
                "/checkpoint",
                "/uas/login",
                "/signup",
            ]),
            block_body_markers: strings(&[
                "captcha",
                "challenge-form",
                "unusual activity",
                "verify you are a human",
            ]),
            auth_body_markers: strings(&["sign in to view", "join now to see"]),
        }
    }
}

impl ClassifierConfig {
    pub fn from_json_str(json: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Rule-based classifier driven by a [`ClassifierConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuleClassifier {
    config: ClassifierConfig,
}

impl RuleClassifier {
    pub fn new(mut config: ClassifierConfig) -> Self {
        for marker in config
            .block_body_markers
            .iter_mut()
            .chain(config.auth_body_markers.iter_mut())
        {
            *marker = marker.to_lowercase();
        }
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn find_marker<'a>(markers: &'a [String], haystack: &str) -> Option<&'a str> {
        markers
            .iter()
            .map(String::as_str)
            .find(|m| !m.is_empty() && haystack.contains(m))
    }
}

impl ResponseClassifier for RuleClassifier {
    fn classify(&self, payload: &RawPayload) -> Classification {
        let c = &self.config;
        let status = payload.status;

        if let Some(marker) = Self::find_marker(&c.login_url_markers, &payload.final_url) {
            return Classification::AuthRejected(format!("redirected to login ({marker})"));
        }
        if c.auth_statuses.contains(&status) {
            return Classification::AuthRejected(format!("HTTP {status}"));
        }
        if c.block_statuses.contains(&status) {
            return Classification::Blocked(format!("HTTP {status}"));
        }

        let body = payload.body.to_lowercase();
        if let Some(marker) = Self::find_marker(&c.block_body_markers, &body) {
            return Classification::Blocked(format!("block marker '{marker}' in body"));
        }
        if let Some(marker) = Self::find_marker(&c.auth_body_markers, &body) {
            return Classification::AuthRejected(format!("auth marker '{marker}' in body"));
        }

        if c.transient_statuses.contains(&status) {
            return Classification::Transient(format!("HTTP {status}"));
        }
        if !payload.is_success() {
            return Classification::Rejected(format!("HTTP {status}"));
        }
        Classification::Success
    }

    fn classify_error(&self, error: &AppError) -> Classification {
        match error {
            AppError::AuthError(_) => Classification::AuthRejected(error.to_string()),
            AppError::Blocked(_) => Classification::Blocked(error.to_string()),
            AppError::InvalidRequest(_) | AppError::ConfigError(_) => {
                Classification::Rejected(error.to_string())
            }
            _ => Classification::Transient(error.to_string()),
        }
    }
}
