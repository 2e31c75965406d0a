use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The kind of record a task is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Job,
    Company,
    Profile,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Job => "job",
            EntityKind::Company => "company",
            EntityKind::Profile => "profile",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "job" | "jobs" => Ok(EntityKind::Job),
            "company" | "companies" => Ok(EntityKind::Company),
            "profile" | "profiles" => Ok(EntityKind::Profile),
            _ => Err(format!("Unknown entity kind: {}", s)),
        }
    }
}

/// What to fetch: a concrete page, or a search query the transport expands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Target {
    Url(String),
    Query(String),
}

impl Target {
    /// Treats anything with an http(s) scheme as a URL, the rest as a query.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Target::Url(trimmed.to_string())
        } else {
            Target::Query(trimmed.to_string())
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Url(url) => write!(f, "{url}"),
            Target::Query(q) => write!(f, "query:{q}"),
        }
    }
}

/// A unit of work submitted to the orchestrator. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeTask {
    pub id: Uuid,
    pub kind: EntityKind,
    pub target: Target,
}

impl ScrapeTask {
    pub fn new(kind: EntityKind, target: Target) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target,
        }
    }

    /// Use a caller-supplied correlation id instead of a random one.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }
}

/// What the transport brought back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPayload {
    pub status: u16,
    /// URL after redirects; login walls show up here.
    pub final_url: String,
    pub body: String,
}

impl RawPayload {
    pub fn new(status: u16, final_url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            final_url: final_url.into(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Output of the extraction collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub kind: EntityKind,
    pub data: serde_json::Value,
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Transient,
    AuthRejected,
    Blocked,
    Rejected,
    Cancelled,
}

/// One pass through the retry loop. Only lives as long as the task.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub task_id: Uuid,
    /// 1-indexed.
    pub attempt: u32,
    pub proxy_id: String,
    pub session_id: String,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
    pub elapsed: Duration,
}

/// Successful result of `submit`.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeOutcome {
    pub task_id: Uuid,
    pub record: NormalizedRecord,
    /// SHA-256 of the raw body, for change detection downstream.
    pub content_hash: String,
    pub attempts: Vec<AttemptRecord>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
