//! Egress proxy pool with per-endpoint health tracking.
//!
//! # Health States
//!
//! ```text
//! HEALTHY --[N soft failures]--> SUSPECT
//!    ^                              |
//!    +------[M successes]-----------+
//!
//! HEALTHY | SUSPECT --[hard failure]--> BANNED (until reset)
//! ```
//!
//! Selection prefers Healthy over Suspect endpoints and, within a tier,
//! the least recently used one, so load is spread across egress IPs.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use url::Url;

use crate::error::AppError;

const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "socks5", "socks5h"];

/// Health of a single egress endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProxyHealth {
    /// Endpoint is working normally.
    Healthy,
    /// Endpoint has failed repeatedly; used only when no Healthy one is free.
    Suspect,
    /// Endpoint was blocked by the remote; never selected again until reset.
    Banned,
}

impl fmt::Display for ProxyHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyHealth::Healthy => write!(f, "healthy"),
            ProxyHealth::Suspect => write!(f, "suspect"),
            ProxyHealth::Banned => write!(f, "banned"),
        }
    }
}

/// Outcome of one attempt, as reported back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    /// Timeout or connection error.
    SoftFailure,
    /// Explicit block signal (CAPTCHA, ban page).
    HardFailure,
}

/// Username/password for an authenticated proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An egress endpoint and its health counters.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    /// `scheme://host:port`
    pub id: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
    pub health: ProxyHealth,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_used: Option<Instant>,
    pub success_count: u64,
    pub failure_count: u64,
}

impl ProxyEndpoint {
    /// Parse `host:port`, `user:pass@host:port` or a full
    /// `scheme://[user:pass@]host:port` entry. Scheme defaults to `http`.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let raw = raw.trim();
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| AppError::ConfigError(format!("Invalid proxy '{raw}': {e}")))?;

        let scheme = url.scheme().to_string();
        if !SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
            return Err(AppError::ConfigError(format!(
                "Unsupported proxy scheme '{scheme}' in '{raw}'"
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| AppError::ConfigError(format!("Proxy '{raw}' has no host")))?
            .to_string();

        let port = url
            .port_or_known_default()
            .ok_or_else(|| AppError::ConfigError(format!("Proxy '{raw}' has no port")))?;

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some(ProxyCredentials {
                username: url.username().to_string(),
                password: url.password().unwrap_or_default().to_string(),
            })
        };

        Ok(Self {
            id: format!("{scheme}://{host}:{port}"),
            scheme,
            host,
            port,
            credentials,
            health: ProxyHealth::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_used: None,
            success_count: 0,
            failure_count: 0,
        })
    }

    /// Proxy URL without credentials.
    pub fn url(&self) -> &str {
        &self.id
    }

    /// Apply an outcome and return the health before the transition.
    fn apply(&mut self, outcome: ProxyOutcome, config: &ProxyPoolConfig) -> ProxyHealth {
        let before = self.health;
        match outcome {
            ProxyOutcome::Success => {
                self.success_count += 1;
                self.consecutive_failures = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                if self.health == ProxyHealth::Suspect
                    && self.consecutive_successes >= config.promote_after
                {
                    self.health = ProxyHealth::Healthy;
                }
            }
            ProxyOutcome::SoftFailure => {
                self.failure_count += 1;
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.health == ProxyHealth::Healthy
                    && self.consecutive_failures >= config.suspect_after
                {
                    self.health = ProxyHealth::Suspect;
                }
            }
            ProxyOutcome::HardFailure => {
                self.failure_count += 1;
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.health = ProxyHealth::Banned;
            }
        }
        before
    }

    fn clear(&mut self) {
        self.health = ProxyHealth::Healthy;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }
}

/// Thresholds for health transitions.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Consecutive soft failures before Healthy becomes Suspect.
    pub suspect_after: u32,

    /// Consecutive successes before Suspect is promoted back to Healthy.
    pub promote_after: u32,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            suspect_after: 3,
            promote_after: 3,
        }
    }
}

/// Per-endpoint view for monitoring.
#[derive(Debug, Clone)]
pub struct ProxySnapshot {
    pub id: String,
    pub health: ProxyHealth,
    pub consecutive_failures: u32,
    pub success_count: u64,
    pub failure_count: u64,
}

/// Pool-wide statistics for monitoring.
#[derive(Debug, Clone)]
pub struct ProxyPoolStats {
    pub total: usize,
    pub healthy: usize,
    pub suspect: usize,
    pub banned: usize,
    pub endpoints: Vec<ProxySnapshot>,
}

impl ProxyPoolStats {
    /// Endpoints that `acquire` could still hand out.
    pub fn available(&self) -> usize {
        self.healthy + self.suspect
    }
}

/// Thread-safe pool of egress endpoints shared by every task.
///
/// All state transitions happen under one pool-wide lock; no network
/// calls originate here.
#[derive(Clone)]
pub struct ProxyPool {
    config: ProxyPoolConfig,
    inner: Arc<Mutex<Vec<ProxyEndpoint>>>,
}

impl ProxyPool {
    /// Build a pool from parsed endpoints. Duplicate ids are collapsed.
    pub fn new(endpoints: Vec<ProxyEndpoint>, config: ProxyPoolConfig) -> Self {
        let mut seen = HashSet::new();
        let endpoints: Vec<_> = endpoints
            .into_iter()
            .filter(|e| seen.insert(e.id.clone()))
            .collect();

        tracing::info!(count = endpoints.len(), "Proxy pool initialised");

        Self {
            config,
            inner: Arc::new(Mutex::new(endpoints)),
        }
    }

    /// Parse a configured list of proxy entries into a pool.
    pub fn from_list<I, S>(entries: I, config: ProxyPoolConfig) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints = entries
            .into_iter()
            .map(|s| ProxyEndpoint::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(endpoints, config))
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Vec<ProxyEndpoint>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy pool mutex");
            poisoned.into_inner()
        })
    }

    pub fn len(&self) -> usize {
        self.lock_inner().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_inner().is_empty()
    }

    /// Select the next endpoint, skipping Banned ones and anything in
    /// `exclude`.
    ///
    /// Returns `None` when no eligible endpoint remains. Callers must not
    /// treat that as retryable.
    pub fn acquire(&self, exclude: &HashSet<String>) -> Option<ProxyEndpoint> {
        let mut endpoints = self.lock_inner();

        let chosen = endpoints
            .iter_mut()
            .filter(|e| e.health != ProxyHealth::Banned && !exclude.contains(&e.id))
            .min_by_key(|e| (e.health, e.last_used))?;

        chosen.last_used = Some(Instant::now());
        tracing::debug!(proxy = %chosen.id, health = %chosen.health, "Proxy acquired");
        Some(chosen.clone())
    }

    /// Record the outcome of one attempt. Returns the new health, or `None`
    /// if the id is unknown.
    pub fn report(&self, id: &str, outcome: ProxyOutcome) -> Option<ProxyHealth> {
        let mut endpoints = self.lock_inner();
        let Some(endpoint) = endpoints.iter_mut().find(|e| e.id == id) else {
            tracing::warn!(proxy = %id, ?outcome, "Outcome reported for unknown proxy");
            return None;
        };

        let before = endpoint.apply(outcome, &self.config);
        let after = endpoint.health;

        if before != after {
            match after {
                ProxyHealth::Healthy => tracing::info!(
                    proxy = %id,
                    successes = endpoint.consecutive_successes,
                    "Proxy promoted back to healthy"
                ),
                ProxyHealth::Suspect => tracing::warn!(
                    proxy = %id,
                    failures = endpoint.consecutive_failures,
                    "Proxy marked suspect after {} consecutive failures",
                    endpoint.consecutive_failures
                ),
                ProxyHealth::Banned => tracing::warn!(
                    proxy = %id,
                    "Proxy banned after block signal from remote"
                ),
            }
        }

        Some(after)
    }

    /// Snapshot of one endpoint.
    pub fn get(&self, id: &str) -> Option<ProxyEndpoint> {
        self.lock_inner().iter().find(|e| e.id == id).cloned()
    }

    /// Explicitly restore one endpoint to Healthy. Returns false if unknown.
    pub fn reset(&self, id: &str) -> bool {
        let mut endpoints = self.lock_inner();
        match endpoints.iter_mut().find(|e| e.id == id) {
            Some(endpoint) => {
                tracing::info!(proxy = %id, from = %endpoint.health, "Proxy manually reset");
                endpoint.clear();
                true
            }
            None => false,
        }
    }

    /// Restore every endpoint to Healthy.
    pub fn reset_all(&self) {
        let mut endpoints = self.lock_inner();
        tracing::info!(count = endpoints.len(), "Proxy pool manually reset");
        endpoints.iter_mut().for_each(ProxyEndpoint::clear);
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let endpoints = self.lock_inner();
        let count = |h: ProxyHealth| endpoints.iter().filter(|e| e.health == h).count();

        ProxyPoolStats {
            total: endpoints.len(),
            healthy: count(ProxyHealth::Healthy),
            suspect: count(ProxyHealth::Suspect),
            banned: count(ProxyHealth::Banned),
            endpoints: endpoints
                .iter()
                .map(|e| ProxySnapshot {
                    id: e.id.clone(),
                    health: e.health,
                    consecutive_failures: e.consecutive_failures,
                    success_count: e.success_count,
                    failure_count: e.failure_count,
                })
                .collect(),
        }
    }
}
