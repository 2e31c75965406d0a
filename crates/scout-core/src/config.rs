use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::classify::{ClassifierConfig, ResponseClassifier, RuleClassifier};
use crate::error::AppError;
use crate::proxy_pool::{ProxyEndpoint, ProxyPool, ProxyPoolConfig};
use crate::retry::{RetryController, RetryPolicy};
use crate::session_store::{Session, SessionStore, SessionStoreConfig};
use crate::throttle::{Throttle, ThrottleConfig};
use crate::traits::Authenticator;

/// Everything needed to assemble the engine's shared components.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Raw proxy entries, validated when the config is loaded.
    pub proxies: Vec<String>,
    pub proxy_pool: ProxyPoolConfig,
    pub sessions: SessionStoreConfig,
    pub throttle: ThrottleConfig,
    pub retry: RetryPolicy,
    pub classifier: ClassifierConfig,
}

impl EngineConfig {
    /// Read configuration from environment variables.
    ///
    /// - `SCOUT_PROXY_LIST` comma separated proxy entries
    /// - `SCOUT_PROXY_FILE` one proxy per line, `#` or `//` comments
    /// - `SCOUT_SUSPECT_AFTER` / `SCOUT_PROMOTE_AFTER` (default 3 / 3)
    /// - `SCOUT_RATE_PER_SEC` / `SCOUT_BURST` / `SCOUT_JITTER_MS` (default 1.0 / 2 / 750)
    /// - `SCOUT_MAX_IN_FLIGHT` (default 8)
    /// - `SCOUT_MAX_ATTEMPTS` (default 5)
    /// - `SCOUT_BACKOFF_BASE_MS` / `SCOUT_BACKOFF_CAP_MS` / `SCOUT_BACKOFF_JITTER_MS`
    ///   (default 1000 / 30000 / 500)
    /// - `SCOUT_REFRESH_BUDGET` / `SCOUT_REFRESH_WINDOW_SECS` (default 3 / 600)
    /// - `SCOUT_SESSION_MAX_AGE_SECS` (default 86400)
    /// - `SCOUT_CLASSIFIER_FILE` JSON classifier rules (optional)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut proxies = Vec::new();
        if let Some(list) = lookup("SCOUT_PROXY_LIST") {
            proxies.extend(
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }
        if let Some(path) = lookup("SCOUT_PROXY_FILE") {
            proxies.extend(load_proxy_file(&path)?);
        }
        for entry in &proxies {
            ProxyEndpoint::parse(entry)?;
        }

        let proxy_pool = ProxyPoolConfig {
            suspect_after: positive(&lookup, "SCOUT_SUSPECT_AFTER", defaults.proxy_pool.suspect_after)?,
            promote_after: positive(&lookup, "SCOUT_PROMOTE_AFTER", defaults.proxy_pool.promote_after)?,
        };

        let rate_per_sec: f64 = parse_or(&lookup, "SCOUT_RATE_PER_SEC", defaults.throttle.rate_per_sec)?;
        if !rate_per_sec.is_finite() || rate_per_sec < 0.0 {
            return Err(AppError::ConfigError(format!(
                "Invalid SCOUT_RATE_PER_SEC '{rate_per_sec}': must be zero or positive"
            )));
        }
        let throttle = ThrottleConfig {
            rate_per_sec,
            burst: positive(&lookup, "SCOUT_BURST", defaults.throttle.burst)?,
            jitter: millis(&lookup, "SCOUT_JITTER_MS", defaults.throttle.jitter)?,
            max_in_flight: positive(&lookup, "SCOUT_MAX_IN_FLIGHT", defaults.throttle.max_in_flight)?,
            key: defaults.throttle.key,
        };

        let retry = RetryPolicy {
            max_attempts: positive(&lookup, "SCOUT_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            base_delay: millis(&lookup, "SCOUT_BACKOFF_BASE_MS", defaults.retry.base_delay)?,
            max_delay: millis(&lookup, "SCOUT_BACKOFF_CAP_MS", defaults.retry.max_delay)?,
            jitter: millis(&lookup, "SCOUT_BACKOFF_JITTER_MS", defaults.retry.jitter)?,
        };
        if retry.max_delay < retry.base_delay {
            return Err(AppError::ConfigError(
                "SCOUT_BACKOFF_CAP_MS must not be smaller than SCOUT_BACKOFF_BASE_MS".into(),
            ));
        }

        let sessions = SessionStoreConfig {
            refresh_budget: parse_or(&lookup, "SCOUT_REFRESH_BUDGET", defaults.sessions.refresh_budget)?,
            refresh_window: secs(&lookup, "SCOUT_REFRESH_WINDOW_SECS", defaults.sessions.refresh_window)?,
            max_age: secs(&lookup, "SCOUT_SESSION_MAX_AGE_SECS", defaults.sessions.max_age)?,
        };

        let classifier = match lookup("SCOUT_CLASSIFIER_FILE") {
            None => defaults.classifier,
            Some(path) => {
                let json = std::fs::read_to_string(&path).map_err(|e| {
                    AppError::ConfigError(format!("Cannot read SCOUT_CLASSIFIER_FILE '{path}': {e}"))
                })?;
                ClassifierConfig::from_json_str(&json).map_err(|e| {
                    AppError::ConfigError(format!("Invalid classifier rules in '{path}': {e}"))
                })?
            }
        };

        Ok(Self {
            proxies,
            proxy_pool,
            sessions,
            throttle,
            retry,
            classifier,
        })
    }

    pub fn build_pool(&self) -> Result<ProxyPool, AppError> {
        ProxyPool::from_list(&self.proxies, self.proxy_pool.clone())
    }

    pub fn build_classifier(&self) -> RuleClassifier {
        RuleClassifier::new(self.classifier.clone())
    }

    /// Assemble a retry controller around freshly built shared components.
    pub fn build_controller<A, C>(
        &self,
        authenticator: A,
        sessions: Vec<Session>,
        classifier: C,
    ) -> Result<RetryController<A, C>, AppError>
    where
        A: Authenticator,
        C: ResponseClassifier,
    {
        if self.proxies.is_empty() {
            tracing::warn!("No proxies configured; every task will fail with proxy_exhausted");
        }
        Ok(RetryController::new(
            self.build_pool()?,
            SessionStore::with_sessions(authenticator, self.sessions.clone(), sessions),
            Throttle::new(self.throttle.clone()),
            classifier,
            self.retry.clone(),
        ))
    }
}

/// Parse a proxy list: one entry per line, blank lines and lines starting
/// with `#` or `//` skipped.
pub fn parse_proxy_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("//"))
        .map(str::to_string)
        .collect()
}

pub fn load_proxy_file(path: impl AsRef<Path>) -> Result<Vec<String>, AppError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(format!("Cannot read proxy file '{}': {e}", path.display()))
    })?;
    let entries = parse_proxy_list(&text);
    tracing::info!(path = %path.display(), count = entries.len(), "Loaded proxy file");
    Ok(entries)
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::ConfigError(format!("Invalid {key} '{raw}'"))),
    }
}

fn positive<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr + PartialOrd + Default,
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default)?;
    if value <= T::default() {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(value)
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let ms: u64 = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let s: u64 = parse_or(lookup, key, default.as_secs())?;
    Ok(Duration::from_secs(s))
}
