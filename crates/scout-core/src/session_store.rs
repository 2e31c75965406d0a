//! Authenticated session ownership.
//!
//! Sessions are a scarce, serialising resource: one logged-in account must
//! never issue concurrent divergent requests. The store hands each session
//! to at most one attempt at a time, invalidates it on an auth rejection,
//! and mints replacements through the [`Authenticator`] under a refresh
//! budget so a burst of failures cannot turn into a login storm.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::traits::Authenticator;

/// A single browser cookie as exported by the cookie generator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// Unix timestamp (seconds).
    #[serde(default)]
    pub expiry: Option<i64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expiry: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|exp| exp <= now.timestamp())
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

/// Opaque credential bundle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    Cookies { cookies: Vec<Cookie> },
    Token { token: String },
}

impl Credentials {
    /// `Cookie:` header value, if this bundle is a cookie jar.
    pub fn cookie_header(&self) -> Option<String> {
        match self {
            Credentials::Cookies { cookies } if !cookies.is_empty() => Some(
                cookies
                    .iter()
                    .map(|c| format!("{}={}", c.name, c.value))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            _ => None,
        }
    }

    pub fn bearer_token(&self) -> Option<&str> {
        match self {
            Credentials::Token { token } => Some(token),
            Credentials::Cookies { .. } => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Cookies { cookies } => write!(f, "Cookies({} cookies)", cookies.len()),
            Credentials::Token { .. } => write!(f, "Token(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Active,
    /// Older than the configured max age; still usable, picked last.
    Expiring,
    /// Rejected by the remote; never handed out again.
    Invalid,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::Expiring => write!(f, "expiring"),
            SessionState::Invalid => write!(f, "invalid"),
        }
    }
}

/// An authenticated context owned by one account.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub account: String,
    pub credentials: Credentials,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_validated: DateTime<Utc>,
}

impl Session {
    pub fn new(account: impl Into<String>, credentials: Credentials) -> Self {
        let account = account.into();
        let now = Utc::now();
        Self {
            id: format!("{}-{}", account, &Uuid::new_v4().simple().to_string()[..8]),
            account,
            credentials,
            state: SessionState::Active,
            created_at: now,
            last_validated: now,
        }
    }

    /// Override the creation time (e.g. the mtime of a cookie jar on disk).
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.last_validated = at;
        self
    }
}

/// Verdict handed back when an attempt returns its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVerdict {
    Ok,
    AuthRejected,
    /// Handed back without a request completing (cancelled, or no proxy
    /// to send it through). Health counters are left alone.
    Unused,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Too many refreshes inside the window.
    #[error("Session refresh budget exhausted ({budget} per {window:?})")]
    BudgetExhausted { budget: u32, window: Duration },

    /// The authentication collaborator could not mint a session.
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Cancelled while waiting for a session")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    /// Refreshes allowed per `refresh_window`.
    pub refresh_budget: u32,

    pub refresh_window: Duration,

    /// Age after which a session is considered Expiring.
    pub max_age: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            refresh_budget: 3,
            refresh_window: Duration::from_secs(600),
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Per-session view for monitoring.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub account: String,
    pub state: SessionState,
    pub checked_out: bool,
    pub successes: u64,
    pub failures: u64,
}

impl SessionSnapshot {
    /// Success ratio in percent; a session with no history scores 100.
    pub fn health(&self) -> u8 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 100;
        }
        (self.successes * 100 / total) as u8
    }
}

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub active: usize,
    pub expiring: usize,
    pub invalid: usize,
    pub checked_out: usize,
    /// Successful refreshes since startup.
    pub refreshes: u64,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug)]
struct Slot {
    session: Session,
    checked_out: bool,
    last_checkout: Option<Instant>,
    successes: u64,
    failures: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    slots: Vec<Slot>,
    refresh_log: VecDeque<Instant>,
    refreshes: u64,
}

/// Invalid sessions kept for monitoring; older ones are dropped on insert.
const RETAINED_INVALID: usize = 16;

impl StoreInner {
    /// Drop the oldest Invalid slots beyond [`RETAINED_INVALID`].
    fn prune_invalid(&mut self) {
        let invalid = self
            .slots
            .iter()
            .filter(|s| s.session.state == SessionState::Invalid && !s.checked_out)
            .count();
        let mut excess = invalid.saturating_sub(RETAINED_INVALID);
        if excess == 0 {
            return;
        }
        self.slots.retain(|s| {
            if excess > 0 && s.session.state == SessionState::Invalid && !s.checked_out {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

enum Checkout {
    Ready(Session),
    Wait,
    Refresh,
}

/// Thread-safe owner of every session, shared by all tasks.
#[derive(Clone)]
pub struct SessionStore<A> {
    authenticator: A,
    config: SessionStoreConfig,
    inner: Arc<Mutex<StoreInner>>,
    /// Woken whenever a session is released or minted.
    released: Arc<Notify>,
    /// Serialises calls into the authenticator.
    refresh_gate: Arc<tokio::sync::Mutex<()>>,
}

impl<A: Authenticator> SessionStore<A> {
    pub fn new(authenticator: A, config: SessionStoreConfig) -> Self {
        Self {
            authenticator,
            config,
            inner: Arc::new(Mutex::new(StoreInner::default())),
            released: Arc::new(Notify::new()),
            refresh_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Build a store pre-loaded with sessions minted at startup.
    pub fn with_sessions(
        authenticator: A,
        config: SessionStoreConfig,
        sessions: impl IntoIterator<Item = Session>,
    ) -> Self {
        let store = Self::new(authenticator, config);
        for session in sessions {
            store.insert(session);
        }
        store
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned session store mutex");
            poisoned.into_inner()
        })
    }

    /// Add a session to the store and wake any waiters.
    pub fn insert(&self, session: Session) {
        tracing::info!(session = %session.id, account = %session.account, "Session loaded");
        {
            let mut inner = self.lock_inner();
            inner.slots.push(Slot {
                session,
                checked_out: false,
                last_checkout: None,
                successes: 0,
                failures: 0,
            });
            inner.prune_invalid();
        }
        self.released.notify_waiters();
    }

    fn age_sessions(&self, inner: &mut StoreInner) {
        let now = Utc::now();
        for slot in inner.slots.iter_mut() {
            if slot.session.state != SessionState::Active {
                continue;
            }
            let age = now
                .signed_duration_since(slot.session.created_at)
                .to_std()
                .unwrap_or_default();
            if age > self.config.max_age {
                tracing::info!(session = %slot.session.id, "Session is expiring");
                slot.session.state = SessionState::Expiring;
            }
        }
    }

    fn try_take(&self) -> Checkout {
        let mut inner = self.lock_inner();
        self.age_sessions(&mut inner);

        let candidate = inner
            .slots
            .iter_mut()
            .filter(|s| s.session.state != SessionState::Invalid && !s.checked_out)
            .min_by_key(|s| (s.session.state, s.last_checkout));

        if let Some(slot) = candidate {
            slot.checked_out = true;
            slot.last_checkout = Some(Instant::now());
            return Checkout::Ready(slot.session.clone());
        }

        let any_busy = inner
            .slots
            .iter()
            .any(|s| s.session.state != SessionState::Invalid && s.checked_out);

        if any_busy {
            Checkout::Wait
        } else {
            Checkout::Refresh
        }
    }

    fn usable_exists(&self) -> bool {
        self.lock_inner()
            .slots
            .iter()
            .any(|s| s.session.state != SessionState::Invalid)
    }

    /// Take exclusive hold of a usable session.
    ///
    /// Waits while every usable session is held by another attempt. When no
    /// usable session exists at all, mints one through the authenticator
    /// (subject to the refresh budget) instead of failing outright.
    pub async fn checkout(&self, cancel: &CancellationToken) -> Result<Session, SessionError> {
        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }

            // Register interest before looking, so a release between the
            // check and the await is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take() {
                Checkout::Ready(session) => {
                    tracing::debug!(session = %session.id, "Session checked out");
                    return Ok(session);
                }
                Checkout::Wait => {
                    tracing::debug!("All sessions busy, waiting for a release");
                    tokio::select! {
                        () = &mut notified => {}
                        () = cancel.cancelled() => return Err(SessionError::Cancelled),
                    }
                }
                Checkout::Refresh => {
                    self.refresh_when_empty(cancel).await?;
                }
            }
        }
    }

    /// Return a session after an attempt.
    pub fn release(&self, session_id: &str, verdict: SessionVerdict) {
        {
            let mut inner = self.lock_inner();
            let Some(slot) = inner.slots.iter_mut().find(|s| s.session.id == session_id) else {
                tracing::warn!(session = %session_id, "Release for unknown session");
                return;
            };

            if !slot.checked_out {
                tracing::warn!(session = %session_id, "Session released while not checked out");
            }
            slot.checked_out = false;

            match verdict {
                SessionVerdict::Ok => {
                    slot.successes += 1;
                    slot.session.last_validated = Utc::now();
                }
                SessionVerdict::Unused => {}
                SessionVerdict::AuthRejected => {
                    slot.failures += 1;
                    slot.session.state = SessionState::Invalid;
                    tracing::warn!(
                        session = %session_id,
                        account = %slot.session.account,
                        "Session invalidated after auth rejection"
                    );
                    inner.prune_invalid();
                }
            }
        }
        self.released.notify_waiters();
    }

    /// Mint a new session through the authenticator.
    ///
    /// Counts against the refresh budget whether or not authentication
    /// succeeds.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<Session, SessionError> {
        let _gate = tokio::select! {
            guard = self.refresh_gate.lock() => guard,
            () = cancel.cancelled() => return Err(SessionError::Cancelled),
        };
        self.mint(cancel).await
    }

    /// Refresh triggered by an empty store. Skips the authenticator if
    /// another task minted a session while we waited on the gate; the
    /// caller then competes for it like any other session.
    ///
    /// A failed login is retried until one succeeds or the refresh budget
    /// runs out, so only budget exhaustion (or cancellation) is surfaced.
    async fn refresh_when_empty(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let _gate = tokio::select! {
            guard = self.refresh_gate.lock() => guard,
            () = cancel.cancelled() => return Err(SessionError::Cancelled),
        };
        loop {
            if self.usable_exists() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            match self.mint(cancel).await {
                Ok(_) => return Ok(()),
                Err(SessionError::AuthFailure(reason)) => {
                    tracing::warn!(reason = %reason, "Login failed, trying again within budget");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn mint(&self, cancel: &CancellationToken) -> Result<Session, SessionError> {
        {
            let mut inner = self.lock_inner();
            let window = self.config.refresh_window;
            while inner
                .refresh_log
                .front()
                .is_some_and(|t| t.elapsed() >= window)
            {
                inner.refresh_log.pop_front();
            }
            if inner.refresh_log.len() >= self.config.refresh_budget as usize {
                tracing::warn!(
                    budget = self.config.refresh_budget,
                    window_secs = window.as_secs(),
                    "Session refresh budget exhausted"
                );
                return Err(SessionError::BudgetExhausted {
                    budget: self.config.refresh_budget,
                    window,
                });
            }
            inner.refresh_log.push_back(Instant::now());
        }

        tracing::info!("Refreshing session through authenticator");
        let minted = tokio::select! {
            result = self.authenticator.authenticate() => result,
            () = cancel.cancelled() => return Err(SessionError::Cancelled),
        };

        match minted {
            Ok(mut session) => {
                session.state = SessionState::Active;
                self.lock_inner().refreshes += 1;
                self.insert(session.clone());
                Ok(session)
            }
            Err(e) => {
                tracing::error!(error = %e, "Session refresh failed");
                Err(SessionError::AuthFailure(e.to_string()))
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.lock_inner()
            .slots
            .iter()
            .find(|s| s.session.id == session_id)
            .map(|s| s.session.clone())
    }

    pub fn stats(&self) -> SessionStats {
        let mut inner = self.lock_inner();
        self.age_sessions(&mut inner);
        let count = |st: SessionState| {
            inner
                .slots
                .iter()
                .filter(|s| s.session.state == st)
                .count()
        };

        SessionStats {
            active: count(SessionState::Active),
            expiring: count(SessionState::Expiring),
            invalid: count(SessionState::Invalid),
            checked_out: inner.slots.iter().filter(|s| s.checked_out).count(),
            refreshes: inner.refreshes,
            sessions: inner
                .slots
                .iter()
                .map(|s| SessionSnapshot {
                    id: s.session.id.clone(),
                    account: s.session.account.clone(),
                    state: s.session.state,
                    checked_out: s.checked_out,
                    successes: s.successes,
                    failures: s.failures,
                })
                .collect(),
        }
    }
}
