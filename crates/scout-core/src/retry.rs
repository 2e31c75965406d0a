//! Per-task retry loop.
//!
//! One call to [`RetryController::execute`] drives a single task through
//! `Selecting -> InFlight -> {Succeeded, Retrying, Escalating, Aborted}`
//! until it succeeds or a terminal condition is reached. The proxy used by
//! an attempt is reported to the pool exactly once and the session is
//! always released, including on cancellation.
//!
//! # Backoff
//!
//! ```text
//! delay = min(base * 2^n, cap) + uniform(0, jitter)
//! ```
//!
//! where `n` counts transient failures so far. Blocks rotate the proxy
//! without sleeping; auth rejections force a session refresh instead.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::classify::{Classification, ResponseClassifier};
use crate::error::{FailureKind, TerminalFailure};
use crate::events::{RetryEvent, RetryReporter};
use crate::models::{AttemptOutcome, AttemptRecord, RawPayload, ScrapeTask};
use crate::proxy_pool::{ProxyEndpoint, ProxyOutcome, ProxyPool};
use crate::session_store::{Session, SessionError, SessionStore, SessionVerdict};
use crate::throttle::Throttle;
use crate::traits::{Authenticator, Transport};

/// Default maximum attempts per task, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

const DEFAULT_JITTER: Duration = Duration::from_millis(500);

/// Attempt cap and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = cap;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Capped exponential delay for the `level`-th backoff, before jitter.
    pub fn base_backoff(&self, level: u32) -> Duration {
        let factor = 2u32.saturating_pow(level);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Capped exponential delay plus uniform jitter.
    pub fn backoff_delay(&self, level: u32) -> Duration {
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            let max_ms = self.jitter.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
        };
        self.base_backoff(level) + jitter
    }
}

/// Result of one fetch after classification.
enum Fetched {
    Done(RawPayload),
    Failed(Classification),
}

/// Wraps a single logical fetch with proxy rotation, backoff and session
/// escalation.
///
/// Holds clones of the shared pool, store and throttle; cloning the
/// controller shares all of that state.
#[derive(Clone)]
pub struct RetryController<A, C> {
    proxies: ProxyPool,
    sessions: SessionStore<A>,
    throttle: Throttle,
    classifier: C,
    policy: RetryPolicy,
}

impl<A, C> RetryController<A, C>
where
    A: Authenticator,
    C: ResponseClassifier,
{
    pub fn new(
        proxies: ProxyPool,
        sessions: SessionStore<A>,
        throttle: Throttle,
        classifier: C,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            proxies,
            sessions,
            throttle,
            classifier,
            policy,
        }
    }

    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    pub fn sessions(&self) -> &SessionStore<A> {
        &self.sessions
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the attempt loop for `task`.
    ///
    /// Returns the raw payload of the successful attempt together with every
    /// attempt made, or a [`TerminalFailure`] carrying the same history.
    pub async fn execute<T, R>(
        &self,
        task: &ScrapeTask,
        transport: &T,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<(RawPayload, Vec<AttemptRecord>), TerminalFailure>
    where
        T: Transport,
        R: RetryReporter,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut backoff_level = 0u32;
        let mut force_refresh = false;
        let mut last: Option<Classification> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(abort(reporter, task, FailureKind::Cancelled, "task cancelled", attempts));
            }

            if force_refresh {
                force_refresh = false;
                match self.sessions.refresh(cancel).await {
                    Ok(session) => {
                        tracing::debug!(task_id = %task.id, session = %session.id, "Forced session refresh succeeded");
                    }
                    Err(SessionError::Cancelled) => {
                        return Err(abort(reporter, task, FailureKind::Cancelled, "task cancelled", attempts));
                    }
                    // Checkout below falls back to any remaining session or fails.
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, error = %e, "Forced session refresh failed");
                    }
                }
            }

            // Selecting
            let session = match self.sessions.checkout(cancel).await {
                Ok(session) => session,
                Err(SessionError::Cancelled) => {
                    return Err(abort(reporter, task, FailureKind::Cancelled, "task cancelled", attempts));
                }
                Err(e) => {
                    return Err(abort(
                        reporter,
                        task,
                        FailureKind::SessionUnavailable,
                        e.to_string(),
                        attempts,
                    ));
                }
            };

            let Some(proxy) = self.proxies.acquire(&failed) else {
                self.sessions.release(&session.id, SessionVerdict::Unused);
                let message = format!("no eligible proxy left after {} attempt(s)", attempts.len());
                return Err(abort(reporter, task, FailureKind::ProxyExhausted, message, attempts));
            };

            let started = Instant::now();
            let identity = self.throttle.identity(&session.id, &proxy.id);
            let permit = match self.throttle.admit(&identity, cancel).await {
                Ok(permit) => permit,
                Err(e) => {
                    let record = self.release_cancelled(task, attempt, &proxy, &session, e.to_string(), started);
                    reporter.report(RetryEvent::AttemptFinished { record: &record });
                    attempts.push(record);
                    return Err(abort(reporter, task, FailureKind::Cancelled, "task cancelled", attempts));
                }
            };

            // InFlight
            reporter.report(RetryEvent::AttemptStarted {
                task_id: task.id,
                attempt,
                proxy_id: &proxy.id,
                session_id: &session.id,
            });

            let result = tokio::select! {
                result = transport.fetch(&session, &proxy, task) => Some(result),
                () = cancel.cancelled() => None,
            };
            drop(permit);

            let Some(result) = result else {
                let record = self.release_cancelled(task, attempt, &proxy, &session, "cancelled in flight".into(), started);
                reporter.report(RetryEvent::AttemptFinished { record: &record });
                attempts.push(record);
                return Err(abort(reporter, task, FailureKind::Cancelled, "task cancelled", attempts));
            };

            let fetched = match result {
                Ok(payload) => match self.classifier.classify(&payload) {
                    Classification::Success => Fetched::Done(payload),
                    other => Fetched::Failed(other),
                },
                Err(e) => match self.classifier.classify_error(&e) {
                    Classification::Success => Fetched::Failed(Classification::Transient(e.to_string())),
                    other => Fetched::Failed(other),
                },
            };

            let (outcome, detail) = match &fetched {
                Fetched::Done(_) => (AttemptOutcome::Succeeded, None),
                Fetched::Failed(c) => (c.outcome(), c.detail().map(str::to_string)),
            };
            let record = AttemptRecord {
                task_id: task.id,
                attempt,
                proxy_id: proxy.id.clone(),
                session_id: session.id.clone(),
                outcome,
                detail,
                elapsed: started.elapsed(),
            };
            reporter.report(RetryEvent::AttemptFinished { record: &record });
            attempts.push(record);

            let classification = match fetched {
                Fetched::Done(payload) => {
                    self.proxies.report(&proxy.id, ProxyOutcome::Success);
                    self.sessions.release(&session.id, SessionVerdict::Ok);
                    reporter.report(RetryEvent::Succeeded {
                        task_id: task.id,
                        attempts: attempt,
                    });
                    return Ok((payload, attempts));
                }
                Fetched::Failed(classification) => classification,
            };

            match &classification {
                Classification::Transient(_) => {
                    self.proxies.report(&proxy.id, ProxyOutcome::SoftFailure);
                    self.sessions.release(&session.id, SessionVerdict::Ok);
                    failed.insert(proxy.id.clone());

                    if attempt < max_attempts {
                        let delay = self.policy.backoff_delay(backoff_level);
                        backoff_level += 1;
                        reporter.report(RetryEvent::BackingOff {
                            task_id: task.id,
                            attempt,
                            delay,
                        });
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = cancel.cancelled() => {
                                return Err(abort(reporter, task, FailureKind::Cancelled, "task cancelled", attempts));
                            }
                        }
                    }
                }
                Classification::AuthRejected(_) => {
                    // The egress delivered a response; the account is the problem.
                    self.proxies.report(&proxy.id, ProxyOutcome::Success);
                    self.sessions.release(&session.id, SessionVerdict::AuthRejected);
                    reporter.report(RetryEvent::Escalating {
                        task_id: task.id,
                        session_id: &session.id,
                    });
                    force_refresh = true;
                }
                Classification::Blocked(_) => {
                    self.proxies.report(&proxy.id, ProxyOutcome::HardFailure);
                    self.sessions.release(&session.id, SessionVerdict::Ok);
                    failed.insert(proxy.id.clone());
                }
                Classification::Rejected(detail) => {
                    self.proxies.report(&proxy.id, ProxyOutcome::Success);
                    self.sessions.release(&session.id, SessionVerdict::Ok);
                    let message = format!("remote rejected request: {detail}");
                    return Err(abort(reporter, task, FailureKind::RemoteRejected, message, attempts));
                }
                Classification::Success => {}
            }

            last = Some(classification);
        }

        let (kind, detail) = match &last {
            Some(c) => (
                c.failure_kind().unwrap_or(FailureKind::TransientNetworkError),
                c.detail().unwrap_or_default().to_string(),
            ),
            None => (FailureKind::TransientNetworkError, String::new()),
        };
        let message = format!("gave up after {max_attempts} attempts: {detail}");
        Err(abort(reporter, task, kind, message, attempts))
    }

    /// Cancellation with a session and proxy in hand: the outcome is
    /// indeterminate, so the proxy takes a soft failure and the session
    /// goes back uncounted.
    fn release_cancelled(
        &self,
        task: &ScrapeTask,
        attempt: u32,
        proxy: &ProxyEndpoint,
        session: &Session,
        detail: String,
        started: Instant,
    ) -> AttemptRecord {
        self.sessions.release(&session.id, SessionVerdict::Unused);
        self.proxies.report(&proxy.id, ProxyOutcome::SoftFailure);
        AttemptRecord {
            task_id: task.id,
            attempt,
            proxy_id: proxy.id.clone(),
            session_id: session.id.clone(),
            outcome: AttemptOutcome::Cancelled,
            detail: Some(detail),
            elapsed: started.elapsed(),
        }
    }
}

fn abort<R: RetryReporter>(
    reporter: &R,
    task: &ScrapeTask,
    kind: FailureKind,
    message: impl Into<String>,
    attempts: Vec<AttemptRecord>,
) -> TerminalFailure {
    reporter.report(RetryEvent::Aborted {
        task_id: task.id,
        kind,
        attempts: attempts.len() as u32,
    });
    TerminalFailure::new(kind, message, attempts)
}
