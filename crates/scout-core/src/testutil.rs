//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::events::{RetryEvent, RetryReporter};
use crate::models::{EntityKind, NormalizedRecord, RawPayload, ScrapeTask, Target};
use crate::proxy_pool::{ProxyEndpoint, ProxyPool, ProxyPoolConfig};
use crate::session_store::{Cookie, Credentials, Session};
use crate::traits::{Authenticator, Extractor, Transport};

pub fn test_session(account: &str) -> Session {
    Session::new(
        account,
        Credentials::Cookies {
            cookies: vec![Cookie::new("li_at", format!("token-{account}"))],
        },
    )
}

pub fn test_task() -> ScrapeTask {
    ScrapeTask::new(
        EntityKind::Job,
        Target::Url("https://example.com/jobs/view/1".into()),
    )
}

/// Pool of `n` healthy http proxies on 10.0.0.1..=n.
pub fn test_pool(n: usize) -> ProxyPool {
    ProxyPool::from_list(
        (1..=n).map(|i| format!("10.0.0.{i}:8080")),
        ProxyPoolConfig::default(),
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Mock transport that pops queued responses.
///
/// Also tracks which sessions are in flight so tests can assert that no
/// session is ever used by two fetches at once.
#[derive(Clone)]
pub struct MockTransport {
    /// Each call pops the first element. If empty, returns a 200 page.
    responses: Arc<Mutex<VecDeque<Result<RawPayload, AppError>>>>,
    delay: Duration,
    calls: Arc<Mutex<Vec<(String, String)>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    overlaps: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new(responses: Vec<Result<RawPayload, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            overlaps: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Transport that always succeeds.
    pub fn ok() -> Self {
        Self::new(vec![])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// `(session_id, proxy_id)` per call, in order.
    pub fn recorded(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of times a fetch started while its session was already in flight.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

/// Removes the session from the in-flight set even if the fetch is dropped.
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.session_id);
    }
}

impl Transport for MockTransport {
    async fn fetch(
        &self,
        session: &Session,
        proxy: &ProxyEndpoint,
        task: &ScrapeTask,
    ) -> Result<RawPayload, AppError> {
        if !self.in_flight.lock().unwrap().insert(session.id.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let _guard = InFlight {
            set: Arc::clone(&self.in_flight),
            session_id: session.id.clone(),
        };
        self.calls
            .lock()
            .unwrap()
            .push((session.id.clone(), proxy.id.clone()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(RawPayload::new(200, task.target.to_string(), "<html>ok</html>")))
    }
}

// ---------------------------------------------------------------------------
// MockAuthenticator
// ---------------------------------------------------------------------------

/// Mock authenticator with a queue of results.
#[derive(Clone)]
pub struct MockAuthenticator {
    responses: Arc<Mutex<VecDeque<Result<Session, AppError>>>>,
    calls: Arc<AtomicUsize>,
    /// Mint a fresh session once the queue runs dry instead of failing.
    mint_when_empty: bool,
}

impl MockAuthenticator {
    pub fn new(responses: Vec<Result<Session, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            calls: Arc::new(AtomicUsize::new(0)),
            mint_when_empty: false,
        }
    }

    /// Authenticator that always fails.
    pub fn failing() -> Self {
        Self::new(vec![])
    }

    /// Authenticator that always mints a new session.
    pub fn minting() -> Self {
        Self {
            mint_when_empty: true,
            ..Self::new(vec![])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Authenticator for MockAuthenticator {
    async fn authenticate(&self) -> Result<Session, AppError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None if self.mint_when_empty => Ok(test_session(&format!("minted{n}"))),
            None => Err(AppError::AuthError("no credentials available".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Mock extractor that wraps the body length, or fails.
#[derive(Clone)]
pub struct MockExtractor {
    error: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl MockExtractor {
    pub fn ok() -> Self {
        Self {
            error: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(msg: &str) -> Self {
        Self {
            error: Some(msg.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Extractor for MockExtractor {
    fn extract(&self, kind: EntityKind, payload: &RawPayload) -> Result<NormalizedRecord, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.error {
            Some(msg) => Err(AppError::ExtractionError(msg.clone())),
            None => Ok(NormalizedRecord {
                kind,
                data: serde_json::json!({
                    "url": payload.final_url,
                    "body_len": payload.body.len(),
                }),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records event names.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| **e == name).count()
    }
}

impl RetryReporter for MockReporter {
    fn report(&self, event: RetryEvent<'_>) {
        let name = match event {
            RetryEvent::AttemptStarted { .. } => "attempt_started",
            RetryEvent::AttemptFinished { .. } => "attempt_finished",
            RetryEvent::BackingOff { .. } => "backing_off",
            RetryEvent::Escalating { .. } => "escalating",
            RetryEvent::Succeeded { .. } => "succeeded",
            RetryEvent::Aborted { .. } => "aborted",
        };
        self.events.lock().unwrap().push(name);
    }
}
