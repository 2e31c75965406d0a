//! Per-identity request pacing with jitter and a global in-flight cap.
//!
//! Each egress identity (session + proxy pair, or proxy alone) keeps a
//! theoretical arrival time, advanced by one emission interval (`1/rate`)
//! per admission, with up to `burst - 1` intervals of slack. Random jitter
//! is added to the admission instant itself before the schedule advances,
//! so any `burst + 1` admissions for one identity still span at least one
//! interval. A separate semaphore bounds the number of requests in flight
//! across all identities.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use scout_core::throttle::{Throttle, ThrottleConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // One request per second per identity, bursts of two, up to 750ms jitter
//! let throttle = Throttle::new(
//!     ThrottleConfig::new(1.0, 2).with_jitter(Duration::from_millis(750)),
//! );
//! let key = throttle.identity("alice-1a2b3c4d", "http://10.0.0.1:8080");
//! let _permit = throttle.admit(&key, &CancellationToken::new()).await?;
//! // ... fetch while holding the permit
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How throttle identities are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrottleKey {
    /// One schedule per session + proxy pair.
    #[default]
    SessionAndProxy,
    /// One schedule per proxy, for deployments where sessions are shared.
    ProxyOnly,
}

/// Configuration for the throttle.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Token refill rate per identity. Zero or less disables pacing.
    pub rate_per_sec: f64,

    /// Number of back-to-back requests allowed before pacing kicks in.
    pub burst: u32,

    /// Maximum random jitter added on top of the computed wait
    /// (uniform [0, jitter]). Set to `Duration::ZERO` to disable.
    pub jitter: Duration,

    /// Global cap on concurrent in-flight requests.
    pub max_in_flight: usize,

    pub key: ThrottleKey,
}

impl ThrottleConfig {
    /// Create a config with the given rate and burst, no jitter.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst,
            jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_key(mut self, key: ThrottleKey) -> Self {
        self.key = key;
        self
    }

    fn jitter_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = self.jitter.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 1.0,
            burst: 2,
            jitter: Duration::from_millis(750),
            max_in_flight: 8,
            key: ThrottleKey::SessionAndProxy,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("Cancelled while waiting for a pacing slot")]
    Cancelled,
}

/// Held for the duration of one request; frees the global slot on drop.
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct Schedule {
    /// Theoretical arrival time of the next request.
    tat: Instant,
    /// Bumped on every reservation; lets a cancelled waiter tell whether
    /// it still holds the latest slot.
    seq: u64,
}

/// A slot handed out by [`Throttle::reserve`].
struct Reservation {
    at: Instant,
    seq: u64,
    prev_tat: Option<Instant>,
}

/// Shared pacing state for every identity.
#[derive(Clone)]
pub struct Throttle {
    config: ThrottleConfig,
    schedules: Arc<Mutex<HashMap<String, Schedule>>>,
    in_flight: Arc<Semaphore>,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        let slots = config.max_in_flight.max(1);
        Self {
            config,
            schedules: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Semaphore::new(slots)),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Pacing key for a session/proxy pair under the configured policy.
    pub fn identity(&self, session_id: &str, proxy_id: &str) -> String {
        match self.config.key {
            ThrottleKey::SessionAndProxy => format!("{session_id}|{proxy_id}"),
            ThrottleKey::ProxyOnly => proxy_id.to_string(),
        }
    }

    /// Number of requests currently holding a global slot.
    pub fn in_flight(&self) -> usize {
        self.config.max_in_flight.max(1) - self.in_flight.available_permits()
    }

    /// Wait for a pacing slot for `identity`, then for a global slot.
    ///
    /// Never fails for lack of a slot; the caller is suspended instead. A
    /// waiter cancelled before its slot comes up gives the slot back.
    pub async fn admit(
        &self,
        identity: &str,
        cancel: &CancellationToken,
    ) -> Result<ThrottlePermit, ThrottleError> {
        let slot = self.reserve(identity);

        let wait = slot.at.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            tracing::debug!(
                identity = %identity,
                sleep_ms = %wait.as_millis(),
                "Throttling request"
            );
            tokio::select! {
                () = tokio::time::sleep_until(slot.at) => {}
                () = cancel.cancelled() => {
                    self.refund(identity, &slot);
                    return Err(ThrottleError::Cancelled);
                }
            }
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.in_flight).acquire_owned() => {
                // The semaphore is never closed; treat it as shutdown.
                permit.map_err(|_| ThrottleError::Cancelled)?
            }
            () = cancel.cancelled() => return Err(ThrottleError::Cancelled),
        };

        Ok(ThrottlePermit { _permit: permit })
    }

    fn lock_schedules(&self) -> std::sync::MutexGuard<'_, HashMap<String, Schedule>> {
        self.schedules.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned throttle mutex");
            poisoned.into_inner()
        })
    }

    /// Claim the identity's next admission instant and advance its
    /// schedule past it.
    ///
    /// The instant is `max(now, tat - slack) + jitter`; the schedule then
    /// moves to `max(tat, instant) + interval`. Concurrent callers queue
    /// behind each other because each one pushes `tat` forward.
    fn reserve(&self, identity: &str) -> Reservation {
        let now = Instant::now();
        let jitter = self.config.jitter_delay();
        let rate = self.config.rate_per_sec;
        if rate <= 0.0 || !rate.is_finite() {
            return Reservation {
                at: now + jitter,
                seq: 0,
                prev_tat: None,
            };
        }

        let interval = Duration::from_secs_f64(1.0 / rate);
        let slack = interval.saturating_mul(self.config.burst.max(1) - 1);

        let mut schedules = self.lock_schedules();
        let schedule = schedules.entry(identity.to_string()).or_insert(Schedule {
            tat: now,
            seq: 0,
        });

        let earliest = schedule
            .tat
            .checked_sub(slack)
            .map_or(now, |t| t.max(now));
        let at = earliest + jitter;

        let prev_tat = schedule.tat;
        schedule.tat = schedule.tat.max(at) + interval;
        schedule.seq += 1;

        Reservation {
            at,
            seq: schedule.seq,
            prev_tat: Some(prev_tat),
        }
    }

    /// Give back a slot that was never used. Only the most recent
    /// reservation can be rolled back; an earlier one stays charged so that
    /// later waiters keep their spacing.
    fn refund(&self, identity: &str, slot: &Reservation) {
        let Some(prev_tat) = slot.prev_tat else {
            return;
        };
        let mut schedules = self.lock_schedules();
        if let Some(schedule) = schedules.get_mut(identity)
            && schedule.seq == slot.seq
        {
            schedule.tat = prev_tat;
            schedule.seq += 1;
            tracing::debug!(identity = %identity, "Refunded cancelled pacing slot");
        }
    }
}
