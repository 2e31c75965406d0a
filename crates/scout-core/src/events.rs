use std::time::Duration;

use uuid::Uuid;

use crate::error::FailureKind;
use crate::models::AttemptRecord;

/// Lifecycle events emitted by the retry loop.
#[derive(Debug)]
pub enum RetryEvent<'a> {
    AttemptStarted {
        task_id: Uuid,
        attempt: u32,
        proxy_id: &'a str,
        session_id: &'a str,
    },
    AttemptFinished {
        record: &'a AttemptRecord,
    },
    BackingOff {
        task_id: Uuid,
        attempt: u32,
        delay: Duration,
    },
    /// The session was rejected; a refresh is forced before the next attempt.
    Escalating {
        task_id: Uuid,
        session_id: &'a str,
    },
    Succeeded {
        task_id: Uuid,
        attempts: u32,
    },
    Aborted {
        task_id: Uuid,
        kind: FailureKind,
        attempts: u32,
    },
}

/// Receives retry events. The default implementation ignores them.
pub trait RetryReporter: Send + Sync {
    fn report(&self, event: RetryEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that logs every event via `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRetryReporter;

impl RetryReporter for TracingRetryReporter {
    fn report(&self, event: RetryEvent<'_>) {
        match event {
            RetryEvent::AttemptStarted {
                task_id,
                attempt,
                proxy_id,
                session_id,
            } => {
                tracing::debug!(%task_id, attempt, proxy = %proxy_id, session = %session_id, "Attempt started");
            }
            RetryEvent::AttemptFinished { record } => {
                tracing::debug!(
                    task_id = %record.task_id,
                    attempt = record.attempt,
                    proxy = %record.proxy_id,
                    session = %record.session_id,
                    outcome = ?record.outcome,
                    elapsed_ms = record.elapsed.as_millis() as u64,
                    detail = record.detail.as_deref().unwrap_or(""),
                    "Attempt finished"
                );
            }
            RetryEvent::BackingOff {
                task_id,
                attempt,
                delay,
            } => {
                tracing::info!(%task_id, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
            }
            RetryEvent::Escalating {
                task_id,
                session_id,
            } => {
                tracing::warn!(%task_id, session = %session_id, "Session rejected, forcing refresh");
            }
            RetryEvent::Succeeded { task_id, attempts } => {
                tracing::info!(%task_id, attempts, "Task succeeded");
            }
            RetryEvent::Aborted {
                task_id,
                kind,
                attempts,
            } => {
                tracing::error!(%task_id, %kind, attempts, "Task aborted");
            }
        }
    }
}

/// Reporter that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRetryReporter;

impl RetryReporter for NoopRetryReporter {}
