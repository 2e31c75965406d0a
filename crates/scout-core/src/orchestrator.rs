use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::classify::ResponseClassifier;
use crate::error::{FailureKind, TerminalFailure};
use crate::events::{RetryReporter, TracingRetryReporter};
use crate::models::{ScrapeOutcome, ScrapeTask, compute_hash};
use crate::retry::RetryController;
use crate::traits::{Authenticator, Extractor, Transport};

/// Top-level driver: fetch through the retry loop, then extract.
///
/// Generic over all external collaborators via traits. Carries no shared
/// state of its own; concurrency across tasks is the caller's business,
/// and clones share the same pool, store and throttle.
#[derive(Clone)]
pub struct ScrapeOrchestrator<T, X, A, C>
where
    T: Transport,
    X: Extractor,
    A: Authenticator,
    C: ResponseClassifier,
{
    transport: T,
    extractor: X,
    controller: RetryController<A, C>,
}

impl<T, X, A, C> ScrapeOrchestrator<T, X, A, C>
where
    T: Transport,
    X: Extractor,
    A: Authenticator,
    C: ResponseClassifier,
{
    pub fn new(transport: T, extractor: X, controller: RetryController<A, C>) -> Self {
        Self {
            transport,
            extractor,
            controller,
        }
    }

    pub fn controller(&self) -> &RetryController<A, C> {
        &self.controller
    }

    /// Run one task to completion, logging retry events via `tracing`.
    pub async fn submit(
        &self,
        task: &ScrapeTask,
        cancel: &CancellationToken,
    ) -> Result<ScrapeOutcome, TerminalFailure> {
        self.submit_with_reporter(task, cancel, &TracingRetryReporter)
            .await
    }

    /// Run one task, giving up once `deadline` has elapsed.
    pub async fn submit_with_deadline(
        &self,
        task: &ScrapeTask,
        deadline: Duration,
    ) -> Result<ScrapeOutcome, TerminalFailure> {
        let cancel = CancellationToken::new();
        let timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                cancel.cancel();
            })
        };

        let result = self.submit(task, &cancel).await;
        timer.abort();
        result
    }

    /// 1. Fetch through the retry loop
    /// 2. Extract a normalized record
    /// 3. Hash the raw body
    pub async fn submit_with_reporter<R: RetryReporter>(
        &self,
        task: &ScrapeTask,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<ScrapeOutcome, TerminalFailure> {
        tracing::info!(task_id = %task.id, kind = %task.kind, target = %task.target, "Submitting task");

        let (payload, attempts) = self
            .controller
            .execute(task, &self.transport, cancel, reporter)
            .await?;
        tracing::info!(
            task_id = %task.id,
            bytes = payload.body.len(),
            attempts = attempts.len(),
            "Fetched payload"
        );

        let record = match self.extractor.extract(task.kind, &payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Extraction failed");
                return Err(TerminalFailure::new(
                    FailureKind::ExtractionError,
                    e.to_string(),
                    attempts,
                ));
            }
        };

        let content_hash = compute_hash(&payload.body);
        tracing::info!(task_id = %task.id, content_hash = %&content_hash[..8], "Task complete");

        Ok(ScrapeOutcome {
            task_id: task.id,
            record,
            content_hash,
            attempts,
        })
    }
}
