use std::collections::HashSet;
use std::time::Duration;

use scout_core::{AttemptOutcome, FailureKind, SessionState};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{
    CountingAuthenticator, CountingReporter, EngineBuilder, Reply, ScriptedTransport, job_task,
};

#[tokio::test(start_paused = true)]
async fn all_transient_proxies_exhaust_before_max_attempts() {
    let transport = ScriptedTransport::always(Reply::Timeout);
    let engine = EngineBuilder {
        proxies: 3,
        max_attempts: 5,
        ..Default::default()
    }
    .build(transport.clone(), CountingAuthenticator::default());

    let failure = engine
        .submit(&job_task(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::ProxyExhausted);
    assert_eq!(failure.attempts.len(), 3);
    assert_eq!(transport.calls(), 3);

    let distinct: HashSet<_> = transport.proxies_used().into_iter().collect();
    assert_eq!(distinct.len(), 3, "each attempt must use a different proxy");
}

#[tokio::test(start_paused = true)]
async fn two_auth_rejections_then_success() {
    let transport = ScriptedTransport::new(
        vec![Reply::login_redirect(), Reply::login_redirect()],
        Reply::ok(),
    );
    let auth = CountingAuthenticator::default();
    let engine = EngineBuilder::default().build(transport, auth.clone());
    let reporter = CountingReporter::default();

    let outcome = engine
        .submit_with_reporter(&job_task(), &CancellationToken::new(), &reporter)
        .await
        .unwrap();

    assert_eq!(outcome.attempts.len(), 3);
    assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::AuthRejected);
    assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::AuthRejected);
    assert_eq!(outcome.attempts[2].outcome, AttemptOutcome::Succeeded);

    let stats = engine.controller().sessions().stats();
    assert_eq!(stats.invalid, 2);
    assert_eq!(stats.refreshes, 2);
    assert_eq!(auth.calls(), 2);
    assert_eq!(reporter.count("escalating"), 2);

    for attempt in &outcome.attempts[..2] {
        let session = engine.controller().sessions().get(&attempt.session_id).unwrap();
        assert_eq!(session.state, SessionState::Invalid);
    }
}

#[tokio::test(start_paused = true)]
async fn always_success_completes_on_first_attempt() {
    let transport = ScriptedTransport::always(Reply::ok());
    let engine = EngineBuilder::default().build(transport, CountingAuthenticator::default());
    let reporter = CountingReporter::default();

    let start = Instant::now();
    let outcome = engine
        .submit_with_reporter(&job_task(), &CancellationToken::new(), &reporter)
        .await
        .unwrap();

    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(reporter.count("backing_off"), 0);
    assert_eq!(outcome.record.data["url"], "https://example.com/jobs/view/42");

    let used = &outcome.attempts[0].proxy_id;
    let proxy = engine.controller().proxies().get(used).unwrap();
    assert_eq!(proxy.success_count, 1);
    assert_eq!(proxy.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn aborts_after_exactly_max_attempts() {
    for max_attempts in [1, 3, 4] {
        let transport = ScriptedTransport::always(Reply::status(503));
        let engine = EngineBuilder {
            proxies: 10,
            max_attempts,
            ..Default::default()
        }
        .build(transport.clone(), CountingAuthenticator::default());

        let failure = engine
            .submit(&job_task(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::TransientNetworkError);
        assert_eq!(failure.attempts.len(), max_attempts as usize);
        assert_eq!(transport.calls(), max_attempts as usize);
    }
}

#[tokio::test(start_paused = true)]
async fn block_signals_ban_proxies_and_rotate() {
    let transport = ScriptedTransport::new(vec![Reply::captcha(), Reply::status(999)], Reply::ok());
    let engine = EngineBuilder::default().build(transport, CountingAuthenticator::default());

    let outcome = engine
        .submit(&job_task(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.attempts.len(), 3);
    let stats = engine.controller().proxies().stats();
    assert_eq!(stats.banned, 2);
    assert_eq!(stats.available(), 1);

    // The banned proxies stay out of rotation for the next task.
    let next = engine
        .submit(&job_task(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(next.attempts[0].proxy_id, outcome.attempts[2].proxy_id);
}

#[tokio::test(start_paused = true)]
async fn session_unavailable_once_refresh_budget_is_spent() {
    let transport = ScriptedTransport::always(Reply::status(401));
    let auth = CountingAuthenticator::default();
    let engine = EngineBuilder {
        refresh_budget: 1,
        ..Default::default()
    }
    .build(transport, auth.clone());

    let failure = engine
        .submit(&job_task(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::SessionUnavailable);
    assert_eq!(failure.attempts.len(), 2);
    assert_eq!(auth.calls(), 1);
}

#[tokio::test]
async fn deadline_cancels_in_flight_attempt() {
    let transport = ScriptedTransport::always(Reply::ok()).with_delay(Duration::from_secs(30));
    let engine = EngineBuilder {
        proxies: 1,
        ..Default::default()
    }
    .build(transport, CountingAuthenticator::default());

    let failure = engine
        .submit_with_deadline(&job_task(), Duration::from_millis(50))
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.attempts.len(), 1);
    assert_eq!(failure.attempts[0].outcome, AttemptOutcome::Cancelled);

    let proxy = &engine.controller().proxies().stats().endpoints[0];
    assert_eq!(proxy.failure_count, 1);
    assert_eq!(proxy.success_count, 0);
    assert_eq!(engine.controller().sessions().stats().checked_out, 0);
}
