use std::time::Duration;

use scout_core::{
    Authenticator, FailureKind, ProxyHealth, SessionStore, SessionStoreConfig, SessionVerdict,
    Throttle, ThrottleConfig,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{
    CountingAuthenticator, EngineBuilder, Reply, ScriptedTransport, job_task, session,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submits_hold_sessions_exclusively() {
    let transport = ScriptedTransport::always(Reply::ok()).with_delay(Duration::from_millis(5));
    let engine = EngineBuilder {
        proxies: 5,
        sessions: vec![session("alice"), session("bob"), session("carol")],
        ..Default::default()
    }
    .build(transport.clone(), CountingAuthenticator::default());

    let mut handles = Vec::new();
    for _ in 0..24 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.submit(&job_task(), &CancellationToken::new()).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(transport.calls(), 24);
    assert_eq!(transport.overlaps(), 0);
    assert_eq!(engine.controller().sessions().stats().checked_out, 0);
}

#[tokio::test(start_paused = true)]
async fn each_attempt_reports_its_proxy_exactly_once() {
    let transport = ScriptedTransport::new(
        vec![
            Reply::Timeout,
            Reply::login_redirect(),
            Reply::ConnectionReset,
            Reply::captcha(),
            Reply::ok(),
            Reply::status(502),
            Reply::ok(),
        ],
        Reply::ok(),
    );
    let engine = EngineBuilder {
        proxies: 8,
        max_attempts: 6,
        ..Default::default()
    }
    .build(transport, CountingAuthenticator::default());

    let mut total_attempts = 0;
    for _ in 0..3 {
        let attempts = match engine.submit(&job_task(), &CancellationToken::new()).await {
            Ok(outcome) => outcome.attempts.len(),
            Err(failure) => failure.attempts.len(),
        };
        total_attempts += attempts;
    }

    let stats = engine.controller().proxies().stats();
    let reported: u64 = stats
        .endpoints
        .iter()
        .map(|e| e.success_count + e.failure_count)
        .sum();
    assert_eq!(reported, total_attempts as u64);
}

#[tokio::test(start_paused = true)]
async fn banned_state_persists_across_tasks_until_reset() {
    let transport = ScriptedTransport::always(Reply::status(999));
    let engine = EngineBuilder {
        proxies: 2,
        ..Default::default()
    }
    .build(transport, CountingAuthenticator::default());

    let failure = engine
        .submit(&job_task(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::ProxyExhausted);

    let failure = engine
        .submit(&job_task(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::ProxyExhausted);
    assert!(failure.attempts.is_empty());

    let pool = engine.controller().proxies();
    pool.reset_all();
    assert!(pool.stats().endpoints.iter().all(|e| e.health == ProxyHealth::Healthy));
}

#[tokio::test(start_paused = true)]
async fn throttle_paces_a_single_identity() {
    let throttle = Throttle::new(ThrottleConfig::new(2.0, 2));
    let cancel = CancellationToken::new();
    let key = throttle.identity("alice-00000000", "http://192.0.2.1:3128");

    let start = Instant::now();
    let mut admitted = Vec::new();
    for _ in 0..6 {
        let _permit = throttle.admit(&key, &cancel).await.unwrap();
        admitted.push(start.elapsed());
    }

    // Two in the burst, then one every 500ms.
    assert_eq!(admitted[0], Duration::ZERO);
    assert_eq!(admitted[1], Duration::ZERO);
    for pair in admitted[1..].windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(499), "{admitted:?}");
    }
}

#[tokio::test]
async fn store_serialises_refreshes_under_contention() {
    let auth = CountingAuthenticator::default();
    let store = SessionStore::new(auth.clone(), SessionStoreConfig::default());

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let s = store.checkout(&CancellationToken::new()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            store.release(&s.id, SessionVerdict::Ok);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    // One mint fills the empty store; everyone else waits for it.
    assert_eq!(auth.calls(), 1);
    assert_eq!(store.stats().active, 1);

    // The authenticator still works directly.
    assert!(auth.authenticate().await.is_ok());
}
