use std::time::Duration;

use scout_client::{CookieFileAuthenticator, JsonLdExtractor, ReqwestTransport};
use scout_core::{
    EngineConfig, EntityKind, FailureKind, ProxyHealth, ProxyPool, ScrapeOrchestrator, ScrapeTask,
    Target,
};
use tokio_util::sync::CancellationToken;

use crate::integration::common::{FakeProxy, init_tracing, job_page};

fn engine_config(proxies: &[&FakeProxy]) -> anyhow::Result<EngineConfig> {
    let list = proxies.iter().map(|p| p.url.as_str()).collect::<Vec<_>>().join(",");
    let config = EngineConfig::from_lookup(|key| match key {
        "SCOUT_PROXY_LIST" => Some(list.clone()),
        "SCOUT_RATE_PER_SEC" => Some("0".into()),
        "SCOUT_JITTER_MS" => Some("0".into()),
        "SCOUT_BACKOFF_BASE_MS" => Some("10".into()),
        "SCOUT_BACKOFF_CAP_MS" => Some("50".into()),
        "SCOUT_BACKOFF_JITTER_MS" => Some("0".into()),
        _ => None,
    })?;
    Ok(config)
}

fn cookie_dir(accounts: &[&str]) -> anyhow::Result<tempfile::TempDir> {
    let dir = tempfile::tempdir()?;
    for account in accounts {
        std::fs::write(
            dir.path().join(format!("{account}.json")),
            format!(r#"[{{"name": "li_at", "value": "{account}-token"}}]"#),
        )?;
    }
    Ok(dir)
}

#[tokio::test]
async fn blocked_proxy_is_banned_and_task_completes_on_the_next() -> anyhow::Result<()> {
    init_tracing();
    let blocked = FakeProxy::start("999 Request denied", String::new()).await?;
    let healthy = FakeProxy::start("200 OK", job_page("Rust Engineer")).await?;

    let cookies = cookie_dir(&["alice"])?;
    let auth = CookieFileAuthenticator::new(cookies.path());
    let config = engine_config(&[&blocked, &healthy])?;
    let controller = config.build_controller(auth.clone(), auth.load_all()?, config.build_classifier())?;
    let orchestrator = ScrapeOrchestrator::new(
        ReqwestTransport::new("http://jobs.example.test")?,
        JsonLdExtractor,
        controller,
    );

    let task = ScrapeTask::new(
        EntityKind::Job,
        Target::Url("http://jobs.example.test/jobs/view/1".into()),
    );
    let outcome = orchestrator.submit(&task, &CancellationToken::new()).await?;

    assert_eq!(outcome.record.data["title"], "Rust Engineer");
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(blocked.hits(), 1);
    assert_eq!(healthy.hits(), 1);

    let pool = orchestrator.controller().proxies();
    assert_eq!(health_of(pool, &blocked.url), ProxyHealth::Banned);
    assert_eq!(health_of(pool, &healthy.url), ProxyHealth::Healthy);

    let head = &healthy.requests.lock().unwrap()[0];
    assert!(head.contains("cookie: li_at=alice-token"), "{head}");
    Ok(())
}

#[tokio::test]
async fn missing_json_ld_is_an_extraction_error() -> anyhow::Result<()> {
    init_tracing();
    let proxy = FakeProxy::start("200 OK", "<html><body>redesigned</body></html>".into()).await?;

    let cookies = cookie_dir(&["alice"])?;
    let auth = CookieFileAuthenticator::new(cookies.path());
    let config = engine_config(&[&proxy])?;
    let controller = config.build_controller(auth.clone(), auth.load_all()?, config.build_classifier())?;
    let orchestrator = ScrapeOrchestrator::new(
        ReqwestTransport::new("http://jobs.example.test")?,
        JsonLdExtractor,
        controller,
    );

    let task = ScrapeTask::new(EntityKind::Job, Target::Query("rust engineer".into()));
    let failure = orchestrator
        .submit_with_deadline(&task, Duration::from_secs(10))
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::ExtractionError);
    let head = &proxy.requests.lock().unwrap()[0];
    assert!(
        head.starts_with("get http://jobs.example.test/jobs/search/?keywords=rust+engineer"),
        "{head}"
    );
    Ok(())
}

#[tokio::test]
async fn auth_wall_uses_each_cookie_jar_once() -> anyhow::Result<()> {
    init_tracing();
    let proxy = FakeProxy::start("401 Unauthorized", String::new()).await?;

    let cookies = cookie_dir(&["alice", "bob"])?;
    let auth = CookieFileAuthenticator::new(cookies.path());
    let config = engine_config(&[&proxy])?;
    // Start empty so every session comes from the authenticator.
    let controller = config.build_controller(auth, Vec::new(), config.build_classifier())?;
    let orchestrator = ScrapeOrchestrator::new(
        ReqwestTransport::new("http://jobs.example.test")?,
        JsonLdExtractor,
        controller,
    );

    let task = ScrapeTask::new(
        EntityKind::Job,
        Target::Url("http://jobs.example.test/jobs/view/1".into()),
    );
    let failure = orchestrator
        .submit(&task, &CancellationToken::new())
        .await
        .unwrap_err();

    // Rejected jars are not replayed until the generator rewrites them.
    assert_eq!(failure.kind, FailureKind::SessionUnavailable);
    let accounts: Vec<_> = failure
        .attempts
        .iter()
        .map(|a| a.session_id.split('-').next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(accounts, vec!["alice", "bob"]);
    assert_eq!(proxy.hits(), 2);
    Ok(())
}

#[tokio::test]
async fn malformed_target_fails_without_touching_proxies() -> anyhow::Result<()> {
    init_tracing();
    let first = FakeProxy::start("200 OK", job_page("unused")).await?;
    let second = FakeProxy::start("200 OK", job_page("unused")).await?;

    let cookies = cookie_dir(&["alice"])?;
    let auth = CookieFileAuthenticator::new(cookies.path());
    let config = engine_config(&[&first, &second])?;
    let controller = config.build_controller(auth.clone(), auth.load_all()?, config.build_classifier())?;
    let orchestrator = ScrapeOrchestrator::new(
        ReqwestTransport::new("http://jobs.example.test")?,
        JsonLdExtractor,
        controller,
    );

    let task = ScrapeTask::new(EntityKind::Job, Target::Url("jobs/view/1".into()));
    let failure = orchestrator
        .submit(&task, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::RemoteRejected);
    assert_eq!(failure.attempts.len(), 1);
    assert_eq!(first.hits() + second.hits(), 0);
    let stats = orchestrator.controller().proxies().stats();
    assert!(stats.endpoints.iter().all(|e| e.failure_count == 0));
    Ok(())
}

fn health_of(pool: &ProxyPool, url: &str) -> ProxyHealth {
    pool.stats()
        .endpoints
        .iter()
        .find(|e| e.id == url)
        .map(|e| e.health)
        .unwrap_or_else(|| panic!("{url} not in pool"))
}
