use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use moka::future::Cache;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, USER_AGENT};
use reqwest::{Client, Proxy, redirect};
use scout_core::error::AppError;
use scout_core::models::{EntityKind, RawPayload, ScrapeTask, Target};
use scout_core::proxy_pool::ProxyEndpoint;
use scout_core::session_store::Session;
use scout_core::traits::Transport;
use url::Url;

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

/// Upper bound on cached per-proxy clients.
const MAX_CLIENTS: u64 = 256;

/// HTTP transport using reqwest, routed through the attempt's proxy.
///
/// Keeps one client per proxy endpoint so connection pools are never shared
/// across egress IPs. Every request carries the session's cookies or bearer
/// token and a user agent pinned to the session.
#[derive(Clone)]
pub struct ReqwestTransport {
    base_url: Url,
    timeout: Duration,
    user_agents: Vec<String>,
    clients: Cache<String, Client>,
}

impl ReqwestTransport {
    /// `base_url` is the site root that search queries are resolved against.
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid base URL '{base_url}': {e}")))?;
        Ok(Self {
            base_url,
            timeout: Duration::from_secs(30),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            clients: Cache::builder().max_capacity(MAX_CLIENTS).build(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agents(mut self, user_agents: Vec<String>) -> Self {
        if !user_agents.is_empty() {
            self.user_agents = user_agents;
        }
        self
    }

    /// The user agent a session always presents.
    pub fn user_agent_for(&self, session: &Session) -> &str {
        let mut hasher = DefaultHasher::new();
        session.id.hash(&mut hasher);
        let idx = (hasher.finish() % self.user_agents.len() as u64) as usize;
        &self.user_agents[idx]
    }

    /// Resolve a task target to the URL to fetch.
    pub fn request_url(&self, task: &ScrapeTask) -> Result<Url, AppError> {
        match &task.target {
            Target::Url(raw) => {
                Url::parse(raw).map_err(|e| AppError::InvalidRequest(format!("Invalid URL '{raw}': {e}")))
            }
            Target::Query(query) => {
                let path = match task.kind {
                    EntityKind::Job => "/jobs/search/",
                    EntityKind::Company => "/search/results/companies/",
                    EntityKind::Profile => "/search/results/people/",
                };
                let mut url = self
                    .base_url
                    .join(path)
                    .map_err(|e| AppError::InvalidRequest(format!("Invalid search path: {e}")))?;
                url.query_pairs_mut().append_pair("keywords", query);
                Ok(url)
            }
        }
    }

    async fn client_for(&self, proxy: &ProxyEndpoint) -> Result<Client, AppError> {
        let timeout = self.timeout;
        self.clients
            .try_get_with(proxy.id.clone(), async move { build_client(proxy, timeout) })
            .await
            .map_err(|e| AppError::ConfigError(format!("Cannot build client for {}: {e}", proxy.id)))
    }
}

fn build_client(proxy: &ProxyEndpoint, timeout: Duration) -> Result<Client, AppError> {
    let mut route = match (&proxy.credentials, proxy.scheme.starts_with("socks")) {
        // SOCKS credentials travel in the URL.
        (Some(creds), true) => {
            let mut url = Url::parse(proxy.url())
                .map_err(|e| AppError::ConfigError(format!("Invalid proxy {}: {e}", proxy.id)))?;
            let _ = url.set_username(&creds.username);
            let _ = url.set_password(Some(&creds.password));
            Proxy::all(url.as_str())
        }
        _ => Proxy::all(proxy.url()),
    }
    .map_err(|e| AppError::ConfigError(format!("Invalid proxy {}: {e}", proxy.id)))?;

    if let (Some(creds), false) = (&proxy.credentials, proxy.scheme.starts_with("socks")) {
        route = route.basic_auth(&creds.username, &creds.password);
    }

    tracing::debug!(proxy = %proxy.id, "Building HTTP client");
    Client::builder()
        .proxy(route)
        .timeout(timeout)
        .redirect(redirect::Policy::limited(10))
        .build()
        .map_err(|e| AppError::ConfigError(format!("Cannot build client for {}: {e}", proxy.id)))
}

impl Transport for ReqwestTransport {
    async fn fetch(
        &self,
        session: &Session,
        proxy: &ProxyEndpoint,
        task: &ScrapeTask,
    ) -> Result<RawPayload, AppError> {
        let url = self.request_url(task)?;
        let client = self.client_for(proxy).await?;

        let mut request = client
            .get(url.clone())
            .header(USER_AGENT, self.user_agent_for(session))
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9");
        if let Some(cookies) = session.credentials.cookie_header() {
            request = request.header(COOKIE, cookies);
        }
        if let Some(token) = session.credentials.bearer_token() {
            request = request.bearer_auth(token);
        }

        let timeout_secs = self.timeout.as_secs();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed via {}: {e}", proxy.id))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        // Non-2xx responses are data for the classifier, not errors.
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(timeout_secs)
            } else {
                AppError::HttpError(format!("Failed to read response body: {e}"))
            }
        })?;

        tracing::debug!(
            url = %url,
            final_url = %final_url,
            status,
            bytes = body.len(),
            proxy = %proxy.id,
            "Fetched"
        );
        Ok(RawPayload::new(status, final_url, body))
    }
}
