//! Cookie-jar authenticator.
//!
//! Sessions are minted from JSON cookie jars exported by a separate cookie
//! generator, one file per account (`<account>.json`). Accounts are handed
//! out round-robin; jars older than the max age, or whose cookies have all
//! expired, are skipped. A jar is handed out once per write: after an
//! account's session has been minted, that account is skipped until the
//! cookie generator rewrites its file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use scout_core::error::AppError;
use scout_core::session_store::{Cookie, Credentials, Session};
use scout_core::traits::Authenticator;

/// Accepts both a bare cookie array and `{"cookies": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum JarFile {
    List(Vec<Cookie>),
    Wrapped { cookies: Vec<Cookie> },
}

impl JarFile {
    fn into_cookies(self) -> Vec<Cookie> {
        match self {
            JarFile::List(cookies) | JarFile::Wrapped { cookies } => cookies,
        }
    }
}

#[derive(Debug, Clone)]
struct Jar {
    account: String,
    path: PathBuf,
    modified: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CookieFileAuthenticator {
    dir: PathBuf,
    max_age: Duration,
    next: Arc<AtomicUsize>,
    /// Modification time of the jar each account was last minted from.
    minted: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl CookieFileAuthenticator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_age: Duration::from_secs(24 * 60 * 60),
            next: Arc::new(AtomicUsize::new(0)),
            minted: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Jars whose file is older than this are treated as stale.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every usable session in the directory, for the startup load.
    ///
    /// Jars loaded here count as minted.
    pub fn load_all(&self) -> Result<Vec<Session>, AppError> {
        let now = Utc::now();
        let sessions: Vec<Session> = self
            .scan()?
            .iter()
            .filter_map(|jar| {
                let session = self.open(jar, now)?;
                self.mark_minted(jar);
                Some(session)
            })
            .collect();
        tracing::info!(dir = %self.dir.display(), count = sessions.len(), "Loaded cookie jars");
        Ok(sessions)
    }

    /// Next usable session in round-robin order.
    fn next_session(&self) -> Result<Session, AppError> {
        let jars = self.scan()?;
        if jars.is_empty() {
            return Err(AppError::AuthError(format!(
                "No cookie jars in {}",
                self.dir.display()
            )));
        }

        let now = Utc::now();
        let start = self.next.load(Ordering::SeqCst) % jars.len();
        let mut already_used = 0;
        for offset in 0..jars.len() {
            let idx = (start + offset) % jars.len();
            let jar = &jars[idx];
            if self.already_minted(jar) {
                tracing::debug!(account = %jar.account, "Cookie jar unchanged since last mint");
                already_used += 1;
                continue;
            }
            if let Some(session) = self.open(jar, now) {
                self.mark_minted(jar);
                self.next.store(idx + 1, Ordering::SeqCst);
                tracing::info!(account = %session.account, "Minted session from cookie jar");
                return Ok(session);
            }
        }

        Err(AppError::AuthError(format!(
            "No usable cookie jar in {} ({} already used, {} stale or expired)",
            self.dir.display(),
            already_used,
            jars.len() - already_used
        )))
    }

    fn lock_minted(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.minted.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned cookie jar mutex");
            poisoned.into_inner()
        })
    }

    fn already_minted(&self, jar: &Jar) -> bool {
        self.lock_minted()
            .get(&jar.account)
            .is_some_and(|modified| *modified >= jar.modified)
    }

    fn mark_minted(&self, jar: &Jar) {
        self.lock_minted().insert(jar.account.clone(), jar.modified);
    }

    /// `*.json` files in the directory, sorted by account.
    fn scan(&self) -> Result<Vec<Jar>, AppError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            AppError::ConfigError(format!(
                "Cannot read cookie directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut jars = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(account) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let modified = std::fs::metadata(&path)?.modified()?;
            jars.push(Jar {
                account: account.to_string(),
                path: path.clone(),
                modified: DateTime::<Utc>::from(modified),
            });
        }
        jars.sort_by(|a, b| a.account.cmp(&b.account));
        Ok(jars)
    }

    /// Build a session from a jar, or `None` if it is stale, unreadable or
    /// fully expired.
    fn open(&self, jar: &Jar, now: DateTime<Utc>) -> Option<Session> {
        let age = now.signed_duration_since(jar.modified).to_std().unwrap_or_default();
        if age > self.max_age {
            tracing::warn!(account = %jar.account, age_hours = age.as_secs() / 3600, "Cookie jar is stale");
            return None;
        }

        let cookies = match read_jar(&jar.path) {
            Ok(cookies) => cookies,
            Err(e) => {
                tracing::warn!(account = %jar.account, error = %e, "Skipping unreadable cookie jar");
                return None;
            }
        };

        let live: Vec<Cookie> = cookies.into_iter().filter(|c| !c.is_expired_at(now)).collect();
        if live.is_empty() {
            tracing::warn!(account = %jar.account, "All cookies in jar have expired");
            return None;
        }

        Some(
            Session::new(jar.account.clone(), Credentials::Cookies { cookies: live })
                .with_created_at(jar.modified),
        )
    }
}

fn read_jar(path: &Path) -> Result<Vec<Cookie>, AppError> {
    let raw = std::fs::read_to_string(path)?;
    let jar: JarFile = serde_json::from_str(&raw)?;
    Ok(jar.into_cookies())
}

impl Authenticator for CookieFileAuthenticator {
    async fn authenticate(&self) -> Result<Session, AppError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.next_session())
            .await
            .map_err(|e| AppError::Generic(format!("Cookie loader panicked: {e}")))?
    }
}
