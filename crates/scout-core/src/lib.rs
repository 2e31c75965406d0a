pub mod classify;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod proxy_pool;
pub mod retry;
pub mod session_store;
pub mod throttle;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use classify::{Classification, ClassifierConfig, ResponseClassifier, RuleClassifier};
pub use config::EngineConfig;
pub use error::{AppError, FailureKind, TerminalFailure};
pub use events::{NoopRetryReporter, RetryEvent, RetryReporter, TracingRetryReporter};
pub use models::{
    AttemptOutcome, AttemptRecord, EntityKind, NormalizedRecord, RawPayload, ScrapeOutcome,
    ScrapeTask, Target, compute_hash,
};
pub use orchestrator::ScrapeOrchestrator;
pub use proxy_pool::{ProxyEndpoint, ProxyHealth, ProxyOutcome, ProxyPool, ProxyPoolConfig};
pub use retry::{RetryController, RetryPolicy};
pub use session_store::{
    Cookie, Credentials, Session, SessionError, SessionState, SessionStore, SessionStoreConfig,
    SessionVerdict,
};
pub use throttle::{Throttle, ThrottleConfig, ThrottleKey};
pub use traits::{Authenticator, Extractor, Transport};
