use std::future::Future;

use crate::error::AppError;
use crate::models::{EntityKind, NormalizedRecord, RawPayload, ScrapeTask};
use crate::proxy_pool::ProxyEndpoint;
use crate::session_store::Session;

/// Executes one request through a given proxy with a given session.
///
/// The engine is agnostic to the underlying request library; this is the
/// only place real network I/O happens.
pub trait Transport: Send + Sync + Clone {
    fn fetch(
        &self,
        session: &Session,
        proxy: &ProxyEndpoint,
        task: &ScrapeTask,
    ) -> impl Future<Output = Result<RawPayload, AppError>> + Send;
}

/// Mints a fresh authenticated session.
pub trait Authenticator: Send + Sync + Clone {
    fn authenticate(&self) -> impl Future<Output = Result<Session, AppError>> + Send;
}

/// Converts a fetched payload into a normalized record.
///
/// Must be pure: it is only called after a successful fetch and its errors
/// are reported separately from fetch failures.
pub trait Extractor: Send + Sync + Clone {
    fn extract(&self, kind: EntityKind, payload: &RawPayload)
    -> Result<NormalizedRecord, AppError>;
}
