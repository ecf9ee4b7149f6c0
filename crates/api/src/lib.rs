//! Keel API layer (in-process).
//!
//! Every entry point goes through one [`AuthzFilter`] to turn a caller's
//! Application identity into the object or a denial, takes the per-key lock
//! for read-modify-write sequences, and persists through the object store's
//! version check. Computed state is read through [`CachedStateAccessor`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use keel_core::{
    ports::{AuditEvent, AuditSink, LiteralRepo, LiveResources, RepoBackend},
    Application, Claims,
};
use keel_rbac::Enforcer;
use keel_store::{KeyLock, ObjectStore, ProjectStore};

pub mod audit;
pub mod authz;
pub mod cache;
pub mod config;
pub mod crud;
pub mod error;
pub mod listing;
pub mod operation;
pub mod patch;
pub mod resources;
pub mod revision;

pub use audit::{LogAudit, MemAudit};
pub use authz::{rbac_name, AppRef, AuthzFilter, Check};
pub use cache::{CacheError, CachedStateAccessor, MemStateCache, StateCache};
pub use config::ServerConfig;
pub use crud::{CreateRequest, DeleteRequest};
pub use error::{AppError, AppResult};
pub use listing::AppQuery;
pub use operation::{RevisionMetadataRequest, RollbackRequest, SyncRequest};
pub use resources::{DetachedLive, LogQuery, ResourceRequest};
pub use revision::{Resolved, ResolvedRevisions, RevisionResolver};

pub struct AppService {
    cfg: Arc<ServerConfig>,
    store: Arc<dyn ObjectStore>,
    projects: Arc<dyn ProjectStore>,
    authz: AuthzFilter,
    cache: Arc<dyn StateCache>,
    accessor: CachedStateAccessor,
    revisions: RevisionResolver,
    repo: Arc<dyn RepoBackend>,
    live: Arc<dyn LiveResources>,
    audit: Arc<dyn AuditSink>,
    locks: KeyLock,
}

/// Wiring for [`AppService`]; unset collaborators get offline defaults.
pub struct AppServiceBuilder {
    cfg: ServerConfig,
    store: Arc<dyn ObjectStore>,
    projects: Arc<dyn ProjectStore>,
    enforcer: Arc<Enforcer>,
    cache: Option<Arc<dyn StateCache>>,
    repo: Option<Arc<dyn RepoBackend>>,
    live: Option<Arc<dyn LiveResources>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl AppServiceBuilder {
    pub fn config(mut self, cfg: ServerConfig) -> Self { self.cfg = cfg; self }
    pub fn cache(mut self, cache: Arc<dyn StateCache>) -> Self { self.cache = Some(cache); self }
    pub fn repo(mut self, repo: Arc<dyn RepoBackend>) -> Self { self.repo = Some(repo); self }
    pub fn live(mut self, live: Arc<dyn LiveResources>) -> Self { self.live = Some(live); self }
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self { self.audit = Some(audit); self }

    pub fn build(self) -> AppService {
        let cfg = Arc::new(self.cfg);
        let repo = self.repo.unwrap_or_else(|| Arc::new(LiteralRepo));
        AppService {
            authz: AuthzFilter::new(cfg.clone(), self.store.clone(), self.projects.clone(), self.enforcer),
            accessor: CachedStateAccessor::new(self.store.clone(), cfg.conflict_retries, cfg.refresh_timeout),
            revisions: RevisionResolver::new(repo.clone()),
            cache: self.cache.unwrap_or_else(|| Arc::new(MemStateCache::new())),
            live: self.live.unwrap_or_else(|| Arc::new(DetachedLive)),
            audit: self.audit.unwrap_or_else(|| Arc::new(LogAudit)),
            locks: KeyLock::new(),
            store: self.store,
            projects: self.projects,
            repo,
            cfg,
        }
    }
}

impl AppService {
    pub fn builder(store: Arc<dyn ObjectStore>, projects: Arc<dyn ProjectStore>, enforcer: Arc<Enforcer>) -> AppServiceBuilder {
        AppServiceBuilder { cfg: ServerConfig::from_env(), store, projects, enforcer, cache: None, repo: None, live: None, audit: None }
    }

    pub fn config(&self) -> &ServerConfig { &self.cfg }
    pub fn authz(&self) -> &AuthzFilter { &self.authz }
    pub fn accessor(&self) -> &CachedStateAccessor { &self.accessor }

    /// Record `<user> <what>` against `app`.
    pub(crate) async fn emit(&self, claims: &Claims, app: &Application, reason: &str, what: &str) {
        let user = claims.username().to_string();
        let event = AuditEvent {
            app: app.key(),
            project: app.project().to_string(),
            reason: reason.to_string(),
            message: format!("{user} {what}"),
            user,
            at: Utc::now(),
        };
        self.audit.record(event).await;
    }
}

// ----------------- Streaming primitives -----------------

/// Cancellation handle that aborts the underlying task.
pub struct CancelHandle { task: Option<tokio::task::JoinHandle<()>> }

impl CancelHandle { pub fn cancel(mut self) { if let Some(h) = self.task.take() { h.abort(); } } }

/// Generic stream handle used by API streaming endpoints.
pub struct StreamHandle<T> { pub rx: tokio::sync::mpsc::Receiver<T>, pub cancel: CancelHandle }
