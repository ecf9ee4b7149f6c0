//! Computed-state cache access with one bounded miss -> refresh -> retry cycle.
//!
//! The accessor never fills the cache itself. On a miss it writes the
//! refresh marker annotation, waits for the reconciler to clear it (seen
//! through the store watch), and reads once more.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keel_core::{Application, ObjectKey, RefreshType, ResourceDiff, ResourceTree, ANNOTATION_REFRESH};
use keel_store::{ObjectStore, WatchEvent, WatchKind};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache miss")]
    Miss,
    #[error("cache backend: {0}")]
    Backend(String),
    /// The app reports comparison errors, so a refresh would not fill the cache.
    #[error("{0}")]
    Comparison(String),
    #[error(transparent)]
    Refresh(AppError),
}

/// Read side of the reconciler's computed-state cache.
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn resource_tree(&self, key: &ObjectKey) -> Result<ResourceTree, CacheError>;
    async fn managed_resources(&self, key: &ObjectKey) -> Result<Vec<ResourceDiff>, CacheError>;
}

#[derive(Debug, Default, Clone)]
struct Entry {
    tree: Option<ResourceTree>,
    managed: Option<Vec<ResourceDiff>>,
}

/// In-memory [`StateCache`]; absent entries are misses.
#[derive(Debug, Default)]
pub struct MemStateCache {
    entries: RwLock<FxHashMap<ObjectKey, Entry>>,
}

impl MemStateCache {
    pub fn new() -> Self { Self::default() }

    fn with_entry<F: FnOnce(&mut Entry)>(&self, key: &ObjectKey, f: F) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        f(map.entry(key.clone()).or_default());
    }

    pub fn set_tree(&self, key: &ObjectKey, tree: ResourceTree) { self.with_entry(key, |e| e.tree = Some(tree)) }

    pub fn set_managed(&self, key: &ObjectKey, diffs: Vec<ResourceDiff>) { self.with_entry(key, |e| e.managed = Some(diffs)) }

    pub fn invalidate(&self, key: &ObjectKey) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).remove(key);
    }
}

#[async_trait]
impl StateCache for MemStateCache {
    async fn resource_tree(&self, key: &ObjectKey) -> Result<ResourceTree, CacheError> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).and_then(|e| e.tree.clone()).ok_or(CacheError::Miss)
    }

    async fn managed_resources(&self, key: &ObjectKey) -> Result<Vec<ResourceDiff>, CacheError> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).and_then(|e| e.managed.clone()).ok_or(CacheError::Miss)
    }
}

pub struct CachedStateAccessor {
    store: Arc<dyn ObjectStore>,
    retries: usize,
    timeout: Duration,
}

impl CachedStateAccessor {
    pub fn new(store: Arc<dyn ObjectStore>, retries: usize, timeout: Duration) -> Self { Self { store, retries, timeout } }

    /// Run `read`; on a miss refresh `app` once and run it again.
    /// Errors other than a miss are returned as they came.
    pub async fn get_or_refresh<T, F, Fut>(&self, app: &Application, mut read: F) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        match read().await {
            Err(CacheError::Miss) => {}
            other => return other,
        }
        let conditions = app.comparison_errors();
        if !conditions.is_empty() {
            let msg = conditions.iter().map(|c| format!("{}: {}", c.kind, c.message)).collect::<Vec<_>>().join("; ");
            return Err(CacheError::Comparison(msg));
        }
        debug!(app = %app.key(), "api: cache miss, refreshing");
        self.refresh(&app.key(), RefreshType::Normal).await.map_err(CacheError::Refresh)?;
        read().await
    }

    /// Ask the reconciler to refresh `key` and wait until it has.
    pub async fn refresh(&self, key: &ObjectKey, kind: RefreshType) -> AppResult<Application> {
        let t0 = Instant::now();
        // Subscribe before writing so the confirmation cannot slip past.
        let mut rx = self.store.watch();
        let written = self.mark(key, kind).await?;
        counter!("cache_refresh_total", 1u64, "kind" => kind.as_str());
        let floor = written.version();

        let wait = self.await_confirmation(&mut rx, key, floor);
        let app = match tokio::time::timeout(self.timeout, wait).await {
            Ok(res) => res?,
            Err(_) => {
                warn!(app = %key, timeout_ms = %self.timeout.as_millis(), "api: refresh timed out");
                return Err(AppError::DeadlineExceeded("application refresh deadline exceeded".into()));
            }
        };
        info!(app = %key, kind = kind.as_str(), took_ms = %t0.elapsed().as_millis(), "api: refresh ok");
        Ok(app)
    }

    async fn await_confirmation(&self, rx: &mut broadcast::Receiver<WatchEvent>, key: &ObjectKey, floor: u64) -> AppResult<Application> {
        loop {
            match rx.recv().await {
                Ok(ev) if ev.app.key() == *key => {
                    if ev.kind == WatchKind::Deleted {
                        return Err(AppError::app_not_found(&key.name));
                    }
                    if confirmed(&ev.app, floor) {
                        return Ok(ev.app);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!(app = %key, skipped = n, "api: refresh watch lagged, reading directly");
                    let cur = self.store.get(key).await?;
                    if confirmed(&cur, floor) {
                        return Ok(cur);
                    }
                }
                Err(RecvError::Closed) => return Err(AppError::Unavailable("application watch closed".into())),
            }
        }
    }

    async fn mark(&self, key: &ObjectKey, kind: RefreshType) -> AppResult<Application> {
        let mut last = None;
        for _ in 0..=self.retries {
            let mut app = self.store.get(key).await?;
            app.metadata.annotations.insert(ANNOTATION_REFRESH.to_string(), kind.as_str().to_string());
            match self.store.update(app).await {
                Ok(a) => return Ok(a),
                Err(e) if e.is_conflict() => {
                    counter!("operation_conflicts_total", 1u64, "op" => "refresh");
                    last = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last.map(AppError::from).unwrap_or_else(|| AppError::Conflict("refresh retries exhausted".into())))
    }
}

fn confirmed(app: &Application, floor: u64) -> bool { app.version() > floor && app.refresh_requested().is_none() }
