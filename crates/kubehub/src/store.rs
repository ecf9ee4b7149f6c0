//! Application and AppProject stores over the Kubernetes API.
//!
//! `get` and all writes go to the API server. `list` serves the watch-fed
//! snapshot once the initial listing has arrived, and the API server before
//! that. The Application CRD has no status subresource, so `update` and
//! `update_status` are read-compare-replace against the stored object with
//! the caller's version as the precondition.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use anyhow::Result;
use async_trait::async_trait;
use futures::TryStreamExt;
use keel_core::{AppProject, Application, ObjectKey};
use keel_store::{ObjectStore, ProjectStore, StoreError, WatchEvent, WatchKind};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{app_from_dynamic, app_resource, project_from_dynamic, project_resource, store_error, to_dynamic};

type Items = FxHashMap<ObjectKey, Arc<Application>>;

struct Shared {
    items: RwLock<Items>,
    synced: AtomicBool,
    events: broadcast::Sender<WatchEvent>,
}

impl Shared {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Items> { self.items.read().unwrap_or_else(|e| e.into_inner()) }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Items> { self.items.write().unwrap_or_else(|e| e.into_inner()) }

    fn publish(&self, kind: WatchKind, app: Application) {
        counter!("kube_watch_events_total", 1u64);
        // No subscribers is fine.
        let _ = self.events.send(WatchEvent { kind, app });
    }

    fn applied(&self, app: Application) {
        let key = app.key();
        let prev = self.write().insert(key, Arc::new(app.clone()));
        self.publish(if prev.is_some() { WatchKind::Modified } else { WatchKind::Added }, app);
    }

    fn deleted(&self, app: Application) {
        self.write().remove(&app.key());
        self.publish(WatchKind::Deleted, app);
    }

    /// Replace the snapshot after a watch (re)start, announcing the differences.
    fn restarted(&self, apps: Vec<Application>) {
        let next: Items = apps.into_iter().map(|a| (a.key(), Arc::new(a))).collect();
        let prev = std::mem::replace(&mut *self.write(), next.clone());
        for (key, app) in &next {
            match prev.get(key) {
                Some(old) if old.metadata.resource_version == app.metadata.resource_version => {}
                Some(_) => self.publish(WatchKind::Modified, (**app).clone()),
                None => self.publish(WatchKind::Added, (**app).clone()),
            }
        }
        for (key, old) in prev {
            if !next.contains_key(&key) {
                self.publish(WatchKind::Deleted, (*old).clone());
            }
        }
        self.synced.store(true, Ordering::Release);
    }
}

pub struct KubeAppStore {
    client: Client,
    ar: ApiResource,
    namespace: Option<String>,
    shared: Arc<Shared>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for KubeAppStore {
    fn drop(&mut self) { self.task.abort(); }
}

impl KubeAppStore {
    /// Start watching Applications in `namespace` (all namespaces when `None`).
    pub async fn start(client: Client, namespace: Option<&str>) -> Result<Self> {
        let cap = std::env::var("KEEL_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048);
        let (events, _) = broadcast::channel(cap.max(1));
        let shared = Arc::new(Shared { items: RwLock::new(FxHashMap::default()), synced: AtomicBool::new(false), events });
        let ar = app_resource();
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        };
        let task = tokio::spawn(run_watcher(api, shared.clone(), namespace.map(str::to_string)));
        Ok(Self { client, ar, namespace: namespace.map(str::to_string), shared, task })
    }

    fn api(&self, ns: &str) -> Api<DynamicObject> { Api::namespaced_with(self.client.clone(), ns, &self.ar) }

    async fn fetch(&self, key: &ObjectKey) -> Result<Application, StoreError> {
        let obj = self.api(&key.namespace).get(&key.name).await.map_err(|e| store_error(key, e))?;
        Ok(app_from_dynamic(&obj)?)
    }

    /// Write `next` over the stored object if `expected` (when non-empty) is still current.
    async fn replace(&self, key: &ObjectKey, stored: &Application, expected: &str, mut next: Application) -> Result<Application, StoreError> {
        if !expected.is_empty() && expected != stored.metadata.resource_version {
            return Err(StoreError::Conflict(
                key.clone(),
                format!("the object has been modified (have {}, got {expected}); please apply your changes to the latest version and try again", stored.metadata.resource_version),
            ));
        }
        next.metadata.resource_version = stored.metadata.resource_version.clone();
        let obj = to_dynamic(&next, &self.ar)?;
        let out = self.api(&key.namespace).replace(&key.name, &PostParams::default(), &obj).await.map_err(|e| store_error(key, e))?;
        Ok(app_from_dynamic(&out)?)
    }
}

async fn run_watcher(api: Api<DynamicObject>, shared: Arc<Shared>, namespace: Option<String>) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "kube: application watcher started");
    loop {
        let ev = match stream.try_next().await {
            Ok(Some(ev)) => ev,
            Ok(None) => break,
            Err(e) => {
                // Backoff is applied by the stream; keep polling.
                warn!(error = %e, "kube: application watch error");
                continue;
            }
        };
        match ev {
            Event::Applied(o) => match app_from_dynamic(&o) {
                Ok(a) => shared.applied(a),
                Err(e) => warn!(error = %e, name = ?o.metadata.name, "kube: undecodable application skipped"),
            },
            Event::Deleted(o) => match app_from_dynamic(&o) {
                Ok(a) => shared.deleted(a),
                Err(e) => warn!(error = %e, name = ?o.metadata.name, "kube: undecodable application skipped"),
            },
            Event::Restarted(list) => {
                debug!(count = list.len(), "kube: application watch restart");
                let apps = list.iter().filter_map(|o| app_from_dynamic(o).ok()).collect();
                shared.restarted(apps);
            }
        }
    }
    warn!("kube: application watcher stream ended");
}

#[async_trait]
impl ObjectStore for KubeAppStore {
    async fn get(&self, key: &ObjectKey) -> Result<Application, StoreError> { self.fetch(key).await }

    async fn list(&self) -> Result<Vec<Arc<Application>>, StoreError> {
        if self.shared.synced.load(Ordering::Acquire) {
            return Ok(self.shared.read().values().cloned().collect());
        }
        let api: Api<DynamicObject> = match &self.namespace {
            Some(ns) => self.api(ns),
            None => Api::all_with(self.client.clone(), &self.ar),
        };
        let list = api.list(&ListParams::default()).await.map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(list.items.iter().filter_map(|o| app_from_dynamic(o).ok()).map(Arc::new).collect())
    }

    async fn create(&self, app: Application) -> Result<Application, StoreError> {
        let key = app.key();
        let obj = to_dynamic(&app, &self.ar)?;
        let out = self.api(&key.namespace).create(&PostParams::default(), &obj).await.map_err(|e| store_error(&key, e))?;
        debug!(app = %key, "kube: created");
        Ok(app_from_dynamic(&out)?)
    }

    async fn update(&self, app: Application) -> Result<Application, StoreError> {
        let key = app.key();
        let stored = self.fetch(&key).await?;
        let expected = app.metadata.resource_version.clone();
        let mut next = app;
        next.status = stored.status.clone();
        self.replace(&key, &stored, &expected, next).await
    }

    async fn update_status(&self, app: Application) -> Result<Application, StoreError> {
        let key = app.key();
        let stored = self.fetch(&key).await?;
        let mut next = stored.clone();
        next.status = app.status;
        self.replace(&key, &stored, &app.metadata.resource_version, next).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api(&key.namespace).delete(&key.name, &DeleteParams::default()).await.map_err(|e| store_error(key, e))?;
        debug!(app = %key, "kube: delete requested");
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> { self.shared.events.subscribe() }
}

/// AppProjects in the control namespace, read straight from the API server.
pub struct KubeProjects {
    api: Api<DynamicObject>,
}

impl KubeProjects {
    pub fn new(client: Client, control_ns: &str) -> Self { Self { api: Api::namespaced_with(client, control_ns, &project_resource()) } }
}

#[async_trait]
impl ProjectStore for KubeProjects {
    async fn get(&self, name: &str) -> Result<Option<AppProject>, StoreError> {
        match self.api.get_opt(name).await.map_err(|e| StoreError::Backend(e.to_string()))? {
            Some(obj) => Ok(Some(project_from_dynamic(&obj)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<AppProject>, StoreError> {
        let list = self.api.list(&ListParams::default()).await.map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::with_capacity(list.items.len());
        for obj in &list.items {
            match project_from_dynamic(obj) {
                Ok(p) => out.push(p),
                Err(e) => warn!(error = %e, name = ?obj.metadata.name, "kube: undecodable project skipped"),
            }
        }
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Meta;

    fn shared() -> Shared {
        let (events, _) = broadcast::channel(16);
        Shared { items: RwLock::new(FxHashMap::default()), synced: AtomicBool::new(false), events }
    }

    fn app(name: &str, rv: &str) -> Application {
        let mut a = Application::default();
        a.metadata = Meta { name: name.into(), namespace: "argocd".into(), resource_version: rv.into(), ..Default::default() };
        a
    }

    #[test]
    fn restart_announces_only_differences() {
        let s = shared();
        s.applied(app("keep", "1"));
        s.applied(app("change", "1"));
        s.applied(app("drop", "1"));
        let mut rx = s.events.subscribe();
        s.restarted(vec![app("keep", "1"), app("change", "2"), app("new", "1")]);

        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push((ev.kind, ev.app.name().to_string()));
        }
        seen.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            seen,
            [(WatchKind::Modified, "change".to_string()), (WatchKind::Deleted, "drop".to_string()), (WatchKind::Added, "new".to_string())]
        );
        assert!(s.synced.load(Ordering::Acquire));
        assert_eq!(s.read().len(), 3);
    }

    #[test]
    fn applied_twice_is_a_modification() {
        let s = shared();
        let mut rx = s.events.subscribe();
        s.applied(app("a", "1"));
        s.applied(app("a", "2"));
        s.deleted(app("a", "3"));
        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind).collect();
        assert_eq!(kinds, [WatchKind::Added, WatchKind::Modified, WatchKind::Deleted]);
        assert!(s.read().is_empty());
    }
}
