//! In-RAM arena keyed by (namespace, name).
//!
//! Readers load an immutable [`Snapshot`] through `ArcSwap`; writers are
//! serialized, build the next snapshot and swap it in, then broadcast the
//! change. The snapshot epoch doubles as the store-wide version counter.

use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use keel_core::{AppProject, Application, ObjectKey};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{ObjectStore, ProjectStore, StoreError, WatchEvent, WatchKind};

#[derive(Debug, Default)]
pub struct Snapshot {
    /// Last version handed out.
    pub epoch: u64,
    pub items: FxHashMap<ObjectKey, Arc<Application>>,
}

pub struct MemStore {
    snap: ArcSwap<Snapshot>,
    writer: Mutex<()>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemStore {
    fn default() -> Self {
        let cap = std::env::var("KEEL_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048);
        Self::with_capacity(cap)
    }
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_capacity(cap: usize) -> Self {
        let (events, _) = broadcast::channel(cap.max(1));
        Self { snap: ArcSwap::from_pointee(Snapshot::default()), writer: Mutex::new(()), events }
    }

    /// Build a store from existing objects in one swap; no events are sent.
    pub fn with_objects<I: IntoIterator<Item = Application>>(apps: I) -> Self {
        let store = Self::new();
        let mut next = Snapshot::default();
        for mut a in apps {
            next.epoch += 1;
            a.metadata.resource_version = next.epoch.to_string();
            next.items.insert(a.key(), Arc::new(a));
        }
        store.snap.store(Arc::new(next));
        store
    }

    pub fn snapshot(&self) -> Arc<Snapshot> { self.snap.load_full() }

    pub fn len(&self) -> usize { self.snap.load().items.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn lock(&self) -> MutexGuard<'_, ()> { self.writer.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Swap in `cur` with `key` replaced (or removed) and announce the change.
    fn commit(&self, cur: &Snapshot, key: ObjectKey, next: Option<Application>, kind: WatchKind, gone: Option<&Application>) -> Application {
        let epoch = cur.epoch + 1;
        let mut items = cur.items.clone();
        let announced = match next {
            Some(mut a) => {
                a.metadata.resource_version = epoch.to_string();
                items.insert(key, Arc::new(a.clone()));
                a
            }
            None => {
                items.remove(&key);
                let mut a = gone.cloned().unwrap_or_default();
                a.metadata.resource_version = epoch.to_string();
                a
            }
        };
        self.snap.store(Arc::new(Snapshot { epoch, items }));
        counter!("store_writes_total", 1u64, "kind" => kind_label(kind));
        // No subscribers is fine.
        let _ = self.events.send(WatchEvent { kind, app: announced.clone() });
        debug!(app = %announced.key(), version = epoch, ?kind, "store: committed");
        announced
    }
}

fn kind_label(kind: WatchKind) -> &'static str {
    match kind { WatchKind::Added => "added", WatchKind::Modified => "modified", WatchKind::Deleted => "deleted" }
}

fn precondition(stored: &Application, incoming: &Application) -> Result<(), StoreError> {
    let want = &incoming.metadata.resource_version;
    if want.is_empty() || *want == stored.metadata.resource_version {
        return Ok(());
    }
    Err(StoreError::Conflict(
        stored.key(),
        format!("the object has been modified (have {}, got {want}); please apply your changes to the latest version and try again", stored.metadata.resource_version),
    ))
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<Application, StoreError> {
        self.snap.load().items.get(key).map(|a| (**a).clone()).ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self) -> Result<Vec<Arc<Application>>, StoreError> {
        Ok(self.snap.load().items.values().cloned().collect())
    }

    async fn create(&self, app: Application) -> Result<Application, StoreError> {
        let _w = self.lock();
        let cur = self.snap.load_full();
        let key = app.key();
        if cur.items.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        Ok(self.commit(&cur, key, Some(app), WatchKind::Added, None))
    }

    async fn update(&self, app: Application) -> Result<Application, StoreError> {
        let _w = self.lock();
        let cur = self.snap.load_full();
        let key = app.key();
        let stored = cur.items.get(&key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
        precondition(stored, &app)?;
        let mut next = app;
        next.status = stored.status.clone();
        Ok(self.commit(&cur, key, Some(next), WatchKind::Modified, None))
    }

    async fn update_status(&self, app: Application) -> Result<Application, StoreError> {
        let _w = self.lock();
        let cur = self.snap.load_full();
        let key = app.key();
        let stored = cur.items.get(&key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
        precondition(stored, &app)?;
        let mut next = (**stored).clone();
        next.status = app.status;
        Ok(self.commit(&cur, key, Some(next), WatchKind::Modified, None))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let _w = self.lock();
        let cur = self.snap.load_full();
        let stored = cur.items.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
        self.commit(&cur, key.clone(), None, WatchKind::Deleted, Some(&stored));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> { self.events.subscribe() }
}

/// In-RAM project catalog.
#[derive(Default)]
pub struct MemProjects {
    items: ArcSwap<FxHashMap<String, Arc<AppProject>>>,
}

impl MemProjects {
    pub fn new() -> Self { Self::default() }

    pub fn with_projects<I: IntoIterator<Item = AppProject>>(projects: I) -> Self {
        let map: FxHashMap<_, _> = projects.into_iter().map(|p| (p.metadata.name.clone(), Arc::new(p))).collect();
        Self { items: ArcSwap::from_pointee(map) }
    }

    pub fn upsert(&self, project: AppProject) {
        self.items.rcu(|cur| {
            let mut next = (**cur).clone();
            next.insert(project.metadata.name.clone(), Arc::new(project.clone()));
            next
        });
    }

    pub fn remove(&self, name: &str) {
        self.items.rcu(|cur| {
            let mut next = (**cur).clone();
            next.remove(name);
            next
        });
    }
}

#[async_trait]
impl ProjectStore for MemProjects {
    async fn get(&self, name: &str) -> Result<Option<AppProject>, StoreError> {
        Ok(self.items.load().get(name).map(|p| (**p).clone()))
    }

    async fn list(&self) -> Result<Vec<AppProject>, StoreError> {
        let mut out: Vec<AppProject> = self.items.load().values().map(|p| (**p).clone()).collect();
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(out)
    }
}
