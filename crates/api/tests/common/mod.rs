#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use keel_api::{AppService, MemAudit, MemStateCache, ServerConfig};
use keel_core::{
    ports::{AppDetails, DeleteOptions, LiveResources, PatchKind, RepoBackend, RevisionMetadata, RevisionResolution},
    AppProject, AppSource, Application, Destination, Meta, ObjectKey, ProjectDestination, ResourceRef, ResourceStatus, ResourceTree,
    ANNOTATION_REFRESH,
};
use keel_rbac::Enforcer;
use keel_store::{MemProjects, MemStore, ObjectStore, ProjectStore, StoreError, WatchEvent};
use serde_json::{json, Value};

pub const REPO: &str = "https://github.com/example/apps.git";

pub fn config() -> ServerConfig {
    ServerConfig {
        namespace: "argocd".into(),
        app_namespaces: vec!["team-*".into()],
        disable_fine_grained_inheritance: true,
        conflict_retries: 5,
        refresh_timeout: Duration::from_secs(2),
        max_pod_logs: 3,
    }
}

pub fn source(rev: &str) -> AppSource { AppSource { repo_url: REPO.into(), path: Some("guestbook".into()), target_revision: rev.into(), ..Default::default() } }

pub fn app(ns: &str, name: &str, project: &str) -> Application {
    let mut a = Application::default();
    a.metadata = Meta { name: name.into(), namespace: ns.into(), ..Default::default() };
    a.spec.project = project.into();
    a.spec.source = Some(source("main"));
    a.spec.destination = Destination { server: "https://kubernetes.default.svc".into(), namespace: "default".into(), ..Default::default() };
    a
}

/// Project admitting any repo and destination, plus `source_namespaces`.
pub fn project(name: &str, source_namespaces: &[&str]) -> AppProject {
    let mut p = AppProject::new(name);
    p.spec.source_repos = vec!["*".into()];
    p.spec.destinations = vec![ProjectDestination { server: "*".into(), namespace: "*".into(), ..Default::default() }];
    p.spec.source_namespaces = source_namespaces.iter().map(|s| s.to_string()).collect();
    p
}

/// Repo backend that resolves `x` to `x-sha` and counts calls.
#[derive(Default)]
pub struct ScriptedRepo {
    pub resolves: AtomicUsize,
    pub details: AtomicUsize,
}

#[async_trait]
impl RepoBackend for ScriptedRepo {
    async fn resolve_revision(&self, _source: &AppSource, ambiguous: &str) -> anyhow::Result<RevisionResolution> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if ambiguous == "broken" {
            anyhow::bail!("no such ref");
        }
        let revision = format!("{ambiguous}-sha");
        Ok(RevisionResolution { display: format!("{ambiguous} ({revision})"), revision })
    }
    async fn app_details(&self, _source: &AppSource, _no_cache: bool) -> anyhow::Result<AppDetails> {
        self.details.fetch_add(1, Ordering::SeqCst);
        Ok(AppDetails { source_type: "Directory".into(), description: String::new() })
    }
    async fn generate_manifests(&self, source: &AppSource, revision: &str) -> anyhow::Result<Vec<String>> {
        Ok(vec![format!("# {}@{revision}", source.repo_url)])
    }
    async fn revision_metadata(&self, repo_url: &str, revision: &str) -> anyhow::Result<RevisionMetadata> {
        Ok(RevisionMetadata { author: "ci".into(), message: format!("{repo_url}@{revision}"), ..Default::default() })
    }
}

pub struct Fixture {
    pub store: Arc<MemStore>,
    pub projects: Arc<MemProjects>,
    pub enforcer: Arc<Enforcer>,
    pub cache: Arc<MemStateCache>,
    pub audit: Arc<MemAudit>,
    pub repo: Arc<ScriptedRepo>,
    pub live: Arc<RecordingLive>,
    pub svc: AppService,
}

pub fn fixture_with(cfg: ServerConfig, policy: &str, projects: Vec<AppProject>, apps: Vec<Application>) -> Fixture {
    let store = Arc::new(MemStore::with_objects(apps));
    let projects = Arc::new(MemProjects::with_projects(projects));
    let enforcer = Arc::new(Enforcer::with_builtin().expect("builtin policy"));
    enforcer.set_user_policy(policy).expect("test policy");
    let cache = Arc::new(MemStateCache::new());
    let audit = Arc::new(MemAudit::new());
    let repo = Arc::new(ScriptedRepo::default());
    let live = Arc::new(RecordingLive::default());
    let svc = AppService::builder(store.clone(), projects.clone(), enforcer.clone())
        .config(cfg)
        .cache(cache.clone())
        .audit(audit.clone())
        .repo(repo.clone())
        .live(live.clone())
        .build();
    Fixture { store, projects, enforcer, cache, audit, repo, live, svc }
}

pub fn fixture(policy: &str, apps: Vec<Application>) -> Fixture {
    fixture_with(config(), policy, vec![project("default", &["team-*"]), project("test", &[])], apps)
}

/// Stand-in for the reconciler: each time the refresh marker appears on
/// `key`, fill the cache and clear the marker. The counter is the number of
/// refresh requests it has served.
pub fn spawn_reconciler(store: Arc<MemStore>, cache: Arc<MemStateCache>, key: ObjectKey, tree: ResourceTree) -> (Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
    let served = Arc::new(AtomicUsize::new(0));
    let mut rx = store.watch();
    let counter = served.clone();
    let task = tokio::spawn(async move {
        while let Ok(ev) = rx.recv().await {
            if ev.app.key() != key || ev.app.refresh_requested().is_none() {
                continue;
            }
            counter.fetch_add(1, Ordering::SeqCst);
            cache.set_tree(&key, tree.clone());
            let Ok(mut a) = store.get(&key).await else { break };
            a.metadata.annotations.remove(ANNOTATION_REFRESH);
            a.metadata.resource_version.clear();
            if store.update(a).await.is_err() {
                break;
            }
        }
    });
    (served, task)
}

/// Live-resource port that answers every call and remembers what it was asked.
#[derive(Default)]
pub struct RecordingLive {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingLive {
    pub fn calls(&self) -> Vec<String> { self.calls.lock().expect("calls").clone() }

    fn note(&self, what: String) { self.calls.lock().expect("calls").push(what) }
}

#[async_trait]
impl LiveResources for RecordingLive {
    async fn get(&self, _app: &Application, res: &ResourceRef) -> anyhow::Result<Option<Value>> {
        self.note(format!("get {}/{}", res.kind, res.name));
        Ok(Some(json!({"kind": res.kind, "metadata": {"name": res.name}})))
    }
    async fn patch(&self, _app: &Application, res: &ResourceRef, patch: &str, _kind: PatchKind) -> anyhow::Result<Value> {
        self.note(format!("patch {}/{}", res.kind, res.name));
        Ok(serde_json::from_str(patch)?)
    }
    async fn delete(&self, _app: &Application, res: &ResourceRef, _opts: DeleteOptions) -> anyhow::Result<()> {
        self.note(format!("delete {}/{}", res.kind, res.name));
        Ok(())
    }
    async fn run_action(&self, _app: &Application, res: &ResourceRef, action: &str) -> anyhow::Result<()> {
        self.note(format!("{action} {}/{}", res.kind, res.name));
        Ok(())
    }
}

/// Record `res` as managed by `app`.
pub fn manage(app: &mut Application, res: &ResourceRef) {
    app.status.resources.push(ResourceStatus {
        group: res.group.clone(),
        kind: res.kind.clone(),
        namespace: res.namespace.clone(),
        name: res.name.clone(),
        ..Default::default()
    });
}

/// Store whose first `fail_first` updates lose a version race.
pub struct RacingStore {
    pub inner: Arc<MemStore>,
    pub fail_first: usize,
    pub updates: AtomicUsize,
}

impl RacingStore {
    pub fn new(inner: Arc<MemStore>, fail_first: usize) -> Self { Self { inner, fail_first, updates: AtomicUsize::new(0) } }
}

#[async_trait]
impl ObjectStore for RacingStore {
    async fn get(&self, key: &ObjectKey) -> Result<Application, StoreError> { self.inner.get(key).await }
    async fn list(&self) -> Result<Vec<Arc<Application>>, StoreError> { self.inner.list().await }
    async fn create(&self, app: Application) -> Result<Application, StoreError> { self.inner.create(app).await }
    async fn update(&self, app: Application) -> Result<Application, StoreError> {
        if self.updates.fetch_add(1, Ordering::SeqCst) < self.fail_first {
            return Err(StoreError::Conflict(app.key(), "the object has been modified".into()));
        }
        self.inner.update(app).await
    }
    async fn update_status(&self, app: Application) -> Result<Application, StoreError> { self.inner.update_status(app).await }
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> { self.inner.delete(key).await }
    fn watch(&self) -> tokio::sync::broadcast::Receiver<WatchEvent> { self.inner.watch() }
}

/// Service over `fx`'s collaborators whose store loses the first `fail_first` update races.
pub fn racing_service(fx: &Fixture, fail_first: usize) -> (AppService, Arc<RacingStore>) {
    let racing = Arc::new(RacingStore::new(fx.store.clone(), fail_first));
    let projects: Arc<dyn ProjectStore> = fx.projects.clone();
    let svc = AppService::builder(racing.clone(), projects, fx.enforcer.clone())
        .config(config())
        .cache(fx.cache.clone())
        .audit(fx.audit.clone())
        .repo(fx.repo.clone())
        .live(fx.live.clone())
        .build();
    (svc, racing)
}
