//! Create, get, update, patch and delete for Application objects.

use std::time::Instant;

use futures::future::try_join_all;
use keel_core::{
    ports::{REASON_CREATED, REASON_DELETED, REASON_UPDATED},
    AppSpec, Application, Claims, RefreshType, DEFAULT_PROJECT, FINALIZER_BACKGROUND, FINALIZER_FOREGROUND,
};
use keel_store::StoreError;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    patch::{self, PatchType},
    AppError, AppRef, AppResult, AppService, Check,
};

fn default_true() -> bool { true }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub app: Application,
    #[serde(default)]
    pub upsert: bool,
    /// Check repos and destinations against the project.
    #[serde(default = "default_true")]
    pub validate: bool,
}

impl CreateRequest {
    pub fn new(app: Application) -> Self { Self { app, upsert: false, validate: true } }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub app: AppRef,
    /// `None` means cascade.
    #[serde(default)]
    pub cascade: Option<bool>,
    #[serde(default)]
    pub propagation_policy: Option<String>,
}

/// Finalizer to set (or `None` to clear) for a delete request.
pub fn deletion_finalizer(cascade: Option<bool>, policy: Option<&str>) -> AppResult<Option<&'static str>> {
    let policy = policy.filter(|p| !p.is_empty());
    if cascade == Some(false) {
        if policy.is_some() {
            return Err(AppError::InvalidArgument("cannot set propagation policy when cascading is disabled".into()));
        }
        return Ok(None);
    }
    match policy.map(str::to_ascii_lowercase).as_deref() {
        None | Some("foreground") => Ok(Some(FINALIZER_FOREGROUND)),
        Some("background") => Ok(Some(FINALIZER_BACKGROUND)),
        Some(_) => Err(AppError::InvalidArgument(format!("invalid propagation policy: {}", policy.unwrap_or_default()))),
    }
}

fn normalize(app: &mut Application, control_ns: &str) {
    if app.metadata.namespace.is_empty() {
        app.metadata.namespace = control_ns.to_string();
    }
    if app.spec.project.is_empty() {
        app.spec.project = DEFAULT_PROJECT.to_string();
    }
}

/// Same desired state as far as a create is concerned.
fn same_desired(a: &Application, b: &Application) -> bool {
    a.spec == b.spec && a.metadata.labels == b.metadata.labels && a.metadata.annotations == b.metadata.annotations && a.metadata.finalizers == b.metadata.finalizers
}

impl AppService {
    /// Check `app` against its project.
    pub async fn validate_app(&self, app: &Application, full: bool) -> AppResult<()> {
        if app.source_count() == 0 {
            return Err(AppError::InvalidArgument("application spec must have a source or sources".into()));
        }
        let name = app.project();
        let project = self
            .projects
            .get(name)
            .await?
            .ok_or_else(|| AppError::InvalidArgument(format!("application references project {name} which does not exist")))?;
        if !self.authz.project_admits(&project, app.namespace()) {
            return Err(AppError::InvalidArgument(format!(
                "application '{}' in namespace '{}' is not permitted to use project '{name}'",
                app.name(),
                app.namespace()
            )));
        }
        if !full {
            return Ok(());
        }
        if let Some(url) = app.repo_urls().find(|u| !project.permits_repo(u)) {
            return Err(AppError::InvalidArgument(format!("application repo {url} is not permitted in project '{name}'")));
        }
        let dest = &app.spec.destination;
        if !project.permits_destination(dest) {
            let target = if dest.server.is_empty() { &dest.name } else { &dest.server };
            return Err(AppError::InvalidArgument(format!(
                "application destination {target} {} is not permitted in project '{name}'",
                dest.namespace
            )));
        }
        Ok(())
    }

    pub async fn create(&self, claims: &Claims, req: CreateRequest) -> AppResult<Application> {
        let t0 = Instant::now();
        let mut app = req.app;
        app.operation = None;
        normalize(&mut app, &self.cfg.namespace);
        if !self.authz.permitted(claims, Check::Action("create"), app.project(), app.namespace(), app.name()) {
            return Err(self.authz.denied(Check::Action("create"), &app.key()));
        }
        if !self.cfg.namespace_enabled(app.namespace()) {
            return Err(AppError::InvalidArgument(format!("namespace '{}' is not permitted", app.namespace())));
        }
        let key = app.key();
        let _guard = self.locks.lock(&key).await;
        self.validate_app(&app, req.validate).await?;
        app.metadata.resource_version.clear();
        app.status = Default::default();

        let existing = match self.store.create(app.clone()).await {
            Ok(created) => {
                self.emit(claims, &created, REASON_CREATED, "created application").await;
                info!(app = %key, took_ms = %t0.elapsed().as_millis(), "api: create ok");
                return Ok(created);
            }
            Err(StoreError::AlreadyExists(_)) => self.store.get(&key).await?,
            Err(e) => return Err(e.into()),
        };
        if same_desired(&existing, &app) {
            debug!(app = %key, "api: create found identical app");
            return Ok(existing);
        }
        if !req.upsert {
            return Err(AppError::InvalidArgument("existing application spec is different, use upsert flag to force update".into()));
        }
        self.authz.require(claims, Check::Action("update"), &existing)?;
        // Moving projects also needs update under the new project; create was checked above.
        if existing.project() != app.project() && !self.authz.permitted(claims, Check::Action("update"), app.project(), app.namespace(), app.name()) {
            return Err(self.authz.denied(Check::Action("update"), &key));
        }
        let updated = self.write_desired(&app).await?;
        self.emit(claims, &updated, REASON_UPDATED, "updated application").await;
        info!(app = %key, took_ms = %t0.elapsed().as_millis(), "api: create (upsert) ok");
        Ok(updated)
    }

    /// Fetch one Application, optionally forcing a reconciler refresh first.
    pub async fn get(&self, claims: &Claims, r: &AppRef, refresh: Option<RefreshType>) -> AppResult<Application> {
        let app = self.authz.resolve(claims, r, Check::Action("get")).await?;
        let mut app = match refresh {
            None => app,
            Some(kind) => {
                if kind == RefreshType::Hard {
                    let sources = app.sources();
                    try_join_all(sources.iter().map(|s| self.repo.app_details(s, true)))
                        .await
                        .map_err(|e| AppError::Unavailable(format!("unable to refresh app details: {e:#}")))?;
                }
                self.accessor.refresh(&app.key(), kind).await?
            }
        };
        self.fill_resource_health(&mut app).await;
        Ok(app)
    }

    /// Resource health kept in the cached tree; a cache miss leaves it unset.
    async fn fill_resource_health(&self, app: &mut Application) {
        if !app.health_in_tree() {
            return;
        }
        match self.cache.resource_tree(&app.key()).await {
            Ok(tree) => app.infer_resource_health(&tree),
            Err(e) => debug!(app = %app.key(), error = %e, "api: resource health unavailable"),
        }
    }

    /// Replace spec, labels, annotations and finalizers on the stored object,
    /// re-reading on version conflicts.
    async fn write_desired(&self, next: &Application) -> AppResult<Application> {
        let key = next.key();
        for attempt in 0..=self.cfg.conflict_retries {
            let mut cur = self.store.get(&key).await?;
            cur.spec = next.spec.clone();
            cur.metadata.labels = next.metadata.labels.clone();
            cur.metadata.annotations = next.metadata.annotations.clone();
            cur.metadata.finalizers = next.metadata.finalizers.clone();
            match self.store.update(cur).await {
                Ok(a) => return Ok(a),
                Err(e) if e.is_conflict() => {
                    counter!("operation_conflicts_total", 1u64, "op" => "update");
                    debug!(app = %key, attempt, "api: update conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Conflict(format!("unable to update {key} after {} attempts", self.cfg.conflict_retries + 1)))
    }

    /// Shared tail of update, update_spec and patch.
    async fn update_resolved(&self, claims: &Claims, current: &Application, mut next: Application, validate: bool) -> AppResult<Application> {
        next.metadata.name = current.metadata.name.clone();
        next.metadata.namespace = current.metadata.namespace.clone();
        normalize(&mut next, &self.cfg.namespace);
        if next.project() != current.project() {
            let (p, ns, name) = (next.project(), next.namespace(), next.name());
            for action in ["update", "create"] {
                if !self.authz.permitted(claims, Check::Action(action), p, ns, name) {
                    return Err(self.authz.denied(Check::Action(action), &next.key()));
                }
            }
        }
        self.validate_app(&next, validate).await?;
        let _guard = self.locks.lock(&next.key()).await;
        let updated = self.write_desired(&next).await?;
        self.emit(claims, &updated, REASON_UPDATED, "updated application").await;
        Ok(updated)
    }

    pub async fn update(&self, claims: &Claims, app: Application, validate: bool) -> AppResult<Application> {
        let t0 = Instant::now();
        let r = AppRef::new(app.name()).in_namespace(app.namespace());
        let current = self.authz.resolve(claims, &r, Check::Action("update")).await?;
        let updated = self.update_resolved(claims, &current, app, validate).await?;
        info!(app = %updated.key(), took_ms = %t0.elapsed().as_millis(), "api: update ok");
        Ok(updated)
    }

    pub async fn update_spec(&self, claims: &Claims, r: &AppRef, spec: AppSpec, validate: bool) -> AppResult<AppSpec> {
        let current = self.authz.resolve(claims, r, Check::Action("update")).await?;
        let mut next = current.clone();
        next.spec = spec;
        Ok(self.update_resolved(claims, &current, next, validate).await?.spec)
    }

    /// Apply a `json` (default) or `merge` patch to the non-status part of an Application.
    pub async fn patch(&self, claims: &Claims, r: &AppRef, body: &str, patch_type: &str) -> AppResult<Application> {
        let current = self.authz.resolve(claims, r, Check::Action("get")).await?;
        self.authz.require(claims, Check::Action("update"), &current)?;
        let kind = PatchType::parse(patch_type)?;
        let doc = serde_json::to_value(&current)?;
        let patched = patch::apply(kind, &doc, body)?;
        let next: Application =
            serde_json::from_value(patched).map_err(|e| AppError::InvalidArgument(format!("patched application is invalid: {e}")))?;
        self.update_resolved(claims, &current, next, true).await
    }

    pub async fn delete(&self, claims: &Claims, req: DeleteRequest) -> AppResult<()> {
        let t0 = Instant::now();
        let app = self.authz.resolve(claims, &req.app, Check::Action("get")).await?;
        self.authz.require(claims, Check::Action("delete"), &app)?;
        let finalizer = deletion_finalizer(req.cascade, req.propagation_policy.as_deref())?;
        let key = app.key();
        let _guard = self.locks.lock(&key).await;

        let mut cur = self.store.get(&key).await?;
        let before = cur.metadata.finalizers.clone();
        match finalizer {
            Some(f) => cur.set_cascaded_deletion(f),
            None => cur.unset_cascaded_deletion(),
        }
        if cur.metadata.finalizers != before {
            self.store.update(cur).await?;
        }
        self.store.delete(&key).await?;
        self.emit(claims, &app, REASON_DELETED, "deleted application").await;
        info!(app = %key, cascade = finalizer.is_some(), took_ms = %t0.elapsed().as_millis(), "api: delete ok");
        Ok(())
    }
}
