//! Authorization filter: the one place that turns a requested Application
//! identity into either the Application or a denial.
//!
//! Without a project hint, an absent object, an object hidden by namespace
//! rules and an object the principal may not touch all produce the same
//! [`AppError::PermissionDenied`]. With a project hint, a genuinely absent
//! object may surface as NotFound.

use std::sync::Arc;

use keel_core::{parse_qualified, AppProject, Application, Claims, ObjectKey, ResourceRef, APP_RESOURCE};
use keel_rbac::{ClaimsEnforcer, Decision, Enforcer};
use keel_store::{ObjectStore, ProjectStore};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{AppError, AppResult, ServerConfig};

/// Identity of an Application as named by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRef {
    /// `name` or `namespace/name`.
    pub name: String,
    #[serde(default)]
    pub app_namespace: Option<String>,
    /// Expected project; switches absent objects from PermissionDenied to NotFound.
    #[serde(default)]
    pub project: Option<String>,
}

impl AppRef {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), ..Default::default() } }
    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self { self.app_namespace = Some(ns.into()); self }
    pub fn in_project(mut self, project: impl Into<String>) -> Self { self.project = Some(project.into()); self }

    pub fn of(app: &Application) -> Self { Self::new(app.name()).in_namespace(app.namespace()) }
}

/// What the caller wants to do with the Application.
#[derive(Debug, Clone, Copy)]
pub enum Check<'a> {
    /// Plain action such as `get`, `sync` or `action/apps/Deployment/restart`.
    Action(&'a str),
    /// Verb on a live object owned by the Application.
    Resource { verb: &'a str, resource: &'a ResourceRef },
}

impl Check<'_> {
    fn label(&self) -> &str {
        match self { Check::Action(a) => a, Check::Resource { verb, .. } => verb }
    }
}

/// RBAC object for an Application: `project/name` in the control
/// namespace, `project/namespace/name` elsewhere.
pub fn rbac_name(control_ns: &str, project: &str, namespace: &str, name: &str) -> String {
    if namespace.is_empty() || namespace == control_ns { format!("{project}/{name}") } else { format!("{project}/{namespace}/{name}") }
}

#[derive(Clone)]
pub struct AuthzFilter {
    cfg: Arc<ServerConfig>,
    store: Arc<dyn ObjectStore>,
    projects: Arc<dyn ProjectStore>,
    enforcer: Arc<Enforcer>,
}

impl AuthzFilter {
    pub fn new(cfg: Arc<ServerConfig>, store: Arc<dyn ObjectStore>, projects: Arc<dyn ProjectStore>, enforcer: Arc<Enforcer>) -> Self {
        Self { cfg, store, projects, enforcer }
    }

    pub fn enforcer(&self) -> &Enforcer { &self.enforcer }

    fn combine(&self, fine: Decision, coarse: impl FnOnce() -> Decision) -> bool {
        if self.cfg.disable_fine_grained_inheritance {
            return fine.allowed();
        }
        match (fine, coarse()) {
            (Decision::Deny, _) | (_, Decision::Deny) => false,
            (Decision::Allow, _) | (_, Decision::Allow) => true,
            _ => false,
        }
    }

    /// Policy decision for `check` on the Application `project`/`namespace`/`name`.
    pub fn permitted(&self, claims: &Claims, check: Check<'_>, project: &str, namespace: &str, name: &str) -> bool {
        let obj = rbac_name(&self.cfg.namespace, project, namespace, name);
        match check {
            Check::Action(action) => self.enforcer.enforce(claims, APP_RESOURCE, action, &obj),
            Check::Resource { verb, resource } => {
                let fine = self.enforcer.decide(claims, APP_RESOURCE, &resource.fine_grained_action(verb), &obj);
                self.combine(fine, || self.enforcer.decide(claims, APP_RESOURCE, verb, &obj))
            }
        }
    }

    /// Same as [`permitted`](Self::permitted) against a prepared enforcer.
    pub fn permitted_with(&self, prepared: &ClaimsEnforcer, check: Check<'_>, app: &Application) -> bool {
        let obj = rbac_name(&self.cfg.namespace, app.project(), app.namespace(), app.name());
        match check {
            Check::Action(action) => prepared.enforce(APP_RESOURCE, action, &obj),
            Check::Resource { verb, resource } => {
                let fine = prepared.decide(APP_RESOURCE, &resource.fine_grained_action(verb), &obj);
                self.combine(fine, || prepared.decide(APP_RESOURCE, verb, &obj))
            }
        }
    }

    /// Deny unless `check` holds on `app` as it stands.
    pub fn require(&self, claims: &Claims, check: Check<'_>, app: &Application) -> AppResult<()> {
        if self.permitted(claims, check, app.project(), app.namespace(), app.name()) {
            return Ok(());
        }
        Err(self.denied(check, &app.key()))
    }

    pub(crate) fn denied(&self, check: Check<'_>, key: &ObjectKey) -> AppError {
        counter!("authz_denied_total", 1u64, "action" => check.label().to_string());
        warn!(action = %check.label(), app = %key, "api: permission denied");
        AppError::PermissionDenied
    }

    /// Whether `project` admits Applications living in `ns`.
    pub fn project_admits(&self, project: &AppProject, ns: &str) -> bool { project.permits_namespace(ns, &self.cfg.namespace) }

    /// Namespace-eligibility plus project admission, with projects pre-loaded.
    pub fn eligible(&self, projects: &FxHashMap<String, AppProject>, app: &Application) -> bool {
        self.cfg.namespace_enabled(app.namespace()) && projects.get(app.project()).map(|p| self.project_admits(p, app.namespace())).unwrap_or(false)
    }

    async fn lookup(&self, key: &ObjectKey) -> Option<Application> {
        if !self.cfg.namespace_enabled(&key.namespace) {
            return None;
        }
        let app = match self.store.get(key).await {
            Ok(a) => a,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                warn!(app = %key, error = %e, "api: lookup failed");
                return None;
            }
        };
        let project = match self.projects.get(app.project()).await {
            Ok(Some(p)) => p,
            Ok(None) => return None,
            Err(e) => {
                warn!(app = %key, project = %app.project(), error = %e, "api: project lookup failed");
                return None;
            }
        };
        if !self.project_admits(&project, &key.namespace) {
            return None;
        }
        Some(app)
    }

    /// Turn a caller-supplied identity into the Application, or a denial
    /// that does not reveal whether it exists.
    pub async fn resolve(&self, claims: &Claims, r: &AppRef, check: Check<'_>) -> AppResult<Application> {
        let key = parse_qualified(&r.name, r.app_namespace.as_deref(), &self.cfg.namespace);
        let hint = r.project.as_deref().filter(|p| !p.is_empty());

        if let Some(p) = hint {
            if !self.permitted(claims, check, p, &key.namespace, &key.name) {
                return Err(self.denied(check, &key));
            }
        }
        let Some(app) = self.lookup(&key).await else {
            return Err(match hint {
                Some(_) => AppError::app_not_found(&key.name),
                None => self.denied(check, &key),
            });
        };
        if !self.permitted(claims, check, app.project(), &key.namespace, &key.name) {
            return Err(match hint {
                Some(_) => AppError::app_not_found(&key.name),
                None => self.denied(check, &key),
            });
        }
        if let Some(p) = hint {
            if p != app.project() {
                return Err(AppError::app_not_found(&key.name));
            }
        }
        Ok(app)
    }
}
