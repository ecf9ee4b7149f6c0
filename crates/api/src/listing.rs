//! Bulk listing and watch over the whole store snapshot.
//!
//! One prepared enforcer and one project map serve the entire scan, so the
//! cost per Application is a handful of glob matches.

use std::time::Instant;

use keel_core::{glob::Glob, AppProject, Application, Claims, Selector};
use keel_rbac::ClaimsEnforcer;
use keel_store::{WatchEvent, WatchKind};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};

use crate::{AppResult, AppService, AuthzFilter, CancelHandle, Check, ServerConfig, StreamHandle};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppQuery {
    /// Glob on the Application name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    /// Legacy spelling of `projects`, used only when `projects` is empty.
    #[serde(default)]
    pub project: Vec<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    /// Minimum version; non-numeric counts as 0.
    #[serde(default)]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub app_namespace: Option<String>,
}

/// Compare repository URLs ignoring case, a trailing slash and `.git`.
pub fn same_repo(a: &str, b: &str) -> bool {
    fn norm(s: &str) -> String {
        let s = s.trim().trim_end_matches('/').to_ascii_lowercase();
        s.strip_suffix(".git").map(str::to_string).unwrap_or(s)
    }
    norm(a) == norm(b)
}

/// A compiled [`AppQuery`].
#[derive(Debug, Clone)]
struct AppFilter {
    name: Option<Glob>,
    projects: Vec<String>,
    repo: Option<String>,
    selector: Selector,
    floor: u64,
    namespace: Option<String>,
}

impl AppFilter {
    fn compile(q: &AppQuery) -> AppResult<Self> {
        let selector = match q.selector.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => Selector::parse(s)?,
            None => Selector::everything(),
        };
        let projects = if !q.projects.is_empty() { q.projects.clone() } else { q.project.clone() };
        Ok(Self {
            name: q.name.as_deref().filter(|n| !n.is_empty()).map(Glob::new),
            projects,
            repo: q.repo.clone().filter(|r| !r.is_empty()),
            selector,
            floor: q.resource_version.as_deref().map(|v| v.trim().parse::<u64>().unwrap_or(0)).unwrap_or(0),
            namespace: q.app_namespace.clone().filter(|n| !n.is_empty()),
        })
    }

    /// Query predicates only; authorization is separate.
    fn matches(&self, app: &Application) -> bool {
        if let Some(ns) = &self.namespace {
            if app.namespace() != ns {
                return false;
            }
        }
        if let Some(g) = &self.name {
            if !g.matches(app.name()) {
                return false;
            }
        }
        if !self.projects.is_empty() && !self.projects.iter().any(|p| p == app.project()) {
            return false;
        }
        if let Some(repo) = &self.repo {
            if !app.repo_urls().any(|u| same_repo(u, repo)) {
                return false;
            }
        }
        app.version() >= self.floor && self.selector.matches(&app.metadata.labels)
    }
}

fn visible(authz: &AuthzFilter, prepared: &ClaimsEnforcer, projects: &FxHashMap<String, AppProject>, app: &Application) -> bool {
    authz.eligible(projects, app) && authz.permitted_with(prepared, Check::Action("get"), app)
}

fn by_name(a: &Application, b: &Application) -> std::cmp::Ordering { (a.name(), a.namespace()).cmp(&(b.name(), b.namespace())) }

fn namespace_open(cfg: &ServerConfig, q: &AppQuery) -> bool {
    q.app_namespace.as_deref().filter(|n| !n.is_empty()).map(|ns| cfg.namespace_enabled(ns)).unwrap_or(true)
}

impl AppService {
    async fn project_map(&self) -> AppResult<FxHashMap<String, AppProject>> {
        Ok(self.projects.list().await?.into_iter().map(|p| (p.metadata.name.clone(), p)).collect())
    }

    /// Applications matching `q` that `claims` may `get`.
    ///
    /// Sorted by name first and namespace second, so same-named apps in
    /// different namespaces stay adjacent and the output is stable.
    pub async fn list(&self, claims: &Claims, q: &AppQuery) -> AppResult<Vec<Application>> {
        let t0 = Instant::now();
        let filter = AppFilter::compile(q)?;
        if !namespace_open(&self.cfg, q) {
            return Ok(Vec::new());
        }
        let snapshot = self.store.list().await?;
        let projects = self.project_map().await?;
        let prepared = self.authz.enforcer().for_claims(claims);
        let mut out: Vec<Application> = snapshot
            .iter()
            .filter(|a| filter.matches(a) && visible(&self.authz, &prepared, &projects, a))
            .map(|a| (**a).clone())
            .collect();
        out.sort_by(by_name);
        let ms = t0.elapsed().as_secs_f64() * 1000.0;
        counter!("app_list_total", 1u64);
        histogram!("app_list_ms", ms);
        info!(scanned = snapshot.len(), returned = out.len(), rules = prepared.len(), took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(out)
    }

    /// Stream changes to Applications matching `q`. Without a version floor
    /// the currently visible set is sent first as `Added` events.
    pub async fn watch(&self, claims: &Claims, q: &AppQuery) -> AppResult<StreamHandle<WatchEvent>> {
        let filter = AppFilter::compile(q)?;
        let cap = std::env::var("KEEL_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048);
        let (tx, rx) = mpsc::channel::<WatchEvent>(cap.max(1));
        if !namespace_open(&self.cfg, q) {
            return Ok(StreamHandle { rx, cancel: CancelHandle { task: None } });
        }
        // Subscribe before the initial listing so nothing falls between them.
        let mut events = self.store.watch();
        let initial = if q.resource_version.is_none() { self.list(claims, q).await? } else { Vec::new() };
        let prepared = self.authz.enforcer().for_claims(claims);
        let projects = self.projects.clone();
        let authz = self.authz.clone();
        info!(initial = initial.len(), "api: watch start");

        let task = tokio::spawn(async move {
            let mut last: FxHashMap<keel_core::ObjectKey, u64> = FxHashMap::default();
            for app in initial {
                last.insert(app.key(), app.version());
                if tx.send(WatchEvent { kind: WatchKind::Added, app }).await.is_err() {
                    return;
                }
            }
            loop {
                let ev = match events.recv().await {
                    Ok(ev) => ev,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "api: watch lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if !filter.matches(&ev.app) && ev.kind != WatchKind::Deleted {
                    continue;
                }
                let project_map: FxHashMap<String, AppProject> = match projects.get(ev.app.project()).await {
                    Ok(Some(p)) => std::iter::once((p.metadata.name.clone(), p)).collect(),
                    _ => FxHashMap::default(),
                };
                if !visible(&authz, &prepared, &project_map, &ev.app) {
                    continue;
                }
                let key = ev.app.key();
                match ev.kind {
                    WatchKind::Deleted => {
                        if last.remove(&key).is_none() && !filter.matches(&ev.app) {
                            continue;
                        }
                    }
                    _ => {
                        let v = ev.app.version();
                        if last.get(&key).is_some_and(|seen| *seen >= v) {
                            debug!(app = %key, version = v, "api: watch duplicate skipped");
                            continue;
                        }
                        last.insert(key, v);
                    }
                }
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
            info!("api: watch ended");
        });
        Ok(StreamHandle { rx, cancel: CancelHandle { task: Some(task) } })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Meta;

    fn app(name: &str, project: &str, rv: &str) -> Application {
        let mut a = Application::default();
        a.metadata = Meta { name: name.into(), namespace: "argocd".into(), resource_version: rv.into(), ..Default::default() };
        a.spec.project = project.into();
        a
    }

    #[test]
    fn plural_projects_win_over_legacy() {
        let q = AppQuery { projects: vec!["a".into()], project: vec!["b".into()], ..Default::default() };
        let f = AppFilter::compile(&q).expect("compile");
        assert!(f.matches(&app("x", "a", "1")));
        assert!(!f.matches(&app("x", "b", "1")));
        let legacy = AppFilter::compile(&AppQuery { project: vec!["b".into()], ..Default::default() }).expect("compile");
        assert!(legacy.matches(&app("x", "b", "1")));
    }

    #[test]
    fn version_floor() {
        let f = AppFilter::compile(&AppQuery { resource_version: Some("5".into()), ..Default::default() }).expect("compile");
        assert!(f.matches(&app("x", "p", "5")));
        assert!(!f.matches(&app("x", "p", "4")));
        assert!(!f.matches(&app("x", "p", "junk")), "non-numeric versions count as 0");
        let junk = AppFilter::compile(&AppQuery { resource_version: Some("abc".into()), ..Default::default() }).expect("compile");
        assert!(junk.matches(&app("x", "p", "1")), "non-numeric floor counts as 0");
    }

    #[test]
    fn name_glob_and_repo() {
        let mut a = app("guestbook-prod", "p", "1");
        a.spec.source = Some(keel_core::AppSource { repo_url: "https://github.com/org/Repo.git".into(), ..Default::default() });
        let f = AppFilter::compile(&AppQuery { name: Some("guestbook-*".into()), repo: Some("https://github.com/org/repo/".into()), ..Default::default() })
            .expect("compile");
        assert!(f.matches(&a));
        assert!(!f.matches(&app("other", "p", "1")));
    }

    #[test]
    fn bad_selector_fails_compile() {
        let err = AppFilter::compile(&AppQuery { selector: Some("tier>web".into()), ..Default::default() }).expect_err("non-integer >");
        assert!(err.to_string().contains("error parsing the selector"), "{err}");
    }

    #[test]
    fn ordering_is_name_then_namespace() {
        let mut apps = vec![app("web", "p", "1"), app("api", "p", "1"), app("web", "p", "1")];
        apps[0].metadata.namespace = "team-b".into();
        apps[2].metadata.namespace = "team-a".into();
        apps.sort_by(by_name);
        let keys: Vec<_> = apps.iter().map(|a| (a.name(), a.namespace())).collect();
        assert_eq!(keys, [("api", "argocd"), ("web", "team-a"), ("web", "team-b")]);
    }
}
