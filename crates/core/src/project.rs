//! AppProject custom resource model and its permission checks.

use chrono::{DateTime, Duration, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};

use crate::{
    glob::{glob_match, match_any},
    Application, Destination, Meta,
};

pub const WINDOW_ALLOW: &str = "allow";
pub const WINDOW_DENY: &str = "deny";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("cannot parse schedule '{0}': {1}")]
    Schedule(String, String),
    #[error("cannot parse duration '{0}': {1}")]
    Duration(String, String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProject {
    pub metadata: Meta,
    #[serde(default)]
    pub spec: ProjectSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_repos: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<ProjectDestination>,
    /// Namespaces outside the control namespace whose Applications may use this project.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_windows: Vec<SyncWindow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDestination {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Time-boxed allow/deny rule: open for `duration` after each `schedule` (cron, UTC) tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWindow {
    pub kind: String,
    pub schedule: String,
    pub duration: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub manual_sync: bool,
}

impl SyncWindow {
    /// Whether this window targets `app` by name, destination cluster or destination namespace.
    pub fn matches(&self, app: &Application) -> bool {
        let dest = &app.spec.destination;
        match_any(&self.applications, app.name())
            || (!dest.server.is_empty() && match_any(&self.clusters, &dest.server))
            || (!dest.name.is_empty() && match_any(&self.clusters, &dest.name))
            || match_any(&self.namespaces, &dest.namespace)
    }

    pub fn is_deny(&self) -> bool { self.kind == WINDOW_DENY }

    /// Open at `now`: some schedule tick falls within the last `duration`.
    pub fn active_at(&self, now: DateTime<Utc>) -> Result<bool, WindowError> {
        let cron = Cron::new(&self.schedule).parse().map_err(|e| WindowError::Schedule(self.schedule.clone(), e.to_string()))?;
        let len = humantime::parse_duration(&self.duration).map_err(|e| WindowError::Duration(self.duration.clone(), e.to_string()))?;
        let len = Duration::from_std(len).map_err(|e| WindowError::Duration(self.duration.clone(), e.to_string()))?;
        let next = cron.find_next_occurrence(&(now - len), false).map_err(|e| WindowError::Schedule(self.schedule.clone(), e.to_string()))?;
        Ok(next < now)
    }
}

/// Sync windows of a project that apply to one Application, evaluated at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowState {
    pub assigned_windows: Vec<SyncWindow>,
    pub active_windows: Vec<SyncWindow>,
    pub can_sync: bool,
}

impl WindowState {
    pub fn evaluate(windows: &[SyncWindow], app: &Application, manual: bool, now: DateTime<Utc>) -> Result<Self, WindowError> {
        let assigned: Vec<SyncWindow> = windows.iter().filter(|w| w.matches(app)).cloned().collect();
        let mut active = Vec::new();
        let mut inactive_allows = Vec::new();
        for w in &assigned {
            if w.active_at(now)? {
                active.push(w.clone());
            } else if !w.is_deny() {
                inactive_allows.push(w);
            }
        }
        let can_sync = can_sync(&assigned, &active, &inactive_allows, manual);
        Ok(Self { assigned_windows: assigned, active_windows: active, can_sync })
    }
}

fn can_sync(assigned: &[SyncWindow], active: &[SyncWindow], inactive_allows: &[&SyncWindow], manual: bool) -> bool {
    if assigned.is_empty() {
        return true;
    }
    let denies: Vec<_> = active.iter().filter(|w| w.is_deny()).collect();
    if !denies.is_empty() {
        // Every active deny has to let manual syncs through.
        return manual && denies.iter().all(|w| w.manual_sync);
    }
    if active.iter().any(|w| !w.is_deny()) {
        return true;
    }
    if !inactive_allows.is_empty() {
        return manual && inactive_allows.iter().any(|w| w.manual_sync);
    }
    true
}

impl AppProject {
    pub fn new(name: impl Into<String>) -> Self {
        Self { metadata: Meta { name: name.into(), ..Default::default() }, spec: ProjectSpec::default() }
    }

    pub fn name(&self) -> &str { &self.metadata.name }

    /// Applications in the control namespace are always eligible; others need a
    /// matching `sourceNamespaces` entry.
    pub fn permits_namespace(&self, namespace: &str, control_ns: &str) -> bool {
        namespace == control_ns || match_any(&self.spec.source_namespaces, namespace)
    }

    pub fn permits_repo(&self, repo_url: &str) -> bool { match_any(&self.spec.source_repos, repo_url) }

    pub fn permits_destination(&self, dest: &Destination) -> bool {
        self.spec.destinations.iter().any(|d| {
            let target = if dest.server.is_empty() { (&d.name, &dest.name) } else { (&d.server, &dest.server) };
            glob_match(target.0, target.1) && glob_match(&d.namespace, &dest.namespace)
        })
    }
}
