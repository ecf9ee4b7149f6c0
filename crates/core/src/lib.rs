//! Keel core types: the Application/AppProject model, qualified names, label
//! selectors, glob matching and the ports through which the API layer talks
//! to external collaborators (repo backend, live cluster, audit sink).

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod app;
pub mod glob;
pub mod ports;
pub mod project;
pub mod selector;
pub mod tree;

pub use app::*;
pub use project::{AppProject, ProjectDestination, ProjectSpec, SyncWindow, WindowError, WindowState, WINDOW_ALLOW, WINDOW_DENY};
pub use selector::{Selector, SelectorError};
pub use tree::{ResourceDiff, ResourceNode, ResourceRef, ResourceTree};

pub const APP_GROUP: &str = "argoproj.io";
pub const APP_VERSION: &str = "v1alpha1";
pub const APP_KIND: &str = "Application";
pub const PROJECT_KIND: &str = "AppProject";
/// RBAC resource type and CRD plural for Applications.
pub const APP_RESOURCE: &str = "applications";
pub const DEFAULT_PROJECT: &str = "default";

/// Marker annotation consumed (and cleared) by the reconciler.
pub const ANNOTATION_REFRESH: &str = "argocd.argoproj.io/refresh";
pub const FINALIZER_FOREGROUND: &str = "resources-finalizer.argocd.argoproj.io";
pub const FINALIZER_BACKGROUND: &str = "resources-finalizer.argocd.argoproj.io/background";

/// Identity of an Application inside the object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

/// Parse `ns/name` or a bare `name`. A bare name takes `explicit_ns` when it
/// is non-empty, else the control namespace.
pub fn parse_qualified(name: &str, explicit_ns: Option<&str>, control_ns: &str) -> ObjectKey {
    if let Some((ns, n)) = name.split_once('/') {
        return ObjectKey::new(ns, n);
    }
    let ns = explicit_ns.filter(|s| !s.is_empty()).unwrap_or(control_ns);
    ObjectKey::new(ns, name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshType {
    Normal,
    Hard,
}

impl RefreshType {
    pub fn as_str(&self) -> &'static str {
        match self { RefreshType::Normal => "normal", RefreshType::Hard => "hard" }
    }
}

impl std::str::FromStr for RefreshType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" | "" => Ok(RefreshType::Normal),
            "hard" => Ok(RefreshType::Hard),
            other => Err(format!("unknown refresh type '{other}'")),
        }
    }
}

/// Principal claims as presented by the authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub subject: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Claims {
    pub fn anonymous() -> Self { Self::default() }
    pub fn user(subject: impl Into<String>) -> Self { Self { subject: Some(subject.into()), groups: Vec::new() } }
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Name used in audit messages.
    pub fn username(&self) -> &str {
        self.subject.as_deref().filter(|s| !s.is_empty()).unwrap_or("Unknown user")
    }
}
