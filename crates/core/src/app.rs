//! Application custom resource model (`argoproj.io/v1alpha1`).
//!
//! Only the fields the API layer reads or writes are modeled. Field names
//! follow the CRD JSON so objects round-trip through `DynamicObject`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    tree::{ResourceRef, ResourceTree},
    ObjectKey, ANNOTATION_REFRESH, DEFAULT_PROJECT, FINALIZER_BACKGROUND, FINALIZER_FOREGROUND};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Version token assigned by the object store (decimal string).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub metadata: Meta,
    #[serde(default)]
    pub spec: AppSpec,
    #[serde(default)]
    pub status: AppStatus,
    /// Pending command consumed by the reconciler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    #[serde(default)]
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<AppSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<AppSource>,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_revision: String,
}

impl AppSource {
    pub fn is_helm(&self) -> bool { self.chart.is_some() }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<AutomatedSync>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedSync {
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub self_heal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(default)]
    pub sync: SyncStatus,
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_state: Option<OperationState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<RevisionHistory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<AppCondition>,
    /// `appTree` when per-resource health lives only in the cached tree.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_health_source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// A live object the reconciler reports as managed by the Application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
}

impl ResourceStatus {
    pub fn to_ref(&self) -> ResourceRef {
        ResourceRef {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

pub const CONDITION_COMPARISON_ERROR: &str = "ComparisonError";
pub const CONDITION_INVALID_SPEC: &str = "InvalidSpecError";
pub const HEALTH_SOURCE_APP_TREE: &str = "appTree";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCondition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionHistory {
    pub id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<AppSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<AppSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
}

impl RevisionHistory {
    pub fn is_multi_source(&self) -> bool { !self.sources.is_empty() }

    /// Sources recorded by the entry, single-source entries as a one-element list.
    pub fn recorded_sources(&self) -> Vec<AppSource> {
        if self.is_multi_source() { self.sources.clone() } else { self.source.iter().cloned().collect() }
    }

    /// Revision recorded for the source at `idx`.
    pub fn revision_at(&self, idx: usize) -> Option<&str> {
        if self.is_multi_source() { self.revisions.get(idx).map(String::as_str) } else if idx == 0 { Some(self.revision.as_str()) } else { None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncOperation>,
    #[serde(default)]
    pub initiated_by: InitiatedBy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub info: Vec<OperationInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatedBy {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default)]
    pub automated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    /// Resolved revisions for the sources at `source_positions` (zero-based).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_positions: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<AppSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<AppSource>,
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<SyncResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_strategy: Option<SyncStrategy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResource {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    Apply { #[serde(default)] force: bool },
    Hook { #[serde(default)] force: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationPhase {
    Running,
    Terminating,
    Succeeded,
    Failed,
    Error,
    Terminated,
}

impl OperationPhase {
    pub fn is_completed(&self) -> bool { !matches!(self, OperationPhase::Running | OperationPhase::Terminating) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    pub operation: Operation,
    pub phase: OperationPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Lifecycle stage derived from `operation` and `status.operationState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Pending,
    Running,
    Terminating,
    Terminal(OperationPhase),
}

impl Application {
    pub fn key(&self) -> ObjectKey { ObjectKey::new(self.metadata.namespace.clone(), self.metadata.name.clone()) }

    pub fn name(&self) -> &str { &self.metadata.name }

    pub fn namespace(&self) -> &str { &self.metadata.namespace }

    /// Project name with the empty value normalized to `default`.
    pub fn project(&self) -> &str {
        if self.spec.project.is_empty() { DEFAULT_PROJECT } else { &self.spec.project }
    }

    /// Numeric view of the version token; anything unparsable counts as 0.
    pub fn version(&self) -> u64 { self.metadata.resource_version.parse().unwrap_or(0) }

    pub fn is_multi_source(&self) -> bool { !self.spec.sources.is_empty() }

    /// Live sources, single-source specs as a one-element list.
    pub fn sources(&self) -> Vec<AppSource> {
        if self.is_multi_source() { self.spec.sources.clone() } else { self.spec.source.iter().cloned().collect() }
    }

    pub fn source_at(&self, idx: usize) -> Option<&AppSource> {
        if self.is_multi_source() { self.spec.sources.get(idx) } else if idx == 0 { self.spec.source.as_ref() } else { None }
    }

    pub fn source_count(&self) -> usize { if self.is_multi_source() { self.spec.sources.len() } else { usize::from(self.spec.source.is_some()) } }

    pub fn repo_urls(&self) -> impl Iterator<Item = &str> {
        self.spec.source.iter().chain(self.spec.sources.iter()).map(|s| s.repo_url.as_str())
    }

    pub fn automated_sync(&self) -> bool {
        self.spec.sync_policy.as_ref().map(|p| p.automated.is_some()).unwrap_or(false)
    }

    pub fn refresh_requested(&self) -> Option<&str> { self.metadata.annotations.get(ANNOTATION_REFRESH).map(String::as_str) }

    pub fn stage(&self) -> Stage {
        if self.operation.is_some() {
            return Stage::Pending;
        }
        match self.status.operation_state.as_ref().map(|s| s.phase) {
            None => Stage::Idle,
            Some(OperationPhase::Running) => Stage::Running,
            Some(OperationPhase::Terminating) => Stage::Terminating,
            Some(done) => Stage::Terminal(done),
        }
    }

    pub fn has_finalizer(&self, f: &str) -> bool { self.metadata.finalizers.iter().any(|x| x == f) }

    /// Whether either cascaded-deletion finalizer is present.
    pub fn cascaded_deletion(&self) -> bool {
        self.has_finalizer(FINALIZER_FOREGROUND) || self.has_finalizer(FINALIZER_BACKGROUND)
    }

    /// Replace any cascaded-deletion finalizer with `f`.
    pub fn set_cascaded_deletion(&mut self, f: &str) {
        self.unset_cascaded_deletion();
        self.metadata.finalizers.push(f.to_string());
    }

    pub fn unset_cascaded_deletion(&mut self) {
        self.metadata.finalizers.retain(|x| x != FINALIZER_FOREGROUND && x != FINALIZER_BACKGROUND);
    }

    /// Conditions that keep the reconciler from computing state: a refresh would not help.
    pub fn comparison_errors(&self) -> Vec<&AppCondition> {
        self.status.conditions.iter().filter(|c| c.kind == CONDITION_COMPARISON_ERROR || c.kind == CONDITION_INVALID_SPEC).collect()
    }

    pub fn health_in_tree(&self) -> bool { self.status.resource_health_source == HEALTH_SOURCE_APP_TREE }

    /// Copy node health from `tree` onto matching `status.resources` entries.
    pub fn infer_resource_health(&mut self, tree: &ResourceTree) {
        for res in &mut self.status.resources {
            let node = tree.nodes.iter().find(|n| {
                let r = &n.resource;
                r.group == res.group && r.kind == res.kind && r.namespace == res.namespace && r.name == res.name
            });
            if let Some(health) = node.and_then(|n| n.health.clone()) {
                res.health = Some(health);
            }
        }
    }

    /// Locate a managed resource in `status.resources`.
    pub fn find_resource(&self, r: &ResourceRef) -> Option<&ResourceStatus> {
        self.status.resources.iter().find(|s| s.group == r.group && s.kind == r.kind && s.namespace == r.namespace && s.name == r.name)
    }
}
