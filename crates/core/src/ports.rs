//! Ports to collaborators that live outside the API layer.
//!
//! The repo backend renders and resolves revisions, live resources mutate
//! cluster objects owned by an Application, and the audit sink records who
//! did what. Implementations return `anyhow` errors; the API layer maps them.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppSource, Application, ObjectKey, ResourceRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionResolution {
    pub revision: String,
    /// Human-readable form, e.g. `HEAD (3b2c…)` or `0.7.* (0.7.2)`.
    pub display: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDetails {
    pub source_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionMetadata {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub message: String,
}

#[async_trait]
pub trait RepoBackend: Send + Sync {
    async fn resolve_revision(&self, source: &AppSource, ambiguous: &str) -> Result<RevisionResolution>;
    async fn app_details(&self, source: &AppSource, no_cache: bool) -> Result<AppDetails>;
    async fn generate_manifests(&self, source: &AppSource, revision: &str) -> Result<Vec<String>>;
    async fn revision_metadata(&self, repo_url: &str, revision: &str) -> Result<RevisionMetadata>;
}

/// Offline backend: revisions are pinned verbatim and nothing is rendered.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiteralRepo;

#[async_trait]
impl RepoBackend for LiteralRepo {
    async fn resolve_revision(&self, _source: &AppSource, ambiguous: &str) -> Result<RevisionResolution> {
        Ok(RevisionResolution { revision: ambiguous.to_string(), display: ambiguous.to_string() })
    }
    async fn app_details(&self, source: &AppSource, _no_cache: bool) -> Result<AppDetails> {
        let source_type = if source.is_helm() { "Helm" } else { "Directory" };
        Ok(AppDetails { source_type: source_type.into(), description: String::new() })
    }
    async fn generate_manifests(&self, _source: &AppSource, _revision: &str) -> Result<Vec<String>> { Ok(Vec::new()) }
    async fn revision_metadata(&self, _repo_url: &str, revision: &str) -> Result<RevisionMetadata> {
        Ok(RevisionMetadata { message: revision.to_string(), ..Default::default() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    Json,
    Merge,
    Strategic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub force: bool,
    pub orphan: bool,
}

/// Mutations on cluster objects that an Application manages.
#[async_trait]
pub trait LiveResources: Send + Sync {
    async fn get(&self, app: &Application, res: &ResourceRef) -> Result<Option<serde_json::Value>>;
    async fn patch(&self, app: &Application, res: &ResourceRef, patch: &str, kind: PatchKind) -> Result<serde_json::Value>;
    async fn delete(&self, app: &Application, res: &ResourceRef, opts: DeleteOptions) -> Result<()>;
    async fn run_action(&self, app: &Application, res: &ResourceRef, action: &str) -> Result<()>;
}

pub const REASON_CREATED: &str = "ResourceCreated";
pub const REASON_UPDATED: &str = "ResourceUpdated";
pub const REASON_DELETED: &str = "ResourceDeleted";
pub const REASON_OPERATION_STARTED: &str = "OperationStarted";
pub const REASON_ACTION_RAN: &str = "ResourceActionRan";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub app: ObjectKey,
    pub project: String,
    pub reason: String,
    /// Full message including the acting user, e.g. `alice initiated sync to HEAD (abc)`.
    pub message: String,
    pub user: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}
