//! Keel store: the object-store contract the API layer is written against,
//! an in-RAM implementation fed through a single writer, and per-key locks.
//!
//! Objects cross the store boundary by value. `get` hands out a private
//! copy; `list` hands out shared immutable snapshots for scanning.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{AppProject, Application, ObjectKey};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

mod keylock;
mod mem;

pub use keylock::{KeyGuard, KeyLock};
pub use mem::{MemProjects, MemStore, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("applications.argoproj.io {name:?} not found", name = .0.name)]
    NotFound(ObjectKey),
    #[error("applications.argoproj.io {name:?} already exists", name = .0.name)]
    AlreadyExists(ObjectKey),
    /// Version precondition failed.
    #[error("operation cannot be fulfilled on applications.argoproj.io {name:?}: {1}", name = .0.name)]
    Conflict(ObjectKey, String),
    #[error("store backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(..)) }
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self { StoreError::Backend(format!("{e:#}")) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub app: Application,
}

/// Authoritative Application storage with optimistic concurrency.
///
/// `update` and `update_status` compare `metadata.resourceVersion` against the
/// stored version (an empty token skips the check) and fail with
/// [`StoreError::Conflict`] on mismatch. `update` never writes `status`;
/// `update_status` writes nothing but `status`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Application, StoreError>;
    async fn list(&self) -> Result<Vec<Arc<Application>>, StoreError>;
    async fn create(&self, app: Application) -> Result<Application, StoreError>;
    async fn update(&self, app: Application) -> Result<Application, StoreError>;
    async fn update_status(&self, app: Application) -> Result<Application, StoreError>;
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;
    /// Subscribe to changes made after this call.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<AppProject>, StoreError>;
    async fn list(&self) -> Result<Vec<AppProject>, StoreError>;
}
