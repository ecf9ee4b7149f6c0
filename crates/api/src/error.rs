use keel_core::{SelectorError, WindowError};
use keel_rbac::PolicyError;
use keel_store::StoreError;
use serde::{Deserialize, Serialize};

use crate::cache::CacheError;

/// API errors suitable for transport over RPC later.
///
/// `PermissionDenied` carries no payload: its rendering must not depend on
/// whether the target exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum AppError {
    #[error("permission_denied: permission denied")]
    PermissionDenied,
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("invalid_argument: {0}")]
    InvalidArgument(String),
    #[error("failed_precondition: {0}")]
    FailedPrecondition(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("deadline_exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Stable machine-readable kind, the prefix of the rendered message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::PermissionDenied => "permission_denied",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidArgument(_) => "invalid_argument",
            AppError::FailedPrecondition(_) => "failed_precondition",
            AppError::Conflict(_) => "conflict",
            AppError::Unavailable(_) => "unavailable",
            AppError::DeadlineExceeded(_) => "deadline_exceeded",
            AppError::Internal(_) => "internal",
        }
    }

    pub(crate) fn app_not_found(name: &str) -> Self { AppError::NotFound(format!("applications.argoproj.io {name:?} not found")) }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(k) => AppError::app_not_found(&k.name),
            StoreError::AlreadyExists(_) => AppError::FailedPrecondition(e.to_string()),
            StoreError::Conflict(..) => AppError::Conflict(e.to_string()),
            StoreError::Backend(m) => AppError::Unavailable(m),
        }
    }
}

impl From<SelectorError> for AppError {
    fn from(e: SelectorError) -> Self { AppError::InvalidArgument(format!("error parsing the selector: {e}")) }
}

impl From<WindowError> for AppError {
    fn from(e: WindowError) -> Self { AppError::FailedPrecondition(format!("invalid sync window: {e}")) }
}

impl From<PolicyError> for AppError {
    fn from(e: PolicyError) -> Self { AppError::Internal(e.to_string()) }
}

impl From<CacheError> for AppError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Refresh(inner) => inner,
            CacheError::Comparison(m) => AppError::FailedPrecondition(m),
            other => AppError::Unavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self { AppError::Internal(format!("json: {e}")) }
}
