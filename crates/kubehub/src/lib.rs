//! Keel kubehub: Kubernetes-backed ports.
//!
//! Applications and AppProjects are read and written as `DynamicObject`s and
//! converted to the typed model through `serde_json`. Live resources owned by
//! an Application are located with kube Discovery; audit records become
//! core/v1 Events on the Application.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use keel_core::{AppProject, Application, ObjectKey, APP_GROUP, APP_KIND, APP_RESOURCE, APP_VERSION, PROJECT_KIND};
use keel_store::StoreError;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{de::DeserializeOwned, Serialize};

mod events;
mod live;
mod store;

pub use events::KubeEventRecorder;
pub use live::KubeLiveResources;
pub use store::{KubeAppStore, KubeProjects};

pub fn app_resource() -> ApiResource { ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(APP_GROUP, APP_VERSION, APP_KIND), APP_RESOURCE) }

pub fn project_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(APP_GROUP, APP_VERSION, PROJECT_KIND), "appprojects")
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Decode a custom resource into its typed model.
pub fn from_dynamic<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    serde_json::from_value(raw).context("decoding custom resource")
}

/// Encode a typed model as a `DynamicObject` of resource `ar`.
pub fn to_dynamic<T: Serialize>(model: &T, ar: &ApiResource) -> Result<DynamicObject> {
    let mut raw = serde_json::to_value(model).context("serializing model")?;
    let obj = raw.as_object_mut().ok_or_else(|| anyhow!("model did not serialize to an object"))?;
    obj.insert("apiVersion".into(), ar.api_version.clone().into());
    obj.insert("kind".into(), ar.kind.clone().into());
    serde_json::from_value(raw).context("building DynamicObject")
}

pub fn app_from_dynamic(obj: &DynamicObject) -> Result<Application> { from_dynamic(obj) }

pub fn project_from_dynamic(obj: &DynamicObject) -> Result<AppProject> { from_dynamic(obj) }

/// Map an API server error onto the store taxonomy.
pub(crate) fn store_error(key: &ObjectKey, e: kube::Error) -> StoreError {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(key.clone()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists(key.clone()),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(key.clone(), ae.message.clone()),
        _ => StoreError::Backend(e.to_string()),
    }
}
