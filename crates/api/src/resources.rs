//! Entry points on live objects owned by an Application, plus the cached
//! computed-state reads (resource tree, managed resources, manifests).

use anyhow::bail;
use async_trait::async_trait;
use keel_core::{
    ports::{DeleteOptions, LiveResources, PatchKind, REASON_ACTION_RAN, REASON_DELETED, REASON_UPDATED},
    Application, Claims, ResourceDiff, ResourceRef, ResourceTree,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{rbac_name, AppError, AppRef, AppResult, AppService, Check};

/// Live-resource port for deployments without cluster access.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLive;

#[async_trait]
impl LiveResources for DetachedLive {
    async fn get(&self, _app: &Application, res: &ResourceRef) -> anyhow::Result<Option<Value>> {
        bail!("no cluster access configured to read {}/{}", res.kind, res.name)
    }
    async fn patch(&self, _app: &Application, res: &ResourceRef, _patch: &str, _kind: PatchKind) -> anyhow::Result<Value> {
        bail!("no cluster access configured to patch {}/{}", res.kind, res.name)
    }
    async fn delete(&self, _app: &Application, res: &ResourceRef, _opts: DeleteOptions) -> anyhow::Result<()> {
        bail!("no cluster access configured to delete {}/{}", res.kind, res.name)
    }
    async fn run_action(&self, _app: &Application, res: &ResourceRef, action: &str) -> anyhow::Result<()> {
        bail!("no cluster access configured to run {action} on {}/{}", res.kind, res.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub app: AppRef,
    pub resource: ResourceRef,
}

/// Which pods to stream logs from. Empty selects every pod of the app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    pub app: AppRef,
    #[serde(default)]
    pub pod_name: Option<String>,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub resource_name: String,
}

impl LogQuery {
    fn selects(&self, r: &ResourceRef) -> bool {
        if let Some(pod) = self.pod_name.as_deref().filter(|p| !p.is_empty()) {
            return r.group.is_empty() && r.kind == "Pod" && r.name == pod;
        }
        if self.kind.is_empty() && self.resource_name.is_empty() {
            return true;
        }
        (self.group.is_empty() || r.group == self.group)
            && (self.kind.is_empty() || r.kind == self.kind)
            && (self.resource_name.is_empty() || r.name == self.resource_name)
    }
}

fn unavailable(what: &str) -> impl Fn(anyhow::Error) -> AppError + '_ { move |e| AppError::Unavailable(format!("{what}: {e:#}")) }

/// The managed resource as recorded in status, or an InvalidArgument.
fn member(app: &Application, res: &ResourceRef) -> AppResult<ResourceRef> {
    app.find_resource(res).map(|s| s.to_ref()).ok_or_else(|| {
        AppError::InvalidArgument(format!("{} {} {} not found as part of application {}", res.kind, res.group, res.name, app.name()))
    })
}

impl AppService {
    pub async fn get_resource(&self, claims: &Claims, req: &ResourceRequest) -> AppResult<Value> {
        let app = self.authz.resolve(claims, &req.app, Check::Action("get")).await?;
        let res = member(&app, &req.resource)?;
        self.live
            .get(&app, &res)
            .await
            .map_err(unavailable("unable to read resource"))?
            .ok_or_else(|| AppError::NotFound(format!("{} {:?} not found", res.kind, res.name)))
    }

    pub async fn patch_resource(&self, claims: &Claims, req: &ResourceRequest, patch: &str, kind: PatchKind) -> AppResult<Value> {
        let app = self.authz.resolve(claims, &req.app, Check::Resource { verb: "update", resource: &req.resource }).await?;
        let res = member(&app, &req.resource)?;
        let out = self.live.patch(&app, &res, patch, kind).await.map_err(unavailable("unable to patch resource"))?;
        self.emit(claims, &app, REASON_UPDATED, &format!("patched resource {}/{} '{}'", res.group, res.kind, res.name)).await;
        info!(app = %app.key(), kind = %res.kind, name = %res.name, "api: patch_resource ok");
        Ok(out)
    }

    pub async fn delete_resource(&self, claims: &Claims, req: &ResourceRequest, opts: DeleteOptions) -> AppResult<()> {
        let app = self.authz.resolve(claims, &req.app, Check::Resource { verb: "delete", resource: &req.resource }).await?;
        let res = member(&app, &req.resource)?;
        self.live.delete(&app, &res, opts).await.map_err(unavailable("unable to delete resource"))?;
        self.emit(claims, &app, REASON_DELETED, &format!("deleted resource {}/{} '{}'", res.group, res.kind, res.name)).await;
        info!(app = %app.key(), kind = %res.kind, name = %res.name, force = opts.force, orphan = opts.orphan, "api: delete_resource ok");
        Ok(())
    }

    pub async fn run_resource_action(&self, claims: &Claims, req: &ResourceRequest, action: &str) -> AppResult<()> {
        let check = format!("action/{}/{}/{action}", req.resource.group, req.resource.kind);
        let app = self.authz.resolve(claims, &req.app, Check::Action(&check)).await?;
        let res = member(&app, &req.resource)?;
        self.live.run_action(&app, &res, action).await.map_err(unavailable("unable to run resource action"))?;
        self.emit(claims, &app, REASON_ACTION_RAN, &format!("ran action {action} on resource {}/{}/{}", res.group, res.kind, res.name)).await;
        info!(app = %app.key(), action, kind = %res.kind, name = %res.name, "api: run_resource_action ok");
        Ok(())
    }

    pub async fn resource_tree(&self, claims: &Claims, r: &AppRef) -> AppResult<ResourceTree> {
        let app = self.authz.resolve(claims, r, Check::Action("get")).await?;
        let key = app.key();
        Ok(self.accessor.get_or_refresh(&app, || self.cache.resource_tree(&key)).await?)
    }

    pub async fn managed_resources(&self, claims: &Claims, r: &AppRef) -> AppResult<Vec<ResourceDiff>> {
        let app = self.authz.resolve(claims, r, Check::Action("get")).await?;
        let key = app.key();
        Ok(self.accessor.get_or_refresh(&app, || self.cache.managed_resources(&key)).await?)
    }

    /// Pods whose logs `q` selects, directly or through an owning resource.
    pub async fn pod_log_targets(&self, claims: &Claims, q: &LogQuery) -> AppResult<Vec<ResourceRef>> {
        let app = self.authz.resolve(claims, &q.app, Check::Action("get")).await?;
        let obj = rbac_name(&self.cfg.namespace, app.project(), app.namespace(), app.name());
        if !self.authz.enforcer().enforce(claims, "logs", "get", &obj) {
            return Err(self.authz.denied(Check::Action("logs/get"), &app.key()));
        }
        let key = app.key();
        let tree = self.accessor.get_or_refresh(&app, || self.cache.resource_tree(&key)).await?;
        let pods: Vec<ResourceRef> = tree.pods_matching(|r| q.selects(r)).into_iter().map(|n| n.resource.clone()).collect();
        if pods.len() > self.cfg.max_pod_logs {
            return Err(AppError::InvalidArgument("max pods to view logs are reached. Please provide more granular query".into()));
        }
        Ok(pods)
    }

    /// Render every source at `revision` (single-source) or its target revision.
    pub async fn manifests(&self, claims: &Claims, r: &AppRef, revision: Option<&str>) -> AppResult<Vec<String>> {
        let app = self.authz.resolve(claims, r, Check::Action("get")).await?;
        let mut out = Vec::new();
        for source in app.sources() {
            let rev = match revision.filter(|v| !v.is_empty() && !app.is_multi_source()) {
                Some(v) => v.to_string(),
                None if source.target_revision.is_empty() => "HEAD".to_string(),
                None => source.target_revision.clone(),
            };
            let rendered = self
                .repo
                .generate_manifests(&source, &rev)
                .await
                .map_err(|e| AppError::Unavailable(format!("unable to render {} at {rev}: {e:#}", source.repo_url)))?;
            out.extend(rendered);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_query_selection() {
        let pod = ResourceRef::new("", "Pod", "default", "web-1");
        let deploy = ResourceRef::new("apps", "Deployment", "default", "web");
        let all = LogQuery::default();
        assert!(all.selects(&pod));
        let by_pod = LogQuery { pod_name: Some("web-1".into()), ..Default::default() };
        assert!(by_pod.selects(&pod));
        assert!(!by_pod.selects(&deploy));
        let by_owner = LogQuery { group: "apps".into(), kind: "Deployment".into(), resource_name: "web".into(), ..Default::default() };
        assert!(by_owner.selects(&deploy));
        assert!(!by_owner.selects(&pod));
    }
}
