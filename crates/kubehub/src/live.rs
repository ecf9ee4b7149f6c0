//! Mutations on live objects an Application manages.

use std::sync::RwLock;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use keel_core::{
    ports::{DeleteOptions, LiveResources, PatchKind},
    Application, ResourceRef,
};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tracing::{debug, info};

const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";

/// Merge patch implementing a built-in resource action, if `kind` supports it.
pub fn action_patch(kind: &str, action: &str, now: &str) -> Option<Value> {
    match (kind, action) {
        ("Deployment" | "StatefulSet" | "DaemonSet", "restart") => {
            Some(json!({"spec": {"template": {"metadata": {"annotations": {RESTARTED_AT: now}}}}}))
        }
        ("CronJob", "suspend") => Some(json!({"spec": {"suspend": true}})),
        ("CronJob", "resume") => Some(json!({"spec": {"suspend": false}})),
        ("Rollout", "pause") => Some(json!({"spec": {"paused": true}})),
        ("Rollout", "resume") => Some(json!({"spec": {"paused": false}})),
        _ => None,
    }
}

pub fn delete_params(opts: DeleteOptions) -> DeleteParams {
    let mut dp = if opts.orphan { DeleteParams::orphan() } else { DeleteParams::foreground() };
    if opts.force {
        dp.grace_period_seconds = Some(0);
    }
    dp
}

pub struct KubeLiveResources {
    client: Client,
    resolved: RwLock<FxHashMap<(String, String, String), (ApiResource, bool)>>,
}

impl KubeLiveResources {
    pub fn new(client: Client) -> Self { Self { client, resolved: RwLock::new(FxHashMap::default()) } }

    /// Locate the served resource for `res`, remembering the answer.
    async fn api_resource(&self, res: &ResourceRef) -> Result<(ApiResource, bool)> {
        let id = (res.group.clone(), res.version.clone(), res.kind.clone());
        if let Some(hit) = self.resolved.read().unwrap_or_else(|e| e.into_inner()).get(&id) {
            return Ok(hit.clone());
        }
        let discovery = Discovery::new(self.client.clone()).run().await.context("running discovery")?;
        let mut found = None;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let version_ok = res.version.is_empty() || ar.version == res.version;
                if ar.group == res.group && ar.kind == res.kind && version_ok {
                    found = Some((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
                    break;
                }
            }
        }
        let hit = found.ok_or_else(|| anyhow!("resource kind not served: {}/{}", res.group, res.kind))?;
        debug!(group = %res.group, kind = %res.kind, version = %hit.0.version, "kube: resolved api resource");
        self.resolved.write().unwrap_or_else(|e| e.into_inner()).insert(id, hit.clone());
        Ok(hit)
    }

    async fn api(&self, res: &ResourceRef) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.api_resource(res).await?;
        Ok(if namespaced {
            if res.namespace.is_empty() {
                bail!("namespace required for namespaced kind {}", res.kind);
            }
            Api::namespaced_with(self.client.clone(), &res.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

#[async_trait]
impl LiveResources for KubeLiveResources {
    async fn get(&self, _app: &Application, res: &ResourceRef) -> Result<Option<Value>> {
        let api = self.api(res).await?;
        match api.get_opt(&res.name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(obj)?)),
            None => Ok(None),
        }
    }

    async fn patch(&self, app: &Application, res: &ResourceRef, patch: &str, kind: PatchKind) -> Result<Value> {
        let api = self.api(res).await?;
        let pp = PatchParams::default();
        let out = match kind {
            PatchKind::Merge => api.patch(&res.name, &pp, &Patch::Merge(serde_json::from_str::<Value>(patch)?)).await?,
            PatchKind::Strategic => api.patch(&res.name, &pp, &Patch::Strategic(serde_json::from_str::<Value>(patch)?)).await?,
            PatchKind::Json => {
                // Applied locally and written back under the read version.
                let ops: json_patch::Patch = serde_json::from_str(patch).context("parsing JSON patch")?;
                let cur = api.get(&res.name).await?;
                let mut doc = serde_json::to_value(&cur)?;
                json_patch::patch(&mut doc, &ops).context("applying JSON patch")?;
                let next: DynamicObject = serde_json::from_value(doc)?;
                api.replace(&res.name, &PostParams::default(), &next).await?
            }
        };
        info!(app = %app.key(), kind = %res.kind, name = %res.name, "kube: patched live resource");
        Ok(serde_json::to_value(out)?)
    }

    async fn delete(&self, app: &Application, res: &ResourceRef, opts: DeleteOptions) -> Result<()> {
        let api = self.api(res).await?;
        api.delete(&res.name, &delete_params(opts)).await?;
        info!(app = %app.key(), kind = %res.kind, name = %res.name, force = opts.force, orphan = opts.orphan, "kube: deleted live resource");
        Ok(())
    }

    async fn run_action(&self, app: &Application, res: &ResourceRef, action: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let body = action_patch(&res.kind, action, &now).ok_or_else(|| anyhow!("action {action} is not available on {}", res.kind))?;
        let api = self.api(res).await?;
        api.patch(&res.name, &PatchParams::default(), &Patch::Merge(&body)).await?;
        info!(app = %app.key(), action, kind = %res.kind, name = %res.name, "kube: ran resource action");
        Ok(())
    }
}
