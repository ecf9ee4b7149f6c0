//! Computed state served from the cache: resource tree and managed-resource diffs.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::HealthStatus;

/// Group/kind/namespace/name of a live cluster object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(group: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self { group: group.into(), version: String::new(), kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    /// RBAC action for `verb` on this object: `verb/group/kind/namespace/name`.
    pub fn fine_grained_action(&self, verb: &str) -> String {
        format!("{verb}/{}/{}/{}/{}", self.group, self.kind, self.namespace, self.name)
    }

    fn identity(&self) -> (&str, &str, &str, &str) { (&self.group, &self.kind, &self.namespace, &self.name) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceNode {
    #[serde(flatten)]
    pub resource: ResourceRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_refs: Vec<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTree {
    #[serde(default)]
    pub nodes: Vec<ResourceNode>,
}

impl ResourceTree {
    /// Pod nodes that match `pred` themselves or through any ancestor.
    pub fn pods_matching<F>(&self, pred: F) -> Vec<&ResourceNode>
    where
        F: Fn(&ResourceRef) -> bool,
    {
        let by_id: FxHashMap<_, &ResourceNode> = self.nodes.iter().map(|n| (n.resource.identity(), n)).collect();
        let mut out = Vec::new();
        for node in self.nodes.iter().filter(|n| n.resource.group.is_empty() && n.resource.kind == "Pod") {
            let mut seen = FxHashSet::default();
            let mut stack = vec![&node.resource];
            let mut hit = false;
            while let Some(r) = stack.pop() {
                if !seen.insert(r.identity()) { continue; }
                if pred(r) { hit = true; break; }
                if let Some(n) = by_id.get(&r.identity()) { stack.extend(n.parent_refs.iter()); }
            }
            if hit { out.push(node); }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDiff {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_state: Option<String>,
    #[serde(default)]
    pub modified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(group: &str, kind: &str, name: &str, parent: Option<ResourceRef>) -> ResourceNode {
        ResourceNode { resource: ResourceRef::new(group, kind, "ns", name), parent_refs: parent.into_iter().collect(), health: None }
    }

    #[test]
    fn pods_found_through_owner_chain() {
        let dep = ResourceRef::new("apps", "Deployment", "ns", "web");
        let rs = ResourceRef::new("apps", "ReplicaSet", "ns", "web-1");
        let tree = ResourceTree {
            nodes: vec![
                node("apps", "Deployment", "web", None),
                node("apps", "ReplicaSet", "web-1", Some(dep.clone())),
                node("", "Pod", "web-1-a", Some(rs.clone())),
                node("", "Pod", "web-1-b", Some(rs)),
                node("", "Pod", "lonely", None),
            ],
        };
        let pods = tree.pods_matching(|r| r.kind == "Deployment" && r.name == "web");
        assert_eq!(pods.len(), 2);
        let all = tree.pods_matching(|_| true);
        assert_eq!(all.len(), 3);
        let one = tree.pods_matching(|r| r.name == "lonely");
        assert_eq!(one[0].resource.name, "lonely");
    }

    #[test]
    fn fine_grained_action_shape() {
        let r = ResourceRef::new("fake.io", "PodTest", "fake-ns", "my-pod-test");
        assert_eq!(r.fine_grained_action("delete"), "delete/fake.io/PodTest/fake-ns/my-pod-test");
    }
}
