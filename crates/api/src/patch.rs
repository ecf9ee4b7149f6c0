//! JSON (RFC 6902) and merge (RFC 7386) patches on Application documents.
//!
//! `status` belongs to the reconciler: patches reaching into it are rejected
//! before anything is applied.

use json_patch::{patch, Patch, PatchOperation};
use serde_json::{Map, Value};

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    Json,
    Merge,
}

impl PatchType {
    /// Empty means JSON patch.
    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "" | "json" => Ok(PatchType::Json),
            "merge" => Ok(PatchType::Merge),
            other => Err(AppError::InvalidArgument(format!("Patch type '{other}' is not supported"))),
        }
    }
}

/// Split a merge patch into its non-status and status fragments.
pub fn split_status_patch(body: &Value) -> (Option<Value>, Option<Value>) {
    let Some(obj) = body.as_object() else {
        return (Some(body.clone()), None);
    };
    let mut rest = Map::new();
    let mut status = None;
    for (k, v) in obj {
        if k == "status" {
            status = Some(v.clone());
        } else {
            rest.insert(k.clone(), v.clone());
        }
    }
    let rest = if rest.is_empty() { None } else { Some(Value::Object(rest)) };
    (rest, status)
}

fn op_path(op: &PatchOperation) -> &str {
    match op {
        PatchOperation::Add(o) => o.path.as_str(),
        PatchOperation::Remove(o) => o.path.as_str(),
        PatchOperation::Replace(o) => o.path.as_str(),
        PatchOperation::Move(o) => o.path.as_str(),
        PatchOperation::Copy(o) => o.path.as_str(),
        PatchOperation::Test(o) => o.path.as_str(),
    }
}

fn touches_status(path: &str) -> bool { path == "/status" || path.starts_with("/status/") }

fn status_rejected() -> AppError { AppError::InvalidArgument("patching status is not allowed through this path".into()) }

pub fn apply_json_patch(doc: &Value, body: &str) -> AppResult<Value> {
    let ops: Patch = serde_json::from_str(body).map_err(|e| AppError::InvalidArgument(format!("invalid JSON patch: {e}")))?;
    if ops.0.iter().map(op_path).any(touches_status) {
        return Err(status_rejected());
    }
    let mut out = doc.clone();
    patch(&mut out, &ops).map_err(|e| AppError::InvalidArgument(format!("patch operation failed: {e}")))?;
    Ok(out)
}

pub fn apply_merge_patch(doc: &Value, body: &str) -> AppResult<Value> {
    let parsed: Value = serde_json::from_str(body).map_err(|e| AppError::InvalidArgument(format!("invalid merge patch: {e}")))?;
    let (rest, status) = split_status_patch(&parsed);
    if status.is_some() {
        return Err(status_rejected());
    }
    let mut out = doc.clone();
    if let Some(rest) = rest {
        json_patch::merge(&mut out, &rest);
    }
    Ok(out)
}

pub fn apply(kind: PatchType, doc: &Value, body: &str) -> AppResult<Value> {
    match kind {
        PatchType::Json => apply_json_patch(doc, body),
        PatchType::Merge => apply_merge_patch(doc, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value { json!({"metadata": {"name": "a"}, "spec": {"project": "default"}, "status": {"sync": {"status": "Synced"}}}) }

    #[test]
    fn splits_status_fragment() {
        let (rest, status) = split_status_patch(&json!({"spec": {"project": "x"}, "status": {"health": {}}}));
        assert_eq!(rest, Some(json!({"spec": {"project": "x"}})));
        assert_eq!(status, Some(json!({"health": {}})));
        let (rest, status) = split_status_patch(&json!({"status": {}}));
        assert!(rest.is_none());
        assert!(status.is_some());
    }

    #[test]
    fn merge_patch_applies_and_refuses_status() {
        let out = apply_merge_patch(&doc(), r#"{"spec":{"project":"team"}}"#).expect("merge");
        assert_eq!(out["spec"]["project"], "team");
        assert_eq!(out["status"]["sync"]["status"], "Synced");
        assert!(apply_merge_patch(&doc(), r#"{"status":{"sync":null}}"#).is_err());
        assert!(apply_merge_patch(&doc(), "{").is_err());
    }

    #[test]
    fn json_patch_applies_and_refuses_status() {
        let out = apply_json_patch(&doc(), r#"[{"op":"replace","path":"/spec/project","value":"team"}]"#).expect("json");
        assert_eq!(out["spec"]["project"], "team");
        let err = apply_json_patch(&doc(), r#"[{"op":"remove","path":"/status/sync"}]"#).expect_err("status");
        assert!(err.to_string().contains("status"), "{err}");
        assert!(apply_json_patch(&doc(), r#"[{"op":"remove","path":"/spec/missing"}]"#).is_err());
    }

    #[test]
    fn patch_type_names() {
        assert_eq!(PatchType::parse("").expect("default"), PatchType::Json);
        assert_eq!(PatchType::parse("merge").expect("merge"), PatchType::Merge);
        assert_eq!(PatchType::parse("strategic"), Err(AppError::InvalidArgument("Patch type 'strategic' is not supported".into())));
    }
}
