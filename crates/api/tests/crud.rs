mod common;

use std::time::Duration;

use common::{app, fixture};
use keel_api::{AppError, AppRef, CreateRequest, DeleteRequest};
use keel_core::{Claims, ObjectKey, Operation, FINALIZER_BACKGROUND, FINALIZER_FOREGROUND};
use keel_store::{ObjectStore, WatchKind};

const ADMIN: &str = "g, alice, role:admin\n";

#[tokio::test]
async fn create_normalizes_and_strips_the_operation() {
    let fx = fixture(ADMIN, vec![]);
    let alice = Claims::user("alice");
    let mut a = app("", "guestbook", "");
    a.operation = Some(Operation::default());
    let created = fx.svc.create(&alice, CreateRequest::new(a)).await.expect("create");

    assert_eq!(created.namespace(), "argocd");
    assert_eq!(created.project(), "default");
    assert!(created.operation.is_none());
    assert_eq!(fx.audit.messages(), ["alice created application"]);
    let stored = fx.store.get(&ObjectKey::new("argocd", "guestbook")).await.expect("stored");
    assert!(stored.operation.is_none());
}

#[tokio::test]
async fn create_existing_needs_upsert_when_different() {
    let fx = fixture(ADMIN, vec![app("argocd", "guestbook", "default")]);
    let alice = Claims::user("alice");

    let same = fx.svc.create(&alice, CreateRequest::new(app("argocd", "guestbook", "default"))).await.expect("identical");
    assert_eq!(same.name(), "guestbook");

    let mut changed = app("argocd", "guestbook", "default");
    changed.spec.destination.namespace = "prod".into();
    let err = fx.svc.create(&alice, CreateRequest::new(changed.clone())).await.expect_err("different");
    assert_eq!(err, AppError::InvalidArgument("existing application spec is different, use upsert flag to force update".into()));

    let upserted = fx.svc.create(&alice, CreateRequest { upsert: true, ..CreateRequest::new(changed) }).await.expect("upsert");
    assert_eq!(upserted.spec.destination.namespace, "prod");
}

#[tokio::test]
async fn create_rejections() {
    let fx = fixture("p, bob, applications, create, default/*, allow\n", vec![]);
    let bob = Claims::user("bob");

    let err = fx.svc.create(&bob, CreateRequest::new(app("argocd", "x", "test"))).await.expect_err("no create in test");
    assert_eq!(err, AppError::PermissionDenied);

    let err = fx.svc.create(&bob, CreateRequest::new(app("kube-system", "x", "default"))).await.expect_err("namespace");
    assert!(matches!(err, AppError::InvalidArgument(ref m) if m.contains("kube-system")), "{err}");

    let err = fx.svc.create(&bob, CreateRequest::new(app("argocd", "x", "ghost"))).await.expect_err("project");
    assert_eq!(err, AppError::PermissionDenied, "no create permission in ghost either");

    let fx = fixture("p, bob, applications, create, */*, allow\n", vec![]);
    let err = fx.svc.create(&bob, CreateRequest::new(app("argocd", "x", "ghost"))).await.expect_err("project");
    assert_eq!(err, AppError::InvalidArgument("application references project ghost which does not exist".into()));
    let mut nosrc = app("argocd", "x", "default");
    nosrc.spec.source = None;
    let err = fx.svc.create(&bob, CreateRequest::new(nosrc)).await.expect_err("source");
    assert_eq!(err.code(), "invalid_argument");
}

#[tokio::test]
async fn moving_projects_needs_update_and_create_in_the_target() {
    let policy = "p, bob, applications, get, */*, allow\np, bob, applications, update, default/*, allow\n";
    let fx = fixture(policy, vec![app("argocd", "guestbook", "default")]);
    let bob = Claims::user("bob");
    let mut moved = app("argocd", "guestbook", "test");

    let err = fx.svc.update(&bob, moved.clone(), true).await.expect_err("no rights in test");
    assert_eq!(err, AppError::PermissionDenied);

    fx.enforcer
        .set_user_policy(&format!("{policy}p, bob, applications, update, test/*, allow\n"))
        .expect("policy");
    assert_eq!(fx.svc.update(&bob, moved.clone(), true).await.expect_err("no create in test"), AppError::PermissionDenied);

    fx.enforcer
        .set_user_policy(&format!("{policy}p, bob, applications, update, test/*, allow\np, bob, applications, create, test/*, allow\n"))
        .expect("policy");
    moved.metadata.labels.insert("team".into(), "blue".into());
    let updated = fx.svc.update(&bob, moved, true).await.expect("moved");
    assert_eq!(updated.project(), "test");
    assert_eq!(updated.metadata.labels.get("team").map(String::as_str), Some("blue"));
}

#[tokio::test]
async fn upsert_cannot_move_projects_without_update_in_the_target() {
    let policy = "p, bob, applications, get, */*, allow\np, bob, applications, update, default/*, allow\np, bob, applications, create, test/*, allow\n";
    let fx = fixture(policy, vec![app("argocd", "guestbook", "default")]);
    let bob = Claims::user("bob");
    let moved = app("argocd", "guestbook", "test");

    let err = fx.svc.create(&bob, CreateRequest { upsert: true, ..CreateRequest::new(moved.clone()) }).await.expect_err("no update in test");
    assert_eq!(err, AppError::PermissionDenied);
    let stored = fx.store.get(&ObjectKey::new("argocd", "guestbook")).await.expect("stored");
    assert_eq!(stored.project(), "default", "project unchanged after denial");

    fx.enforcer
        .set_user_policy(&format!("{policy}p, bob, applications, update, test/*, allow\n"))
        .expect("policy");
    let upserted = fx.svc.create(&bob, CreateRequest { upsert: true, ..CreateRequest::new(moved) }).await.expect("upsert");
    assert_eq!(upserted.project(), "test");
}

#[tokio::test]
async fn patch_types_and_status_guard() {
    let fx = fixture(ADMIN, vec![app("argocd", "guestbook", "default")]);
    let alice = Claims::user("alice");
    let r = AppRef::new("guestbook");

    let out = fx.svc.patch(&alice, &r, r#"{"spec":{"destination":{"namespace":"prod"}}}"#, "merge").await.expect("merge");
    assert_eq!(out.spec.destination.namespace, "prod");
    let out = fx.svc.patch(&alice, &r, r#"[{"op":"replace","path":"/spec/destination/namespace","value":"qa"}]"#, "").await.expect("json");
    assert_eq!(out.spec.destination.namespace, "qa");

    let err = fx.svc.patch(&alice, &r, r#"{"status":{"sync":{"status":"Synced"}}}"#, "merge").await.expect_err("status");
    assert_eq!(err.code(), "invalid_argument");
    let err = fx.svc.patch(&alice, &r, "{}", "strategic").await.expect_err("type");
    assert_eq!(err, AppError::InvalidArgument("Patch type 'strategic' is not supported".into()));
}

#[tokio::test]
async fn update_spec_returns_the_new_spec() {
    let fx = fixture(ADMIN, vec![app("argocd", "guestbook", "default")]);
    let mut spec = app("argocd", "guestbook", "default").spec;
    spec.destination.namespace = "staging".into();
    let out = fx.svc.update_spec(&Claims::user("alice"), &AppRef::new("guestbook"), spec.clone(), true).await.expect("update spec");
    assert_eq!(out, spec);
}

#[tokio::test]
async fn delete_sets_the_requested_finalizer() {
    let fx = fixture(ADMIN, vec![app("argocd", "fg", "default"), app("argocd", "bg", "default"), app("argocd", "orphan", "default")]);
    let alice = Claims::user("alice");
    let mut rx = fx.store.watch();

    fx.svc.delete(&alice, DeleteRequest { app: AppRef::new("fg"), ..Default::default() }).await.expect("foreground");
    fx.svc
        .delete(&alice, DeleteRequest { app: AppRef::new("bg"), propagation_policy: Some("background".into()), ..Default::default() })
        .await
        .expect("background");
    let err = fx
        .svc
        .delete(&alice, DeleteRequest { app: AppRef::new("orphan"), cascade: Some(false), propagation_policy: Some("foreground".into()) })
        .await
        .expect_err("conflicting flags");
    assert_eq!(err.code(), "invalid_argument");
    fx.svc.delete(&alice, DeleteRequest { app: AppRef::new("orphan"), cascade: Some(false), ..Default::default() }).await.expect("orphan");

    let mut finalizers = Vec::new();
    while let Ok(Ok(ev)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        if ev.kind == WatchKind::Modified {
            finalizers.push((ev.app.name().to_string(), ev.app.metadata.finalizers.clone()));
        }
    }
    assert_eq!(
        finalizers,
        [("fg".to_string(), vec![FINALIZER_FOREGROUND.to_string()]), ("bg".to_string(), vec![FINALIZER_BACKGROUND.to_string()])]
    );
    assert!(fx.store.is_empty());
    assert_eq!(fx.audit.messages().len(), 3);
}
