mod common;

use common::{app, fixture, fixture_with, project};
use keel_api::{AppError, AppRef, SyncRequest};
use keel_core::Claims;

const BOB: &str = "p, bob, applications, get, default/*, allow\np, bob, applications, sync, default/*, allow\n";

#[tokio::test]
async fn absent_and_forbidden_look_the_same() {
    let fx = fixture(BOB, vec![app("argocd", "secret", "test"), app("argocd", "mine", "default")]);
    let bob = Claims::user("bob");

    let forbidden = fx.svc.get(&bob, &AppRef::new("secret"), None).await.expect_err("forbidden");
    let absent = fx.svc.get(&bob, &AppRef::new("nope"), None).await.expect_err("absent");
    assert_eq!(forbidden, AppError::PermissionDenied);
    assert_eq!(forbidden, absent);
    assert_eq!(forbidden.to_string(), absent.to_string());

    let mine = fx.svc.get(&bob, &AppRef::new("mine"), None).await.expect("visible");
    assert_eq!(mine.name(), "mine");
}

#[tokio::test]
async fn hidden_namespaces_and_projects_look_absent() {
    let apps = vec![
        app("kube-system", "sneaky", "default"),
        // `test` does not admit team namespaces.
        app("team-a", "stray", "test"),
        app("team-a", "ok", "default"),
    ];
    let fx = fixture("p, bob, applications, get, */*, allow\n", apps);
    let bob = Claims::user("bob");

    for (ns, name) in [("kube-system", "sneaky"), ("team-a", "stray"), ("team-a", "missing")] {
        let err = fx.svc.get(&bob, &AppRef::new(name).in_namespace(ns), None).await.expect_err(name);
        assert_eq!(err, AppError::PermissionDenied, "{ns}/{name}");
    }
    let ok = fx.svc.get(&bob, &AppRef::new("team-a/ok"), None).await.expect("qualified name");
    assert_eq!(ok.namespace(), "team-a");
}

#[tokio::test]
async fn mutating_calls_do_not_enumerate_either() {
    let fx = fixture(BOB, vec![app("argocd", "secret", "test")]);
    let bob = Claims::user("bob");
    let on = |name: &str| SyncRequest { app: AppRef::new(name), ..Default::default() };

    let forbidden = fx.svc.sync(&bob, on("secret")).await.expect_err("forbidden");
    let absent = fx.svc.sync(&bob, on("ghost")).await.expect_err("absent");
    assert_eq!(forbidden, absent);
    assert!(fx.audit.events().is_empty());
}

#[tokio::test]
async fn project_hint_reports_not_found() {
    let fx = fixture("p, alice, applications, get, test/*, allow\n", vec![app("argocd", "real", "test")]);
    let alice = Claims::user("alice");

    let err = fx.svc.get(&alice, &AppRef::new("doest-not-exist").in_project("test"), None).await.expect_err("absent");
    assert_eq!(err, AppError::NotFound(r#"applications.argoproj.io "doest-not-exist" not found"#.into()));
    assert_eq!(err.code(), "not_found");

    // No permission in the hinted project: still a plain denial.
    let err = fx.svc.get(&alice, &AppRef::new("doest-not-exist").in_project("default"), None).await.expect_err("denied");
    assert_eq!(err, AppError::PermissionDenied);

    // Wrong project hint for an existing app reads as absent.
    let fx2 = fixture("p, alice, applications, get, */*, allow\n", vec![app("argocd", "real", "test")]);
    let err = fx2.svc.get(&alice, &AppRef::new("real").in_project("default"), None).await.expect_err("mismatch");
    assert_eq!(err.code(), "not_found");
    let got = fx.svc.get(&alice, &AppRef::new("real").in_project("test"), None).await.expect("hinted");
    assert_eq!(got.project(), "test");
}

#[tokio::test]
async fn missing_project_hides_the_app() {
    let fx = fixture_with(common::config(), "p, bob, applications, get, */*, allow\n", vec![project("default", &[])], vec![app("argocd", "orphan", "gone")]);
    let err = fx.svc.get(&Claims::user("bob"), &AppRef::new("orphan"), None).await.expect_err("orphan");
    assert_eq!(err, AppError::PermissionDenied);
}
