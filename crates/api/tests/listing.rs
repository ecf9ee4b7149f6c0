mod common;

use std::time::Duration;

use common::{app, fixture, fixture_with, project};
use keel_api::{AppError, AppQuery};
use keel_core::{Application, Claims};
use keel_store::{ObjectStore, WatchKind};

fn labelled(name: &str, project: &str, env: &str) -> Application {
    let mut a = app("argocd", name, project);
    a.metadata.labels.insert("env".into(), env.into());
    a
}

#[tokio::test]
async fn large_listing_returns_exactly_the_granted_project() {
    let projects: Vec<_> = (0..100).map(|i| project(&format!("p{i}"), &[])).collect();
    let apps: Vec<_> = (0..10_000).map(|i| app("argocd", &format!("app-{i:05}"), &format!("p{}", i % 100))).collect();
    let policy: String = (0..50).map(|g| format!("p, team-{g}, applications, get, p{g}/*, allow\n")).collect();
    let fx = fixture_with(common::config(), &policy, projects, apps);

    let claims = Claims::user("carol").with_groups(["team-7"]);
    let out = fx.svc.list(&claims, &AppQuery::default()).await.expect("list");
    assert_eq!(out.len(), 100);
    assert!(out.iter().all(|a| a.project() == "p7"));
    assert!(out.windows(2).all(|w| w[0].name() <= w[1].name()));

    let nobody = fx.svc.list(&Claims::user("mallory"), &AppQuery::default()).await.expect("list");
    assert!(nobody.is_empty());
}

#[tokio::test]
async fn query_filters_combine() {
    let mut other_repo = labelled("db", "default", "prod");
    if let Some(s) = other_repo.spec.source.as_mut() {
        s.repo_url = "https://github.com/example/db".into();
    }
    let apps = vec![labelled("web", "default", "prod"), labelled("web-canary", "default", "staging"), labelled("api", "test", "prod"), other_repo];
    let fx = fixture("p, bob, applications, get, */*, allow\n", apps);
    let bob = Claims::user("bob");
    let names = |v: Vec<Application>| v.iter().map(|a| a.name().to_string()).collect::<Vec<_>>();

    let all = fx.svc.list(&bob, &AppQuery::default()).await.expect("all");
    assert_eq!(names(all), ["api", "db", "web", "web-canary"]);

    let q = AppQuery { name: Some("web*".into()), ..Default::default() };
    assert_eq!(names(fx.svc.list(&bob, &q).await.expect("glob")), ["web", "web-canary"]);

    let q = AppQuery { selector: Some("env=prod".into()), projects: vec!["default".into()], ..Default::default() };
    assert_eq!(names(fx.svc.list(&bob, &q).await.expect("selector")), ["db", "web"]);

    let q = AppQuery { project: vec!["test".into()], ..Default::default() };
    assert_eq!(names(fx.svc.list(&bob, &q).await.expect("legacy project")), ["api"]);

    let q = AppQuery { repo: Some("https://GitHub.com/example/DB.git/".into()), ..Default::default() };
    assert_eq!(names(fx.svc.list(&bob, &q).await.expect("repo")), ["db"]);

    let q = AppQuery { resource_version: Some("3".into()), ..Default::default() };
    assert_eq!(fx.svc.list(&bob, &q).await.expect("floor").len(), 2);
}

#[tokio::test]
async fn bad_selector_and_closed_namespace() {
    let fx = fixture("p, bob, applications, get, */*, allow\n", vec![app("argocd", "a", "default")]);
    let bob = Claims::user("bob");
    let err = fx.svc.list(&bob, &AppQuery { selector: Some("env in (".into()), ..Default::default() }).await.expect_err("selector");
    assert!(matches!(err, AppError::InvalidArgument(ref m) if m.starts_with("error parsing the selector")), "{err}");

    let q = AppQuery { app_namespace: Some("kube-system".into()), ..Default::default() };
    assert!(fx.svc.list(&bob, &q).await.expect("closed namespace").is_empty());
}

#[tokio::test]
async fn watch_sends_initial_set_then_visible_changes() {
    let fx = fixture("p, bob, applications, get, default/*, allow\n", vec![app("argocd", "a", "default"), app("argocd", "hidden", "test")]);
    let bob = Claims::user("bob");
    let mut stream = fx.svc.watch(&bob, &AppQuery::default()).await.expect("watch");

    let first = tokio::time::timeout(Duration::from_secs(2), stream.rx.recv()).await.expect("initial").expect("event");
    assert_eq!(first.kind, WatchKind::Added);
    assert_eq!(first.app.name(), "a");

    fx.store.create(app("argocd", "secret", "test")).await.expect("create hidden");
    fx.store.create(app("argocd", "b", "default")).await.expect("create visible");
    let next = tokio::time::timeout(Duration::from_secs(2), stream.rx.recv()).await.expect("change").expect("event");
    assert_eq!(next.kind, WatchKind::Added);
    assert_eq!(next.app.name(), "b");

    fx.store.delete(&next.app.key()).await.expect("delete");
    let gone = tokio::time::timeout(Duration::from_secs(2), stream.rx.recv()).await.expect("delete").expect("event");
    assert_eq!(gone.kind, WatchKind::Deleted);
    assert_eq!(gone.app.name(), "b");
    stream.cancel.cancel();
}
