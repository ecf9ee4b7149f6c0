mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{app, fixture, fixture_with, manage, project, spawn_reconciler};
use keel_api::{AppError, AppRef, CacheError, StateCache};
use keel_core::{AppCondition, Claims, HealthStatus, RefreshType, ResourceNode, ResourceRef, ResourceTree};
use keel_store::ObjectStore;

const READER: &str = "p, bob, applications, get, */*, allow\n";

fn tree() -> ResourceTree { ResourceTree { nodes: vec![ResourceNode { resource: ResourceRef::new("apps", "Deployment", "default", "web"), ..Default::default() }] } }

#[tokio::test]
async fn miss_refreshes_once_then_reads_again() {
    let fx = fixture(READER, vec![app("argocd", "guestbook", "default")]);
    let a = fx.store.get(&keel_core::ObjectKey::new("argocd", "guestbook")).await.expect("app");
    let key = a.key();
    let (served, task) = spawn_reconciler(fx.store.clone(), fx.cache.clone(), key.clone(), tree());

    let reads = AtomicUsize::new(0);
    let got = fx
        .svc
        .accessor()
        .get_or_refresh(&a, || {
            reads.fetch_add(1, Ordering::SeqCst);
            fx.cache.resource_tree(&key)
        })
        .await
        .expect("tree after refresh");
    assert_eq!(got, tree());
    assert_eq!(reads.load(Ordering::SeqCst), 2);
    assert_eq!(served.load(Ordering::SeqCst), 1);

    let after = fx.store.get(&key).await.expect("app");
    assert!(after.refresh_requested().is_none());
    task.abort();
}

#[tokio::test]
async fn other_errors_are_returned_without_refreshing() {
    let fx = fixture(READER, vec![app("argocd", "guestbook", "default")]);
    let a = fx.store.get(&keel_core::ObjectKey::new("argocd", "guestbook")).await.expect("app");
    let before = a.version();
    let reads = AtomicUsize::new(0);
    let res: Result<ResourceTree, CacheError> = fx
        .svc
        .accessor()
        .get_or_refresh(&a, || {
            reads.fetch_add(1, Ordering::SeqCst);
            async { Err(CacheError::Backend("redis down".into())) }
        })
        .await;
    assert_eq!(res, Err(CacheError::Backend("redis down".into())));
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert_eq!(fx.store.get(&a.key()).await.expect("app").version(), before, "no refresh write");
}

#[tokio::test]
async fn comparison_errors_skip_the_refresh() {
    let mut a = app("argocd", "broken", "default");
    a.status.conditions.push(AppCondition { kind: "ComparisonError".into(), message: "repo unreachable".into() });
    let fx = fixture(READER, vec![a]);
    let err = fx.svc.resource_tree(&Claims::user("bob"), &AppRef::new("broken")).await.expect_err("comparison");
    assert_eq!(err, AppError::FailedPrecondition("ComparisonError: repo unreachable".into()));
}

#[tokio::test]
async fn invalid_spec_fails_without_waiting_for_a_refresh() {
    let mut a = app("argocd", "invalid", "default");
    a.status.conditions.push(AppCondition { kind: "InvalidSpecError".into(), message: "destination server missing".into() });
    let mut cfg = common::config();
    cfg.refresh_timeout = Duration::from_secs(30);
    let fx = fixture_with(cfg, READER, vec![project("default", &[])], vec![a]);
    let t0 = std::time::Instant::now();
    let err = fx.svc.resource_tree(&Claims::user("bob"), &AppRef::new("invalid")).await.expect_err("invalid spec");
    assert_eq!(err, AppError::FailedPrecondition("InvalidSpecError: destination server missing".into()));
    assert!(t0.elapsed() < Duration::from_secs(5), "returned before the refresh deadline");
}

#[tokio::test]
async fn refresh_without_reconciler_times_out() {
    let mut cfg = common::config();
    cfg.refresh_timeout = Duration::from_millis(150);
    let fx = fixture_with(cfg, READER, vec![project("default", &[])], vec![app("argocd", "guestbook", "default")]);
    let err = fx.svc.managed_resources(&Claims::user("bob"), &AppRef::new("guestbook")).await.expect_err("timeout");
    assert_eq!(err, AppError::DeadlineExceeded("application refresh deadline exceeded".into()));
}

#[tokio::test]
async fn resource_tree_fills_through_the_reconciler() {
    let fx = fixture(READER, vec![app("argocd", "guestbook", "default")]);
    let key = keel_core::ObjectKey::new("argocd", "guestbook");
    let (served, task) = spawn_reconciler(fx.store.clone(), fx.cache.clone(), key, tree());
    let got = fx.svc.resource_tree(&Claims::user("bob"), &AppRef::new("guestbook")).await.expect("tree");
    assert_eq!(got.nodes.len(), 1);
    let again = fx.svc.resource_tree(&Claims::user("bob"), &AppRef::new("guestbook")).await.expect("cached");
    assert_eq!(again, got);
    assert_eq!(served.load(Ordering::SeqCst), 1);
    task.abort();
}

#[tokio::test]
async fn hard_refresh_reloads_every_source() {
    let mut a = app("argocd", "multi", "default");
    a.spec.source = None;
    a.spec.sources = vec![common::source("main"), common::source("v1")];
    let fx = fixture(READER, vec![a]);
    let key = keel_core::ObjectKey::new("argocd", "multi");
    let (served, task) = spawn_reconciler(fx.store.clone(), fx.cache.clone(), key, tree());

    let got = fx.svc.get(&Claims::user("bob"), &AppRef::new("multi"), Some(RefreshType::Hard)).await.expect("hard refresh");
    assert!(got.refresh_requested().is_none());
    assert_eq!(fx.repo.details.load(Ordering::SeqCst), 2);
    assert_eq!(served.load(Ordering::SeqCst), 1);
    task.abort();
}

#[tokio::test]
async fn get_fills_resource_health_from_the_cached_tree() {
    let deploy = ResourceRef::new("apps", "Deployment", "default", "guestbook");
    let stateful = ResourceRef::new("apps", "StatefulSet", "default", "guestbook-stateful");
    let mut a = app("argocd", "guestbook", "default");
    a.status.resource_health_source = "appTree".into();
    manage(&mut a, &deploy);
    manage(&mut a, &stateful);
    let mut plain = app("argocd", "plain", "default");
    manage(&mut plain, &deploy);
    let fx = fixture(READER, vec![a, plain]);
    let degraded = HealthStatus { status: "Degraded".into(), ..Default::default() };
    let tree = ResourceTree { nodes: vec![ResourceNode { resource: deploy, health: Some(degraded.clone()), ..Default::default() }] };
    fx.cache.set_tree(&keel_core::ObjectKey::new("argocd", "guestbook"), tree.clone());
    fx.cache.set_tree(&keel_core::ObjectKey::new("argocd", "plain"), tree);

    let bob = Claims::user("bob");
    let got = fx.svc.get(&bob, &AppRef::new("guestbook"), None).await.expect("get");
    assert_eq!(got.status.resources[0].health, Some(degraded));
    assert_eq!(got.status.resources[1].health, None);

    let untouched = fx.svc.get(&bob, &AppRef::new("plain"), None).await.expect("get");
    assert_eq!(untouched.status.resources[0].health, None, "health source is the app status");
}

#[tokio::test]
async fn missing_tree_leaves_health_unset() {
    let mut a = app("argocd", "guestbook", "default");
    a.status.resource_health_source = "appTree".into();
    manage(&mut a, &ResourceRef::new("apps", "Deployment", "default", "guestbook"));
    let fx = fixture(READER, vec![a]);
    let got = fx.svc.get(&Claims::user("bob"), &AppRef::new("guestbook"), None).await.expect("get without cache");
    assert_eq!(got.status.resources[0].health, None);
}
