#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::ObjectKey;
use keel_store::KeyLock;

#[tokio::test]
async fn same_key_is_exclusive() {
    let locks = Arc::new(KeyLock::new());
    let key = ObjectKey::new("argocd", "a");
    let held = locks.lock(&key).await;

    let waiter = tokio::spawn({
        let locks = Arc::clone(&locks);
        let key = key.clone();
        async move { let _g = locks.lock(&key).await; }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished(), "second holder got in while the first still held the key");
    drop(held);
    tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("waiter woke").expect("join");
}

#[tokio::test]
async fn distinct_keys_do_not_block() {
    let locks = KeyLock::new();
    let _a = locks.lock(&ObjectKey::new("argocd", "a")).await;
    let b = tokio::time::timeout(Duration::from_millis(200), locks.lock(&ObjectKey::new("argocd", "b"))).await;
    assert!(b.is_ok());
    assert_eq!(locks.len(), 2);
}

#[tokio::test]
async fn cancelled_holder_releases() {
    let locks = Arc::new(KeyLock::new());
    let key = ObjectKey::new("argocd", "a");
    let task = tokio::spawn({
        let locks = Arc::clone(&locks);
        let key = key.clone();
        async move {
            let _g = locks.lock(&key).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    task.abort();
    let got = tokio::time::timeout(Duration::from_secs(1), locks.lock(&key)).await;
    assert!(got.is_ok(), "aborted task kept the key locked");
}
