//! Advisory per-key mutual exclusion for read-modify-write sequences.
//!
//! Only serializes callers inside this process; the store's version check
//! remains the cross-process guard. Guards release on drop, including when
//! the owning future is cancelled.

use std::sync::{Arc, Mutex};

use keel_core::ObjectKey;
use rustc_hash::FxHashMap;
use tokio::sync::OwnedMutexGuard;

const PRUNE_ABOVE: usize = 1024;

#[derive(Default)]
pub struct KeyLock {
    slots: Mutex<FxHashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>>,
}

pub struct KeyGuard {
    key: ObjectKey,
    _held: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &ObjectKey { &self.key }
}

impl KeyLock {
    pub fn new() -> Self { Self::default() }

    pub async fn lock(&self, key: &ObjectKey) -> KeyGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            if slots.len() > PRUNE_ABOVE {
                // Slots nobody holds or waits on.
                slots.retain(|_, m| Arc::strong_count(m) > 1);
            }
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        KeyGuard { key: key.clone(), _held: slot.lock_owned().await }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize { self.slots.lock().unwrap_or_else(|e| e.into_inner()).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
