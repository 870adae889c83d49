//! Per-key mutual exclusion for check-then-create.
//!
//! Locks are scoped to one `(server, kind, scope, name)` business key, so
//! unrelated tasks and assets resolve in parallel. Slots are dropped once no
//! holder or waiter references them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::OwnedMutexGuard;

use mirror_core::{EntityKind, Side};

/// Business identity of an entity about to be created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub server: Side,
    pub kind: EntityKind,
    /// Id of the destination parent the name is unique under.
    pub scope: String,
    pub name: String,
}

impl LockKey {
    pub fn new(
        server: Side,
        kind: EntityKind,
        scope: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            server,
            kind,
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}/{}", self.server, self.kind, self.scope, self.name)
    }
}

#[derive(Debug, Default)]
pub struct KeyLocks {
    slots: Mutex<HashMap<LockKey, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`. Hold the guard only across the
    /// existence check and the create.
    pub async fn acquire(&self, key: &LockKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slots.retain(|_, slot| slot.strong_count() > 0);
            match slots.get(key).and_then(Weak::upgrade) {
                Some(slot) => slot,
                None => {
                    let slot = Arc::new(tokio::sync::Mutex::new(()));
                    slots.insert(key.clone(), Arc::downgrade(&slot));
                    slot
                }
            }
        };
        slot.lock_owned().await
    }

    /// Keys currently held or awaited.
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(name: &str) -> LockKey {
        LockKey::new(Side::Undark, EntityKind::Task, "project-1", name)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let (locks, inside, max_seen) = (locks.clone(), inside.clone(), max_seen.clone());
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(&key("comp")).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let locks = KeyLocks::new();
        let _comp = locks.acquire(&key("comp")).await;
        let lighting =
            tokio::time::timeout(Duration::from_millis(50), locks.acquire(&key("lighting")))
                .await;
        assert!(lighting.is_ok());
    }

    #[tokio::test]
    async fn released_slots_are_dropped() {
        let locks = KeyLocks::new();
        {
            let _guard = locks.acquire(&key("comp")).await;
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }
}
