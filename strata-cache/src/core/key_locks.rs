//! Per-key synchronization state for the in-process backend
//!
//! Each key gets one async reader-writer lock and one single-slot wake-up
//! primitive. Slots are reference counted: the registry only keeps `Weak`
//! handles, so a slot lives exactly as long as some operation holds it and
//! every concurrent user of a key shares the same instance.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, RwLock};
use tracing::debug;

const MIN_SWEEP_THRESHOLD: usize = 1024;

/// Lock and notification shared by all users of one key
#[derive(Debug, Default)]
pub struct KeySlot {
    lock: RwLock<()>,
    notify: Notify,
}

impl KeySlot {
    /// Reader-writer lock guarding the key's entry
    pub fn lock(&self) -> &RwLock<()> {
        &self.lock
    }

    /// Single-slot wake-up for queue waiters
    ///
    /// `notify_one` with no waiter stores at most one permit, so repeated
    /// pushes coalesce into a single pending wake.
    pub fn notify(&self) -> &Notify {
        &self.notify
    }
}

struct Registry {
    slots: HashMap<String, Weak<KeySlot>>,
    sweep_at: usize,
}

impl Registry {
    fn sweep(&mut self) {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.strong_count() > 0);
        self.sweep_at = (self.slots.len() * 2).max(MIN_SWEEP_THRESHOLD);
        debug!(
            "Swept key slots: {} -> {} (next sweep at {})",
            before,
            self.slots.len(),
            self.sweep_at
        );
    }
}

/// Registry handing out the shared [`KeySlot`] of each key
pub struct KeyLocks {
    inner: Mutex<Registry>,
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry {
                slots: HashMap::new(),
                sweep_at: MIN_SWEEP_THRESHOLD,
            }),
        }
    }

    /// Get the slot for `key`, creating it on first use
    pub fn slot(&self, key: &str) -> Arc<KeySlot> {
        let mut registry = self.inner.lock();
        if let Some(slot) = registry.slots.get(key).and_then(Weak::upgrade) {
            return slot;
        }

        let slot = Arc::new(KeySlot::default());
        registry
            .slots
            .insert(key.to_string(), Arc::downgrade(&slot));
        if registry.slots.len() >= registry.sweep_at {
            registry.sweep();
        }
        slot
    }

    /// Drop the registry entry of `key` if nobody holds its slot any more
    pub fn release(&self, key: &str) {
        let mut registry = self.inner.lock();
        if registry
            .slots
            .get(key)
            .is_some_and(|slot| slot.strong_count() == 0)
        {
            registry.slots.remove(key);
        }
    }

    /// Number of registry entries whose slot is still in use
    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .slots
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    /// Number of registry entries, dead or alive
    pub fn tracked_count(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_shares_slot() {
        let locks = KeyLocks::new();
        let a = locks.slot("k");
        let b = locks.slot("k");
        assert!(Arc::ptr_eq(&a, &b));

        let other = locks.slot("other");
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_release_only_drops_unused_slots() {
        let locks = KeyLocks::new();
        let held = locks.slot("held");
        drop(locks.slot("free"));

        locks.release("held");
        locks.release("free");

        assert_eq!(locks.tracked_count(), 1);
        assert_eq!(locks.live_count(), 1);
        drop(held);
        assert_eq!(locks.live_count(), 0);
    }

    #[test]
    fn test_sweep_bounds_growth() {
        let locks = KeyLocks::new();
        for i in 0..(MIN_SWEEP_THRESHOLD * 3) {
            drop(locks.slot(&format!("key:{}", i)));
        }
        assert!(locks.tracked_count() <= MIN_SWEEP_THRESHOLD);
    }

    #[tokio::test]
    async fn test_pending_notification_is_single_slot() {
        let locks = KeyLocks::new();
        let slot = locks.slot("q");
        slot.notify().notify_one();
        slot.notify().notify_one();

        // One stored permit completes immediately...
        slot.notify().notified().await;
        // ...the second push coalesced into it.
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            slot.notify().notified(),
        )
        .await;
        assert!(second.is_err());
    }
}
