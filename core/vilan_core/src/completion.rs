//! Correlation-keyed completion slots for bounded request/response waits
//!
//! A requester registers a slot under a key, sends its request, then waits up
//! to a deadline. The response handler completes the slot by key. Whichever
//! side finishes first removes the slot; a response arriving after the waiter
//! gave up finds nothing and is dropped.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

struct Slot<V> {
    id: u64,
    tx: SyncSender<V>,
}

pub struct Completions<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    next_id: AtomicU64,
}

impl<K: Eq + Hash + Clone, V> Completions<K, V> {
    pub fn new() -> Self {
        Completions {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open a slot for `key`, replacing any earlier one
    pub fn register(&self, key: K) -> Waiter<'_, K, V> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(1);
        if self.slots().insert(key.clone(), Slot { id, tx }).is_some() {
            log::debug!("replaced outstanding request slot");
        }
        Waiter {
            owner: self,
            key,
            id,
            rx,
        }
    }

    /// Deliver `value` to the waiter on `key`; false when nobody is waiting
    pub fn complete(&self, key: &K, value: V) -> bool {
        let slot = self.slots().remove(key);
        match slot {
            Some(slot) => slot.tx.try_send(value).is_ok(),
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.slots().len()
    }

    fn release(&self, key: &K, id: u64) {
        let mut slots = self.slots();
        if slots.get(key).map(|s| s.id) == Some(id) {
            slots.remove(key);
        }
    }
}

impl<K: Eq + Hash + Clone, V> Default for Completions<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outstanding request; dropping it releases the slot
pub struct Waiter<'a, K: Eq + Hash + Clone, V> {
    owner: &'a Completions<K, V>,
    key: K,
    id: u64,
    rx: Receiver<V>,
}

impl<K: Eq + Hash + Clone, V> Waiter<'_, K, V> {
    /// Block until the response arrives or `timeout` elapses
    pub fn wait(self, timeout: Duration) -> Option<V> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl<K: Eq + Hash + Clone, V> Drop for Waiter<'_, K, V> {
    fn drop(&mut self) {
        self.owner.release(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_complete_before_wait() {
        let c: Completions<u64, &str> = Completions::new();
        let waiter = c.register(1);
        assert!(c.complete(&1, "done"));
        assert_eq!(waiter.wait(Duration::from_millis(10)), Some("done"));
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn test_complete_from_other_thread() {
        let c: Arc<Completions<u64, u32>> = Arc::new(Completions::new());
        let waiter = c.register(7);
        let c2 = c.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c2.complete(&7, 42)
        });
        assert_eq!(waiter.wait(Duration::from_secs(2)), Some(42));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_timeout_releases_slot() {
        let c: Completions<u64, u32> = Completions::new();
        let waiter = c.register(3);
        assert_eq!(waiter.wait(Duration::from_millis(10)), None);
        assert_eq!(c.pending(), 0);
        // Late response finds no slot
        assert!(!c.complete(&3, 1));
    }

    #[test]
    fn test_replaced_slot_not_released_by_stale_waiter() {
        let c: Completions<u64, u32> = Completions::new();
        let stale = c.register(5);
        let fresh = c.register(5);
        drop(stale);
        assert_eq!(c.pending(), 1);
        assert!(c.complete(&5, 9));
        assert_eq!(fresh.wait(Duration::from_millis(10)), Some(9));
    }
}
