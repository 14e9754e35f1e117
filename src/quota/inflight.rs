use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the number of simultaneously in-flight requests per credential.
/// Independent of the minute/day/month counters; permits are released on
/// drop so every exit path (success, error, cancellation) gives them back.
pub struct InflightGate {
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// RAII permit for one in-flight request
pub struct InflightPermit {
    _permit: OwnedSemaphorePermit,
}

impl InflightGate {
    pub fn new() -> Self {
        Self {
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Try to claim an in-flight slot for `key_id`. The semaphore is sized
    /// from `limit` on first use for that credential.
    pub fn try_acquire(&self, key_id: &str, limit: u64) -> Option<InflightPermit> {
        let sem = {
            let mut guard = self.semaphores.lock().unwrap();
            guard
                .entry(key_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1) as usize)))
                .clone()
        };

        sem.try_acquire_owned()
            .ok()
            .map(|permit| InflightPermit { _permit: permit })
    }

    /// Drop the semaphore for a credential so the next request re-sizes it
    /// (used after a plan change).
    pub fn forget(&self, key_id: &str) {
        self.semaphores.lock().unwrap().remove(key_id);
    }
}

impl Default for InflightGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_are_bounded_and_released_on_drop() {
        let gate = InflightGate::new();

        let a = gate.try_acquire("key-1", 2);
        let b = gate.try_acquire("key-1", 2);
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(gate.try_acquire("key-1", 2).is_none());

        // Other credentials are unaffected
        assert!(gate.try_acquire("key-2", 1).is_some());

        drop(a);
        assert!(gate.try_acquire("key-1", 2).is_some());
    }

    #[test]
    fn forget_resizes_on_next_use() {
        let gate = InflightGate::new();
        let held = gate.try_acquire("key-1", 1);
        assert!(gate.try_acquire("key-1", 1).is_none());

        gate.forget("key-1");
        // New semaphore with a larger limit; the held permit still drains
        // the old semaphore harmlessly
        assert!(gate.try_acquire("key-1", 2).is_some());
        drop(held);
    }
}
