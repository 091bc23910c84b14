//! Bounded de-duplication for at-least-once handlers.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Remembers the last `capacity` keys; older keys are forgotten first.
pub struct IdempotencyGuard {
    capacity: usize,
    inner: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl IdempotencyGuard {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Returns `true` the first time a key is seen, `false` on redelivery.
    pub fn first_seen(&self, key: &str) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (seen, order) = &mut *guard;
        if seen.contains(key) {
            return false;
        }
        seen.insert(key.to_string());
        order.push_back(key.to_string());
        while order.len() > self.capacity {
            if let Some(old) = order.pop_front() {
                seen.remove(&old);
            }
        }
        true
    }

    /// Forget a key so a later delivery is processed again (used when handling failed).
    pub fn forget(&self, key: &str) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (seen, order) = &mut *guard;
        if seen.remove(key) {
            order.retain(|k| k != key);
        }
    }
}
