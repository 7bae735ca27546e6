//! In-memory learn cache (spec §4.6 "Learning" step 1, §8 scenario: repeated
//! `Learn(spam)` on the same message is rejected on the second call).
//!
//! `siftmail_core` only defines the `LearnCache` trait contract; deployments
//! supply a concrete backend. This one is a bounded set guarded by a
//! `parking_lot::Mutex`, sized generously and never evicted within a worker's
//! lifetime — a deployment that needs persistence across restarts would swap
//! this for a Redis-backed one without touching callers.

use std::collections::HashSet;

use parking_lot::Mutex;

use siftmail_core::stats::classifier::{LearnCache, LearnCacheVerdict};

pub struct MemoryLearnCache {
    seen: Mutex<HashSet<(String, String, bool)>>,
}

impl MemoryLearnCache {
    pub fn new() -> Self {
        Self { seen: Mutex::new(HashSet::new()) }
    }
}

impl Default for MemoryLearnCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LearnCache for MemoryLearnCache {
    fn check(&self, message_digest: &str, classifier: &str, is_spam: bool) -> LearnCacheVerdict {
        let key = (message_digest.to_string(), classifier.to_string(), is_spam);
        if self.seen.lock().contains(&key) {
            return LearnCacheVerdict::Ignore;
        }
        let opposite = (message_digest.to_string(), classifier.to_string(), !is_spam);
        if self.seen.lock().contains(&opposite) {
            return LearnCacheVerdict::Unlearn;
        }
        LearnCacheVerdict::Allow
    }

    fn record(&self, message_digest: &str, classifier: &str, is_spam: bool) {
        let mut seen = self.seen.lock();
        seen.remove(&(message_digest.to_string(), classifier.to_string(), !is_spam));
        seen.insert((message_digest.to_string(), classifier.to_string(), is_spam));
    }
}
