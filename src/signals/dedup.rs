// =============================================================================
// Signal dedup index — in-memory LRU bounded at 10^4 entries, TTL 5s
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// `dedup_key -> (signal_id, inserted_at)`. Backed by a `HashMap` plus an
/// insertion-ordered `Vec` acting as the LRU eviction queue; at this bound
/// (10^4) a linear scan for eviction is cheaper than pulling in a dedicated
/// LRU crate for a single call site.
pub struct DedupIndex {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<String, (String, Instant)>,
    order: Vec<String>,
}

impl DedupIndex {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            ttl,
            capacity,
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// If `dedup_key` was seen within the TTL window, return the prior
    /// signal id and do not record the new one — this is a duplicate. If
    /// not seen (or the prior entry expired), record `signal_id` and return
    /// `None` — this is the accepted signal.
    pub fn check_and_insert(&mut self, dedup_key: &str, signal_id: &str) -> Option<String> {
        self.evict_expired();

        if let Some((existing_id, inserted_at)) = self.entries.get(dedup_key) {
            if inserted_at.elapsed() < self.ttl {
                return Some(existing_id.clone());
            }
        }

        self.entries
            .insert(dedup_key.to_string(), (signal_id.to_string(), Instant::now()));
        self.order.push(dedup_key.to_string());
        self.evict_over_capacity();
        None
    }

    fn evict_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (_, inserted_at)| inserted_at.elapsed() < ttl);
        let alive: std::collections::HashSet<_> = self.entries.keys().cloned().collect();
        self.order.retain(|k| alive.contains(k));
    }

    fn evict_over_capacity(&mut self) {
        while self.order.len() > self.capacity {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
