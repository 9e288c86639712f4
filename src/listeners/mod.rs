// =============================================================================
// WS Event Listeners (C8 Position, C9 Leader, C10 Max-Loss)
// =============================================================================
//
// Each listener implements `WsListener` and is registered on one or more
// `SharedConnection`s via `WsManager::register_listener`. `on_message` must
// stay non-blocking — see the contract on `crate::ws::WsListener`.

pub mod leader_listener;
pub mod max_loss_listener;
pub mod position_listener;

pub use leader_listener::{LeaderDelta, LeaderListener};
pub use max_loss_listener::MaxLossListener;
pub use position_listener::PositionListener;

use std::collections::HashSet;
use parking_lot::Mutex;

/// Idempotency guard shared by every listener that consumes broker-assigned
/// event ids. Scoped per event *type* (position/fill/order/balance) because
/// the broker's id space is not guaranteed unique across types.
pub struct EventDedup {
    seen: Mutex<HashSet<String>>,
    capacity: usize,
    order: Mutex<Vec<String>>,
}

impl EventDedup {
    pub fn new(capacity: usize) -> Self {
        Self { seen: Mutex::new(HashSet::new()), capacity, order: Mutex::new(Vec::new()) }
    }

    /// Returns `true` if this is the first time `event_id` has been seen.
    pub fn check_and_mark(&self, event_id: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(event_id) {
            return false;
        }
        seen.insert(event_id.to_string());
        let mut order = self.order.lock();
        order.push(event_id.to_string());
        if order.len() > self.capacity {
            let oldest = order.remove(0);
            seen.remove(&oldest);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_passes_repeat_is_suppressed() {
        let dedup = EventDedup::new(10);
        assert!(dedup.check_and_mark("evt-1"));
        assert!(!dedup.check_and_mark("evt-1"));
    }

    #[test]
    fn capacity_eviction_allows_oldest_id_to_repeat() {
        let dedup = EventDedup::new(2);
        assert!(dedup.check_and_mark("a"));
        assert!(dedup.check_and_mark("b"));
        assert!(dedup.check_and_mark("c"));
        // "a" evicted to make room for "c"
        assert!(dedup.check_and_mark("a"));
    }
}
