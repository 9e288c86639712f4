// =============================================================================
// Leader Listener (C9)
// =============================================================================
//
// Watches a leader account's position events and classifies the delta
// between the previous known net position and the new one into the five
// copy-trading primitives. Classification is pure and independently
// testable; propagation to followers is left to `crate::copytrade`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::instrument;

use crate::types::Side;
use crate::ws::{WsEvent, WsListener};

use super::EventDedup;

const DEDUP_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum LeaderDelta {
    Entry { side: Side, qty: Decimal },
    Add { side: Side, added_qty: Decimal, new_total: Decimal },
    Trim { side: Side, removed_qty: Decimal, new_total: Decimal },
    Reversal { from_side: Side, to_side: Side, qty: Decimal },
    Close { side: Side, qty: Decimal },
}

/// Signed net position: positive = long, negative = short, zero = flat.
fn signed(side: Side, qty: Decimal) -> Decimal {
    Decimal::from(side.direction()) * qty
}

/// Classify a leader's net-position transition:
/// flat -> non-flat = ENTRY; same-side increase = ADD; same-side decrease =
/// TRIM; side change = REVERSAL; non-flat -> flat = CLOSE.
pub fn classify(previous_signed: Decimal, new_signed: Decimal) -> Option<LeaderDelta> {
    if previous_signed.is_zero() && new_signed.is_zero() {
        return None;
    }
    if previous_signed.is_zero() {
        let side = if new_signed > Decimal::ZERO { Side::Long } else { Side::Short };
        return Some(LeaderDelta::Entry { side, qty: new_signed.abs() });
    }
    if new_signed.is_zero() {
        let side = if previous_signed > Decimal::ZERO { Side::Long } else { Side::Short };
        return Some(LeaderDelta::Close { side, qty: previous_signed.abs() });
    }

    let prev_side = if previous_signed > Decimal::ZERO { Side::Long } else { Side::Short };
    let new_side = if new_signed > Decimal::ZERO { Side::Long } else { Side::Short };

    if prev_side != new_side {
        return Some(LeaderDelta::Reversal { from_side: prev_side, to_side: new_side, qty: new_signed.abs() });
    }

    let delta = new_signed.abs() - previous_signed.abs();
    if delta > Decimal::ZERO {
        Some(LeaderDelta::Add { side: new_side, added_qty: delta, new_total: new_signed.abs() })
    } else if delta < Decimal::ZERO {
        Some(LeaderDelta::Trim { side: new_side, removed_qty: -delta, new_total: new_signed.abs() })
    } else {
        None
    }
}

pub trait LeaderDeltaSink: Send + Sync {
    fn on_leader_delta(&self, leader_account_id: i64, symbol: &str, delta: LeaderDelta);
}

/// Tracks last-known net position per `(account, symbol)` and emits
/// classified deltas to a sink (the copy-trade fan-out component).
pub struct LeaderListener {
    leader_account_id: i64,
    last_signed: Mutex<HashMap<String, Decimal>>,
    dedup: EventDedup,
    sink: Arc<dyn LeaderDeltaSink>,
}

impl LeaderListener {
    pub fn new(leader_account_id: i64, sink: Arc<dyn LeaderDeltaSink>) -> Self {
        Self {
            leader_account_id,
            last_signed: Mutex::new(HashMap::new()),
            dedup: EventDedup::new(DEDUP_CAPACITY),
            sink,
        }
    }

    #[instrument(skip(self), fields(leader_account_id = self.leader_account_id))]
    fn handle(&self, event_id: &str, symbol: &str, net_qty: Decimal) {
        if !self.dedup.check_and_mark(event_id) {
            return;
        }
        let mut last = self.last_signed.lock();
        let previous = last.get(symbol).copied().unwrap_or(Decimal::ZERO);
        last.insert(symbol.to_string(), net_qty);
        drop(last);

        if let Some(delta) = classify(previous, net_qty) {
            self.sink.on_leader_delta(self.leader_account_id, symbol, delta);
        }
    }
}

impl WsListener for LeaderListener {
    fn on_message(&self, event: &WsEvent) {
        if let WsEvent::Position { event_id, account_id, symbol, net_qty, .. } = event {
            if *account_id != self.leader_account_id {
                return;
            }
            self.handle(event_id, symbol, *net_qty);
        }
    }
}
