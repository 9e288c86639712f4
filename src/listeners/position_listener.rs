// =============================================================================
// Position Listener (C8)
// =============================================================================
//
// Consumes `position`/`fill`/`order` events off the shared WS connection and
// applies them to the in-memory Position Mirror and Trade Ledger. Each event
// type gets its own idempotency dedup set since broker event ids are only
// guaranteed unique within a type.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::instruments::{root_of, tick_size};
use crate::position_mirror::PositionMirror;
use crate::trade_ledger::TradeLedger;
use crate::types::{ExitReason, OrderStatus, Side, TradeStatus};
use crate::ws::{WsEvent, WsListener};

use super::EventDedup;

const DEDUP_CAPACITY: usize = 4096;

pub struct PositionListener {
    strategy_id: i64,
    mirror: Arc<PositionMirror>,
    ledger: Arc<TradeLedger>,
    order_status: RwLock<HashMap<String, OrderStatus>>,
    position_dedup: EventDedup,
    fill_dedup: EventDedup,
    order_dedup: EventDedup,
}

impl PositionListener {
    pub fn new(strategy_id: i64, mirror: Arc<PositionMirror>, ledger: Arc<TradeLedger>) -> Self {
        Self {
            strategy_id,
            mirror,
            ledger,
            order_status: RwLock::new(HashMap::new()),
            position_dedup: EventDedup::new(DEDUP_CAPACITY),
            fill_dedup: EventDedup::new(DEDUP_CAPACITY),
            order_dedup: EventDedup::new(DEDUP_CAPACITY),
        }
    }

    /// Current tracked status for a broker order, if any has been observed.
    pub fn order_status(&self, order_id: &str) -> Option<OrderStatus> {
        self.order_status.read().get(order_id).copied()
    }

    #[instrument(skip(self), fields(strategy_id = self.strategy_id))]
    fn handle_position(&self, event_id: &str, symbol: &str, net_qty: Decimal, avg_entry: Decimal) {
        if !self.position_dedup.check_and_mark(event_id) {
            return;
        }
        let Ok(root) = root_of(symbol) else {
            warn!(symbol, "position event for unknown symbol root, dropping");
            return;
        };

        if net_qty.is_zero() {
            if let Some(pos) = self.mirror.open_position_for(self.strategy_id, root) {
                self.mirror.close(self.strategy_id, root, pos.current_price, ExitReason::Manual);
            }
            return;
        }

        let side = if net_qty.is_sign_negative() { Side::Short } else { Side::Long };
        let qty = net_qty.abs();
        if let Some(existing) = self.mirror.open_position_for(self.strategy_id, root) {
            if existing.side != side || existing.total_qty != qty || existing.avg_entry != avg_entry {
                warn!(
                    symbol, old_side = ?existing.side, new_side = ?side, old_qty = %existing.total_qty,
                    new_qty = %qty, old_avg = %existing.avg_entry, new_avg = %avg_entry,
                    "mirror diverged from broker-reported position, overwriting"
                );
                self.mirror.reconcile_broker_truth(self.strategy_id, root, side, qty, avg_entry);
            }
        }
    }

    /// Locates the open Trade(s) for this strategy/root's current position
    /// and closes any whose `tp_price`/`sl_price` the fill price lands within
    /// one tick of. Does not touch the Position row itself — a Position only
    /// fully closes via `handle_position`'s `net_qty == 0` branch.
    #[instrument(skip(self), fields(strategy_id = self.strategy_id))]
    fn handle_fill(&self, event_id: &str, symbol: &str, price: Decimal) {
        if !self.fill_dedup.check_and_mark(event_id) {
            return;
        }
        let Ok(root) = root_of(symbol) else {
            warn!(symbol, "fill event for unknown symbol root, dropping");
            return;
        };
        self.mirror.apply_price_update(self.strategy_id, root, price);

        let Some(position) = self.mirror.open_position_for(self.strategy_id, root) else {
            return;
        };
        let Ok(tolerance) = tick_size(root) else {
            return;
        };

        for trade in self.ledger.trades_for_position(&position.id) {
            if trade.status != TradeStatus::Open {
                continue;
            }
            if trade.tp_price.map(|tp| (price - tp).abs() <= tolerance).unwrap_or(false) {
                self.ledger.update(&trade.id, |t| t.close(price, ExitReason::Tp));
            } else if trade.sl_price.map(|sl| (price - sl).abs() <= tolerance).unwrap_or(false) {
                self.ledger.update(&trade.id, |t| t.close(price, ExitReason::Sl));
            }
        }
    }

    #[instrument(skip(self), fields(strategy_id = self.strategy_id))]
    fn handle_order(&self, event_id: &str, order_id: &str, status: OrderStatus) {
        if !self.order_dedup.check_and_mark(event_id) {
            return;
        }
        let previous = self.order_status.write().insert(order_id.to_string(), status);
        match previous {
            Some(prev) if prev != status => debug!(order_id, ?prev, ?status, "order status transitioned"),
            Some(_) => {}
            None => debug!(order_id, ?status, "order status observed for the first time"),
        }
    }
}

impl WsListener for PositionListener {
    fn on_message(&self, event: &WsEvent) {
        match event {
            WsEvent::Position { event_id, symbol, net_qty, avg_entry } => {
                self.handle_position(event_id, symbol, *net_qty, *avg_entry);
            }
            WsEvent::Fill { event_id, symbol, price, .. } => {
                self.handle_fill(event_id, symbol, *price);
            }
            WsEvent::Order { event_id, order_id, status, .. } => {
                self.handle_order(event_id, order_id, *status);
            }
            WsEvent::Balance { .. } => {}
        }
    }
}
