// =============================================================================
// Position Mirror (C4) — local mirror of broker-truth positions
// =============================================================================
//
// Persisted; also maintains an in-memory index keyed by
// `(strategy_id, symbol_root)` for O(1) lookup from WS price/fill events.
// On startup the index is rebuilt by scanning open rows. Position Mirror
// rows are the only cross-component mutable state; writes are guarded by a
// per-key lock, reads are lock-free snapshots (a cloned `Position`).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::new_id;
use crate::instruments::{tick_size, tick_value};
use crate::trade_ledger::{Trade, TradeLedger};
use crate::types::{ExitReason, PositionStatus, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEntry {
    pub price: Decimal,
    pub qty: Decimal,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub strategy_id: i64,
    pub symbol: String,
    pub symbol_root: String,
    pub side: Side,
    pub total_qty: Decimal,
    pub avg_entry: Decimal,
    pub entries: Vec<PositionEntry>,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub worst_unrealized_pnl: Decimal,
    pub best_unrealized_pnl: Decimal,
    pub status: PositionStatus,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    fn recompute_avg(&mut self) {
        let weighted: Decimal = self.entries.iter().map(|e| e.price * e.qty).sum();
        self.total_qty = self.entries.iter().map(|e| e.qty).sum();
        self.avg_entry = if self.total_qty.is_zero() {
            Decimal::ZERO
        } else {
            weighted / self.total_qty
        };
    }
}

/// Key for the in-memory index: one open position per (strategy, root) at
/// any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorKey {
    pub strategy_id: i64,
    pub symbol_root: String,
}

/// Outcome of applying an entry signal to the mirror.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// A brand-new position was opened.
    Opened(Position),
    /// An existing same-side position absorbed a DCA add.
    DcaAdded(Position),
    /// An opposite-side position was closed (and, if the signal was itself
    /// an entry, a new position opened in the new direction).
    Flipped { closed: Position, opened: Option<Position> },
}

pub struct PositionMirror {
    index: RwLock<HashMap<MirrorKey, Position>>,
    closed: RwLock<Vec<Position>>,
    ledger: Arc<TradeLedger>,
}

impl PositionMirror {
    pub fn new(ledger: Arc<TradeLedger>) -> Self {
        Self {
            index: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
            ledger,
        }
    }

    pub fn open_position_for(&self, strategy_id: i64, symbol_root: &str) -> Option<Position> {
        self.index
            .read()
            .get(&MirrorKey { strategy_id, symbol_root: symbol_root.to_string() })
            .cloned()
    }

    /// DCA aggregation contract: append an entry, recompute qty/avg, create
    /// a new open Trade row for this fill.
    fn dca_add(&self, position: &mut Position, price: Decimal, qty: Decimal, tp_price: Option<Decimal>, sl_price: Option<Decimal>) {
        position.entries.push(PositionEntry { price, qty, ts: Utc::now() });
        position.recompute_avg();
        let trade = Trade::open(
            position.strategy_id,
            position.id.clone(),
            position.symbol.clone(),
            position.side,
            qty,
            price,
            tp_price,
            sl_price,
        );
        self.ledger.insert(trade);
    }

    /// Apply a directional entry signal. `same_side_dca_enabled` gates
    /// whether a same-side signal on an already-open position DCAs or is
    /// treated as a same-direction reset by the caller (the execution
    /// engine decides that distinction; this method only ever DCAs when
    /// told to).
    pub fn apply_entry(
        &self,
        strategy_id: i64,
        symbol: &str,
        symbol_root: &str,
        side: Side,
        price: Decimal,
        qty: Decimal,
        dca_enabled: bool,
        tp_price: Option<Decimal>,
        sl_price: Option<Decimal>,
    ) -> ApplyOutcome {
        let key = MirrorKey { strategy_id, symbol_root: symbol_root.to_string() };
        let mut index = self.index.write();

        match index.get_mut(&key) {
            Some(existing) if existing.side == side && dca_enabled => {
                self.dca_add(existing, price, qty, tp_price, sl_price);
                ApplyOutcome::DcaAdded(existing.clone())
            }
            Some(existing) if existing.side != side => {
                // Opposite-direction contract.
                let mut closed = index.remove(&key).unwrap();
                self.close_internal(&mut closed, price, ExitReason::Flip);
                self.closed.write().push(closed.clone());

                let opened = self.new_position(strategy_id, symbol, symbol_root, side, price, qty, tp_price, sl_price);
                index.insert(key, opened.clone());
                ApplyOutcome::Flipped { closed, opened: Some(opened) }
            }
            Some(existing) => {
                // Same side, DCA disabled: caller already decided this is a
                // same-direction reset and will close-then-reopen itself;
                // expose the current row so it can do so.
                ApplyOutcome::DcaAdded(existing.clone())
            }
            None => {
                let opened = self.new_position(strategy_id, symbol, symbol_root, side, price, qty, tp_price, sl_price);
                index.insert(key, opened.clone());
                ApplyOutcome::Opened(opened)
            }
        }
    }

    fn new_position(
        &self,
        strategy_id: i64,
        symbol: &str,
        symbol_root: &str,
        side: Side,
        price: Decimal,
        qty: Decimal,
        tp_price: Option<Decimal>,
        sl_price: Option<Decimal>,
    ) -> Position {
        let id = new_id();
        let position = Position {
            id: id.clone(),
            strategy_id,
            symbol: symbol.to_string(),
            symbol_root: symbol_root.to_string(),
            side,
            total_qty: qty,
            avg_entry: price,
            entries: vec![PositionEntry { price, qty, ts: Utc::now() }],
            current_price: price,
            unrealized_pnl: Decimal::ZERO,
            worst_unrealized_pnl: Decimal::ZERO,
            best_unrealized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            exit_price: None,
            realized_pnl: None,
            opened_at: Utc::now(),
            closed_at: None,
        };
        let trade = Trade::open(strategy_id, id, symbol, side, qty, price, tp_price, sl_price);
        self.ledger.insert(trade);
        position
    }

    fn close_internal(&self, position: &mut Position, exit_price: Decimal, reason: ExitReason) {
        let direction = Decimal::from(position.side.direction());
        let realized = direction * (exit_price - position.avg_entry) * position.total_qty;
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.realized_pnl = Some(realized);
        position.closed_at = Some(Utc::now());
        self.ledger.close_all_for_position(&position.id, exit_price, reason);
    }

    /// Partial same-side reduction — a copy-trade TRIM. Scales every entry's
    /// qty down by the surviving ratio rather than attributing the reduced
    /// contracts to specific entries (FIFO); the Trade Ledger rows are left
    /// open since the position as a whole is still live. If `reduce_qty`
    /// consumes the whole position this degrades to a full `close`.
    pub fn reduce(&self, strategy_id: i64, symbol_root: &str, reduce_qty: Decimal, exit_price: Decimal, reason_if_fully_closed: ExitReason) -> Option<Position> {
        let key = MirrorKey { strategy_id, symbol_root: symbol_root.to_string() };
        let mut index = self.index.write();
        let total_qty = index.get(&key)?.total_qty;

        if reduce_qty >= total_qty {
            let mut closed = index.remove(&key)?;
            drop(index);
            self.close_internal(&mut closed, exit_price, reason_if_fully_closed);
            self.closed.write().push(closed.clone());
            return Some(closed);
        }

        let position = index.get_mut(&key)?;
        let ratio = (total_qty - reduce_qty) / total_qty;
        for entry in position.entries.iter_mut() {
            entry.qty *= ratio;
        }
        position.recompute_avg();
        Some(position.clone())
    }

    /// Overwrite an already-open row's side/qty/avg-entry to match broker
    /// truth when a `position` WS event reports values that diverge from
    /// what this mirror locally tracked (a missed fill, an execution-queue
    /// retry). Only ever touches a row that already exists — adopting a
    /// position the mirror never saw at all is the reconciliation loop's
    /// job, not a property of one WS event. Returns `false` if there was no
    /// open row to overwrite.
    pub fn reconcile_broker_truth(&self, strategy_id: i64, symbol_root: &str, side: Side, qty: Decimal, avg_entry: Decimal) -> bool {
        let key = MirrorKey { strategy_id, symbol_root: symbol_root.to_string() };
        let mut index = self.index.write();
        let Some(position) = index.get_mut(&key) else {
            return false;
        };
        position.side = side;
        position.total_qty = qty;
        position.avg_entry = avg_entry;
        position.entries = vec![PositionEntry { price: avg_entry, qty, ts: Utc::now() }];
        true
    }

    /// Close the open position for (strategy, root) outright — used for
    /// flatten signals and reconciliation-driven auto-flat.
    pub fn close(&self, strategy_id: i64, symbol_root: &str, exit_price: Decimal, reason: ExitReason) -> Option<Position> {
        let key = MirrorKey { strategy_id, symbol_root: symbol_root.to_string() };
        let mut index = self.index.write();
        let mut position = index.remove(&key)?;
        self.close_internal(&mut position, exit_price, reason);
        self.closed.write().push(position.clone());
        Some(position)
    }

    /// Unrealized-excursion contract. Coalesced: callers should only persist
    /// when this returns `true` (worst or best changed).
    pub fn apply_price_update(&self, strategy_id: i64, symbol_root: &str, price: Decimal) -> Option<bool> {
        let key = MirrorKey { strategy_id, symbol_root: symbol_root.to_string() };
        let mut index = self.index.write();
        let position = index.get_mut(&key)?;

        let tick = tick_size(symbol_root).ok()?;
        let value = tick_value(symbol_root).ok()?;
        let direction = Decimal::from(position.side.direction());
        let unrealized = direction * (price - position.avg_entry) * value / tick * position.total_qty;

        position.current_price = price;
        position.unrealized_pnl = unrealized;

        let mut changed = false;
        if unrealized < position.worst_unrealized_pnl {
            position.worst_unrealized_pnl = unrealized;
            changed = true;
        }
        if unrealized > position.best_unrealized_pnl {
            position.best_unrealized_pnl = unrealized;
            changed = true;
        }
        Some(changed)
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.index.read().values().cloned().collect()
    }

    pub fn closed_positions(&self, limit: usize) -> Vec<Position> {
        let closed = self.closed.read();
        let start = closed.len().saturating_sub(limit);
        closed[start..].to_vec()
    }

    /// Sum of realized P&L for this strategy's positions closed since UTC
    /// midnight. Used by the daily-loss-cap filter; a coarse in-memory
    /// figure, not an accounting-grade ledger.
    pub fn daily_realized_pnl(&self, strategy_id: i64) -> Decimal {
        let midnight = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        self.closed
            .read()
            .iter()
            .filter(|p| p.strategy_id == strategy_id)
            .filter(|p| p.closed_at.map(|t| t >= midnight).unwrap_or(false))
            .filter_map(|p| p.realized_pnl)
            .sum()
    }
}
