// =============================================================================
// Trade Ledger (C5) — per-fill trade records within a Position
// =============================================================================
//
// One Position may contain many Trades (one per DCA add). A Trade tracks its
// own entry, its favorable/adverse excursion, and — once closed — its exit
// price, timestamp, and reason. Persisted; also indexed in-memory by
// position_id for O(1) lookup from WS fill events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::new_id;
use crate::types::{ExitReason, Side, TradeStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub strategy_id: i64,
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub entry_ts: DateTime<Utc>,
    pub exit_price: Option<Decimal>,
    pub exit_ts: Option<DateTime<Utc>>,
    pub tp_price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    pub max_favorable: Decimal,
    pub max_adverse: Decimal,
    pub status: TradeStatus,
    pub exit_reason: Option<ExitReason>,
}

impl Trade {
    pub fn open(
        strategy_id: i64,
        position_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        qty: Decimal,
        entry_price: Decimal,
        tp_price: Option<Decimal>,
        sl_price: Option<Decimal>,
    ) -> Self {
        Self {
            id: new_id(),
            strategy_id,
            position_id: position_id.into(),
            symbol: symbol.into(),
            side,
            qty,
            entry_price,
            entry_ts: Utc::now(),
            exit_price: None,
            exit_ts: None,
            tp_price,
            sl_price,
            max_favorable: Decimal::ZERO,
            max_adverse: Decimal::ZERO,
            status: TradeStatus::Open,
            exit_reason: None,
        }
    }

    /// Update favorable/adverse excursion from a per-unit price move already
    /// signed in the trade's favor (positive = favorable).
    pub fn record_excursion(&mut self, signed_pnl_per_unit: Decimal) {
        let excursion = signed_pnl_per_unit * self.qty;
        if excursion > self.max_favorable {
            self.max_favorable = excursion;
        }
        if excursion < -self.max_adverse {
            self.max_adverse = -excursion;
        }
    }

    pub fn close(&mut self, exit_price: Decimal, reason: ExitReason) {
        self.exit_price = Some(exit_price);
        self.exit_ts = Some(Utc::now());
        self.status = TradeStatus::Closed;
        self.exit_reason = Some(reason);
    }
}

/// Persisted ledger of trades with an in-memory index by position_id,
/// rebuilt at startup by scanning open rows.
pub struct TradeLedger {
    trades: RwLock<HashMap<String, Trade>>,
    by_position: RwLock<HashMap<String, Vec<String>>>,
}

impl TradeLedger {
    pub fn new() -> Self {
        Self {
            trades: RwLock::new(HashMap::new()),
            by_position: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, trade: Trade) -> String {
        let id = trade.id.clone();
        self.by_position
            .write()
            .entry(trade.position_id.clone())
            .or_default()
            .push(id.clone());
        self.trades.write().insert(id.clone(), trade);
        id
    }

    pub fn get(&self, id: &str) -> Option<Trade> {
        self.trades.read().get(id).cloned()
    }

    pub fn update<F: FnOnce(&mut Trade)>(&self, id: &str, f: F) -> bool {
        let mut trades = self.trades.write();
        match trades.get_mut(id) {
            Some(trade) => {
                f(trade);
                true
            }
            None => false,
        }
    }

    pub fn trades_for_position(&self, position_id: &str) -> Vec<Trade> {
        let ids = self.by_position.read().get(position_id).cloned().unwrap_or_default();
        let trades = self.trades.read();
        ids.iter().filter_map(|id| trades.get(id).cloned()).collect()
    }

    pub fn close_all_for_position(&self, position_id: &str, exit_price: Decimal, reason: ExitReason) {
        let ids = self.by_position.read().get(position_id).cloned().unwrap_or_default();
        let mut trades = self.trades.write();
        for id in ids {
            if let Some(trade) = trades.get_mut(&id) {
                if trade.status == TradeStatus::Open {
                    trade.close(exit_price, reason);
                }
            }
        }
    }
}

impl Default for TradeLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn closed_trade_has_exit_fields_set() {
        let mut trade = Trade::open(1, "pos-1", "GC", Side::Long, dec!(2), dec!(2000), None, None);
        trade.close(dec!(2010), ExitReason::Tp);
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_price, Some(dec!(2010)));
        assert!(trade.exit_ts.is_some());
        assert_eq!(trade.exit_reason, Some(ExitReason::Tp));
    }

    #[test]
    fn excursion_tracks_best_and_worst_independently() {
        let mut trade = Trade::open(1, "pos-1", "GC", Side::Long, dec!(1), dec!(2000), None, None);
        trade.record_excursion(dec!(5));
        trade.record_excursion(dec!(-3));
        trade.record_excursion(dec!(2));
        assert_eq!(trade.max_favorable, dec!(5));
        assert_eq!(trade.max_adverse, dec!(3));
    }

    #[test]
    fn ledger_close_all_for_position_only_touches_open_trades() {
        let ledger = TradeLedger::new();
        let t1 = Trade::open(1, "pos-1", "GC", Side::Long, dec!(1), dec!(2000), None, None);
        let mut t2 = Trade::open(1, "pos-1", "GC", Side::Long, dec!(1), dec!(2005), None, None);
        t2.close(dec!(2010), ExitReason::Manual);
        let t2_id = t2.id.clone();
        ledger.insert(t1);
        ledger.insert(t2);

        ledger.close_all_for_position("pos-1", dec!(2020), ExitReason::Flip);

        let trades = ledger.trades_for_position("pos-1");
        assert_eq!(trades.len(), 2);
        let already_closed = ledger.get(&t2_id).unwrap();
        // Pre-closed trade keeps its original reason, not overwritten.
        assert_eq!(already_closed.exit_reason, Some(ExitReason::Manual));
    }
}
