// =============================================================================
// Copy-Trade Propagator (C15)
// =============================================================================
//
// Consumes classified leader deltas (`crate::listeners::LeaderDelta`) and
// fans them out to followers in parallel. Followers are resolved at event
// time, never cached, and each is scaled by its own multiplier. Two-layer
// loop prevention: outgoing copy orders are tagged with a `CPY_` clOrdId
// prefix, and a short time-bounded dedup set catches fills the broker
// doesn't echo the tag back on.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::execution::{ExecutionEngine, ExecutionTask};
use crate::ids::now_millis;
use crate::listeners::LeaderDelta;
use crate::strategy_config::{EffectiveSettings, Trader};
use crate::types::{Side, SignalAction};

pub const COPY_ORDER_PREFIX: &str = "CPY_";
const DEDUP_WINDOW_MS: i64 = 10_000;

/// One recent copy fill fingerprint, used to suppress a leader fill the
/// broker echoes back without the `clOrdId` tag intact.
#[derive(Debug, Clone, PartialEq)]
struct CopyFingerprint {
    account_id: i64,
    symbol: String,
    side: Side,
    qty: Decimal,
    ts_ms: i64,
}

/// Time-bounded dedup set keyed by `(account, symbol, side, qty, ~ts)`.
pub struct CopyDedup {
    recent: Mutex<VecDeque<CopyFingerprint>>,
}

impl CopyDedup {
    pub fn new() -> Self {
        Self { recent: Mutex::new(VecDeque::new()) }
    }

    pub fn record(&self, account_id: i64, symbol: &str, side: Side, qty: Decimal, ts_ms: i64) {
        let mut recent = self.recent.lock();
        recent.push_back(CopyFingerprint { account_id, symbol: symbol.to_string(), side, qty, ts_ms });
        while recent.front().map(|f| ts_ms - f.ts_ms > DEDUP_WINDOW_MS).unwrap_or(false) {
            recent.pop_front();
        }
    }

    /// `true` if a matching fingerprint was recorded within the last 10s —
    /// this leader fill is our own copy order echoing back.
    pub fn is_recent_echo(&self, account_id: i64, symbol: &str, side: Side, qty: Decimal, now_ms: i64) -> bool {
        self.recent
            .lock()
            .iter()
            .any(|f| f.account_id == account_id && f.symbol == symbol && f.side == side && f.qty == qty && now_ms - f.ts_ms <= DEDUP_WINDOW_MS)
    }
}

impl Default for CopyDedup {
    fn default() -> Self {
        Self::new()
    }
}

pub fn tagged_cl_ord_id(base_id: &str) -> String {
    format!("{COPY_ORDER_PREFIX}{base_id}")
}

pub fn has_copy_prefix(cl_ord_id: &str) -> bool {
    cl_ord_id.starts_with(COPY_ORDER_PREFIX)
}

/// Resolves the follower set for a leader at propagation time, and whether
/// a given follower is also an active webhook-driven trader for the same
/// symbol (in which case it must be skipped — otherwise the fill arrives
/// twice).
pub trait FollowerResolver: Send + Sync {
    fn followers_of(&self, leader_account_id: i64) -> Vec<Trader>;
    fn is_webhook_driven_for_symbol(&self, account_id: i64, symbol_root: &str) -> bool;
    fn effective_settings_for(&self, trader: &Trader) -> EffectiveSettings;
}

pub struct CopyTradePropagator {
    resolver: Arc<dyn FollowerResolver>,
    engine: Arc<ExecutionEngine>,
    queue: Arc<crate::execution::queue::ExecutionQueue>,
    failures: Arc<crate::failures::FailuresFeed>,
    dedup: CopyDedup,
}

impl CopyTradePropagator {
    pub fn new(
        resolver: Arc<dyn FollowerResolver>,
        engine: Arc<ExecutionEngine>,
        queue: Arc<crate::execution::queue::ExecutionQueue>,
        failures: Arc<crate::failures::FailuresFeed>,
    ) -> Self {
        Self { resolver, engine, queue, failures, dedup: CopyDedup::new() }
    }

    /// Translate a classified leader delta into the `SignalAction` a
    /// follower's execution task should carry.
    fn delta_to_action(delta: &LeaderDelta) -> SignalAction {
        match delta {
            LeaderDelta::Entry { side, .. } | LeaderDelta::Add { side, .. } => {
                if *side == Side::Long {
                    SignalAction::Buy
                } else {
                    SignalAction::Sell
                }
            }
            LeaderDelta::Reversal { to_side, .. } => {
                if *to_side == Side::Long {
                    SignalAction::Buy
                } else {
                    SignalAction::Sell
                }
            }
            // TRIM is a partial same-side reduction, not a full liquidation —
            // routing it through Flatten would market-close a follower's
            // entire position over the leader trimming a fraction of theirs.
            LeaderDelta::Trim { .. } => SignalAction::Reduce,
            LeaderDelta::Close { .. } => SignalAction::Flatten,
        }
    }

    /// The leader's own unscaled delta quantity — each follower scales this
    /// by its own multiplier rather than using its configured `dca_qty`, so
    /// an ADD always mirrors the leader's actual size change.
    fn delta_qty(delta: &LeaderDelta) -> Decimal {
        match delta {
            LeaderDelta::Entry { qty, .. } => *qty,
            LeaderDelta::Add { added_qty, .. } => *added_qty,
            LeaderDelta::Trim { removed_qty, .. } => *removed_qty,
            LeaderDelta::Reversal { qty, .. } => *qty,
            LeaderDelta::Close { qty, .. } => *qty,
        }
    }

    /// Fan out one leader delta to every resolved follower, in parallel.
    /// One slow/failing follower never serializes the rest — each gets its
    /// own `JoinSet` task. Each follower's `ExecutionTask` carries its own
    /// `strategy_id` (not the leader's) since that's what keys its Mirror row.
    pub async fn propagate(&self, leader_account_id: i64, symbol: &str, symbol_root: &str, delta: LeaderDelta) {
        let followers = self.resolver.followers_of(leader_account_id);
        let action = Self::delta_to_action(&delta);
        let raw_qty = Self::delta_qty(&delta);

        let mut set = JoinSet::new();
        for trader in followers {
            if self.resolver.is_webhook_driven_for_symbol(trader.broker_account_id, symbol_root) {
                info!(account_id = trader.broker_account_id, symbol_root, "skipping copy-trade fan-out, account is webhook-driven for this symbol");
                continue;
            }

            let settings = self.resolver.effective_settings_for(&trader);
            let queue = self.queue.clone();
            let engine = self.engine.clone();
            let failures = self.failures.clone();
            let symbol = symbol.to_string();
            let symbol_root = symbol_root.to_string();
            let task = ExecutionTask {
                account_id: trader.broker_account_id,
                strategy_id: trader.strategy_id,
                settings,
                action,
                symbol: symbol.clone(),
                reference_price: Decimal::ZERO,
                requested_qty: Some(raw_qty),
                is_copy_follower: true,
                idempotency_key: format!("copy:{leader_account_id}:{}:{}", trader.broker_account_id, now_millis()),
            };

            set.spawn(async move {
                let budget = Duration::from_millis(50);
                let task_account_id = task.account_id;
                let task_symbol = task.symbol.clone();
                let enqueue_failures = failures.clone();
                match queue
                    .try_enqueue(
                        task.account_id,
                        &symbol_root,
                        budget,
                        Box::new(move || Box::pin(async move {
                            if let Err(err) = engine.execute(task).await {
                                warn!(error = %err, "copy-trade follower execution failed");
                                failures.record(task_account_id, task_symbol, err.classification(), err.to_string(), true);
                            }
                        })),
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(err) => {
                        warn!(error = %err, account_id = trader.broker_account_id, symbol, "failed to enqueue copy-trade follower task");
                        enqueue_failures.record(trader.broker_account_id, symbol.clone(), err.classification(), err.to_string(), true);
                    }
                }
            });
        }

        while set.join_next().await.is_some() {}
    }

    /// Called by the Position Listener for the leader's own account before
    /// forwarding a fill upward — suppresses a fill this propagator itself
    /// generated.
    pub fn should_suppress_leader_fill(&self, account_id: i64, symbol: &str, side: Side, qty: Decimal, cl_ord_id: Option<&str>) -> bool {
        if let Some(id) = cl_ord_id {
            if has_copy_prefix(id) {
                return true;
            }
        }
        self.dedup.is_recent_echo(account_id, symbol, side, qty, now_millis())
    }

    pub fn record_outgoing_copy_fill(&self, account_id: i64, symbol: &str, side: Side, qty: Decimal) {
        self.dedup.record(account_id, symbol, side, qty, now_millis());
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_cl_ord_id_carries_prefix() {
        let id = tagged_cl_ord_id("abc123");
        assert!(has_copy_prefix(&id));
        assert_eq!(id, "CPY_abc123");
    }

    #[test]
    fn untagged_id_has_no_prefix() {
        assert!(!has_copy_prefix("abc123"));
    }

    #[test]
    fn dedup_recognizes_matching_fingerprint_within_window() {
        use rust_decimal_macros::dec;
        let dedup = CopyDedup::new();
        dedup.record(1, "GC", Side::Long, dec!(2), 1_000);
        assert!(dedup.is_recent_echo(1, "GC", Side::Long, dec!(2), 5_000));
    }

    #[test]
    fn dedup_expires_after_window() {
        use rust_decimal_macros::dec;
        let dedup = CopyDedup::new();
        dedup.record(1, "GC", Side::Long, dec!(2), 0);
        assert!(!dedup.is_recent_echo(1, "GC", Side::Long, dec!(2), 20_000));
    }

    #[test]
    fn dedup_does_not_match_different_quantity() {
        use rust_decimal_macros::dec;
        let dedup = CopyDedup::new();
        dedup.record(1, "GC", Side::Long, dec!(2), 1_000);
        assert!(!dedup.is_recent_echo(1, "GC", Side::Long, dec!(3), 1_500));
    }
}
