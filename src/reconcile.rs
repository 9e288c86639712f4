// =============================================================================
// Reconciliation Loop (C13)
// =============================================================================
//
// Runs every 300s per account. WS is primary; this loop is the safety net,
// not the primary state path — the 300s interval is a deliberate slowdown
// from earlier aggressive polling. Unlike a read-only drift-logger, this
// reconciler actively repairs: it market-closes positions past an auto-flat
// cutoff and replaces missing/duplicate take-profit orders.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Utc};
use tracing::{info, instrument, warn};

use crate::broker::{BrokerClient, OrderFilter};
use crate::errors::ExecutionError;
use crate::execution::tp_legs::compute_tp_legs;
use crate::instruments::root_of;
use crate::position_mirror::PositionMirror;
use crate::strategy_config::EffectiveSettings;
use crate::types::{ExitReason, OrderStatus};

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

/// One account's reconciliation target: which strategy it belongs to (for
/// Mirror keys), its resolved settings, and its auto-flat cutoff for the
/// current session, if any.
pub struct ReconcileTarget {
    pub account_id: i64,
    pub strategy_id: i64,
    pub settings: EffectiveSettings,
    pub auto_flat_cutoff: Option<NaiveTime>,
}

/// Tells the reconciler whether the Position Listener currently holds a
/// live WS subscription for a strategy — when it does, missing-TP repair is
/// skipped so the reconciler doesn't race the listener and create
/// duplicate TP orders.
pub trait ListenerConnectivity: Send + Sync {
    fn is_connected(&self, strategy_id: i64) -> bool;
}

pub struct ReconcileLoop {
    broker: Arc<dyn BrokerClient>,
    mirror: Arc<PositionMirror>,
    connectivity: Arc<dyn ListenerConnectivity>,
}

impl ReconcileLoop {
    pub fn new(broker: Arc<dyn BrokerClient>, mirror: Arc<PositionMirror>, connectivity: Arc<dyn ListenerConnectivity>) -> Self {
        Self { broker, mirror, connectivity }
    }

    #[instrument(skip(self, target), fields(account_id = target.account_id, strategy_id = target.strategy_id))]
    pub async fn reconcile_account(&self, target: &ReconcileTarget) -> Result<(), ExecutionError> {
        let root: &str = target.settings.symbol_root.as_str();

        // Step 1: align Mirror rows with broker truth.
        let broker_positions = self.broker.list_positions(target.account_id).await?;
        let broker_position = broker_positions.iter().find(|p| root_of(&p.symbol).map(|r| r == root).unwrap_or(false));

        match (self.mirror.open_position_for(target.strategy_id, root), broker_position) {
            (Some(_mirror_pos), None) => {
                info!("mirror had an open row the broker reports flat; closing to align");
                self.mirror.close(target.strategy_id, root, rust_decimal::Decimal::ZERO, ExitReason::Manual);
            }
            (None, Some(bp)) => {
                info!("broker reports an open position the mirror never saw; adopting it");
                self.mirror.apply_entry(target.strategy_id, &bp.symbol, root, bp.side, bp.avg_entry, bp.qty, false, None, None);
            }
            _ => {}
        }

        // Step 2: auto-flat enforcement.
        if let Some(cutoff) = target.auto_flat_cutoff {
            if Utc::now().time() >= cutoff {
                if let Some(bp) = broker_position {
                    warn!("auto-flat cutoff passed with an open broker position; market-closing");
                    self.cancel_resting(target.account_id, root).await?;
                    self.broker.place_market(target.account_id, bp.side.opposite(), bp.qty, &bp.symbol).await?;
                    self.mirror.close(target.strategy_id, root, bp.avg_entry, ExitReason::Flatten);
                } else {
                    // No open position, but same-day pending brackets (a
                    // resting entry that hasn't filled yet) must also be
                    // canceled — see SPEC_FULL.md Open Question 3.
                    self.cancel_resting(target.account_id, root).await?;
                }
                return Ok(());
            }
        }

        let Some(bp) = broker_position else {
            return Ok(());
        };

        // Step 3: missing-TP repair, skipped while the listener is live.
        if self.connectivity.is_connected(target.strategy_id) {
            return Ok(());
        }

        let working_tps = self
            .broker
            .list_orders(target.account_id, OrderFilter { symbol_root: Some(root), side: Some(bp.side.opposite()), statuses: &[OrderStatus::Accepted, OrderStatus::Working] })
            .await?;

        if working_tps.is_empty() && !target.settings.tp_targets.is_empty() {
            warn!("no working take-profits found for an open position; replacing");
            let legs = compute_tp_legs(bp.avg_entry, bp.side, root, bp.qty, target.settings.multiplier, &target.settings.tp_targets)?;
            for leg in &legs {
                self.broker.place_limit(target.account_id, bp.side.opposite(), leg.qty, &bp.symbol, leg.price).await?;
            }
        } else if working_tps.len() > target.settings.tp_targets.len().max(1) {
            // Step 4: duplicate-TP repair — cancel all but the first.
            warn!(found = working_tps.len(), expected = target.settings.tp_targets.len(), "duplicate take-profit orders found; canceling extras");
            for order in working_tps.iter().skip(1) {
                self.broker.cancel(target.account_id, &order.broker_order_id).await?;
            }
        }

        Ok(())
    }

    async fn cancel_resting(&self, account_id: i64, root: &str) -> Result<(), ExecutionError> {
        let open = self
            .broker
            .list_orders(account_id, OrderFilter { symbol_root: Some(root), side: None, statuses: &[OrderStatus::Accepted, OrderStatus::Working] })
            .await?;
        for order in open {
            self.broker.cancel(account_id, &order.broker_order_id).await?;
        }
        Ok(())
    }

    /// Run one sweep across every target, in sequence — each call is
    /// already a handful of REST round-trips; running accounts concurrently
    /// here would just move the 300s interval's load spike earlier without
    /// reducing the total broker call volume.
    pub async fn run_sweep(&self, targets: &[ReconcileTarget]) {
        for target in targets {
            if let Err(err) = self.reconcile_account(target).await {
                warn!(account_id = target.account_id, error = %err, "reconciliation sweep failed for account");
            }
        }
    }
}
