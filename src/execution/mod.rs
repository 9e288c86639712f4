// =============================================================================
// Broker Execution Engine (C12)
// =============================================================================
//
// The heart of the system. A bounded worker pool (see `queue`) drains tasks
// fed by the webhook dispatcher and the copy-trade propagator. Each task is
// resolved against a decision table, first match wins: flatten > flip-close
// > DCA-add > same-direction-reset > bracket-entry.

pub mod queue;
pub mod tp_legs;

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use crate::broker::{BracketLeg, BracketOptions, BreakEvenPayload, BrokerClient, BrokerPosition, OrderFilter, StopLossPayload};
use crate::errors::ExecutionError;
use crate::instruments::root_of;
use crate::position_mirror::PositionMirror;
use crate::strategy_config::EffectiveSettings;
use crate::types::{ExitReason, OrderStatus, Side, SignalAction, StopKind};

/// One unit of work for the executor pool. Mirrors the task shape named in
/// the component design: account + resolved settings + the triggering
/// action, plus whatever the webhook payload carried for quantity.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub account_id: i64,
    pub strategy_id: i64,
    pub settings: EffectiveSettings,
    pub action: SignalAction,
    pub symbol: String,
    pub reference_price: Decimal,
    /// `Some` only if the webhook payload had a `qty` field present —
    /// field presence, never a value check, decides this (see
    /// `resolve_entry_qty`).
    pub requested_qty: Option<Decimal>,
    pub is_copy_follower: bool,
    pub idempotency_key: String,
}

pub struct ExecutionEngine {
    broker: Arc<dyn BrokerClient>,
    mirror: Arc<PositionMirror>,
}

impl ExecutionEngine {
    pub fn new(broker: Arc<dyn BrokerClient>, mirror: Arc<PositionMirror>) -> Self {
        Self { broker, mirror }
    }

    #[instrument(skip(self, task), fields(account_id = task.account_id, action = ?task.action, symbol = %task.symbol))]
    pub async fn execute(&self, task: ExecutionTask) -> Result<(), ExecutionError> {
        let root = root_of(&task.symbol)?;

        if let SignalAction::Reduce = task.action {
            let raw_qty = task
                .requested_qty
                .filter(|q| *q > Decimal::ZERO)
                .ok_or_else(|| ExecutionError::InvariantViolation("reduce action requires a positive quantity".to_string()))?;
            return self.reduce(&task, root, raw_qty * task.settings.multiplier).await;
        }

        if task.action.is_exit_only() {
            return self.flatten(&task, root).await;
        }

        let entry_side = task.action.entry_side().expect("non-exit action has an entry side");

        let broker_positions = self.broker.list_positions(task.account_id).await?;
        let existing = broker_positions.into_iter().find(|p| root_of(&p.symbol).map(|r| r == root).unwrap_or(false));

        match existing {
            Some(position) if position.side != entry_side => {
                self.flip_close(&task, root, &position).await?;
                self.bracket_entry(&task, root, entry_side, true).await
            }
            Some(position) if task.settings.dca_enabled => self.dca_add(&task, root, entry_side, &position).await,
            Some(position) => {
                self.cancel_resting(task.account_id, root).await?;
                self.broker.place_market(task.account_id, position.side.opposite(), position.qty, &task.symbol).await?;
                self.mirror.close(task.strategy_id, root, task.reference_price, ExitReason::Signal);
                self.bracket_entry(&task, root, entry_side, true).await
            }
            // `existing` is `None` because the `list_positions` call just
            // above already confirmed the account flat for this root --
            // don't make bracket_entry re-fetch that.
            None => self.bracket_entry(&task, root, entry_side, true).await,
        }
    }

    async fn flatten(&self, task: &ExecutionTask, root: &str) -> Result<(), ExecutionError> {
        self.cancel_resting(task.account_id, root).await?;
        let positions = self.broker.list_positions(task.account_id).await?;
        if let Some(position) = positions.into_iter().find(|p| root_of(&p.symbol).map(|r| r == root).unwrap_or(false)) {
            self.broker.place_market(task.account_id, position.side.opposite(), position.qty, &task.symbol).await?;
        }
        self.mirror.close(task.strategy_id, root, task.reference_price, ExitReason::Flatten);
        Ok(())
    }

    /// Partial same-side reduction (a copy-trade TRIM): market-close only
    /// `reduce_qty` of the existing position, leaving the rest and its
    /// working TPs/SL in place. A follower with no open position, or one
    /// smaller than `reduce_qty`, reduces by whatever is actually there.
    async fn reduce(&self, task: &ExecutionTask, root: &str, reduce_qty: Decimal) -> Result<(), ExecutionError> {
        let broker_positions = self.broker.list_positions(task.account_id).await?;
        let Some(position) = broker_positions.into_iter().find(|p| root_of(&p.symbol).map(|r| r == root).unwrap_or(false)) else {
            warn!("reduce requested but account already flat, nothing to do");
            return Ok(());
        };
        let qty = reduce_qty.min(position.qty);
        self.broker.place_market(task.account_id, position.side.opposite(), qty, &task.symbol).await?;
        self.mirror.reduce(task.strategy_id, root, qty, task.reference_price, ExitReason::Signal);
        Ok(())
    }

    async fn flip_close(&self, task: &ExecutionTask, root: &str, position: &BrokerPosition) -> Result<(), ExecutionError> {
        self.cancel_resting(task.account_id, root).await?;
        self.broker.place_market(task.account_id, position.side.opposite(), position.qty, &task.symbol).await?;
        self.mirror.close(task.strategy_id, root, task.reference_price, ExitReason::Flip);
        Ok(())
    }

    async fn dca_add(&self, task: &ExecutionTask, root: &str, side: Side, _position: &BrokerPosition) -> Result<(), ExecutionError> {
        // A copy-trade follower's add size comes from the leader's own delta,
        // scaled by this follower's multiplier — never its own `dca_qty`.
        // A direct webhook signal carries no `requested_qty` for an add, so
        // this falls through to the configured size exactly as before.
        let add_qty = match task.requested_qty {
            Some(q) if q > Decimal::ZERO => q * task.settings.multiplier,
            _ => task.settings.dca_qty * task.settings.multiplier,
        };
        self.broker.place_market(task.account_id, side, add_qty, &task.symbol).await?;

        let refreshed = self.broker.list_positions(task.account_id).await?;
        let Some(new_position) = refreshed.into_iter().find(|p| root_of(&p.symbol).map(|r| r == root).unwrap_or(false)) else {
            warn!("position vanished immediately after DCA market fill");
            return Err(ExecutionError::InvariantViolation("position missing after DCA fill".to_string()));
        };

        self.cancel_working_tps(task.account_id, root, side).await?;
        let legs = tp_legs::compute_tp_legs(new_position.avg_entry, side, root, new_position.qty, task.settings.multiplier, &task.settings.tp_targets)?;
        for leg in &legs {
            self.broker.place_limit(task.account_id, side.opposite(), leg.qty, &task.symbol, leg.price).await?;
        }

        self.mirror.apply_entry(
            task.strategy_id,
            &task.symbol,
            root,
            side,
            task.reference_price,
            add_qty,
            true,
            legs.first().map(|l| l.price),
            None,
        );
        Ok(())
    }

    async fn bracket_entry(&self, task: &ExecutionTask, root: &str, side: Side, already_flat_checked: bool) -> Result<(), ExecutionError> {
        let mut qty = resolve_entry_qty(task.requested_qty, &task.settings);

        if !already_flat_checked {
            let broker_positions = self.broker.list_positions(task.account_id).await?;
            let broker_flat = !broker_positions.iter().any(|p| root_of(&p.symbol).map(|r| r == root).unwrap_or(false));
            qty = apply_quantity_safety_net(qty, broker_flat, &task.settings);
        }

        let legs = tp_legs::compute_tp_legs(task.reference_price, side, root, qty, task.settings.multiplier, &task.settings.tp_targets)?;

        let sl = if task.settings.sl.enabled {
            Some(resolve_stop_loss(task.reference_price, side, root, &task.settings)?)
        } else {
            None
        };

        let break_even = if task.settings.break_even.enabled && task.settings.sl.kind != StopKind::Trailing {
            Some(BreakEvenPayload { ticks: task.settings.break_even.ticks, offset: task.settings.break_even.offset })
        } else {
            None
        };

        let result = self
            .broker
            .place_bracket_order(task.account_id, side, qty, &task.symbol, &legs, sl, BracketOptions { break_even })
            .await?;

        info!(entry_id = %result.entry_id, leg_count = legs.len(), "bracket entry placed");

        self.mirror.apply_entry(
            task.strategy_id,
            &task.symbol,
            root,
            side,
            task.reference_price,
            qty,
            task.settings.dca_enabled,
            legs.first().map(|l| l.price),
            sl_price_of(&sl),
        );
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

    /// Cancel every working TP for `symbol_root`/`side` on this account,
    /// enumerated from the broker (never from the local DB — DB TP ids are
    /// not scoped by account).
    async fn cancel_working_tps(&self, account_id: i64, root: &str, side: Side) -> Result<(), ExecutionError> {
        let open = self
            .broker
            .list_orders(account_id, OrderFilter { symbol_root: Some(root), side: Some(side.opposite()), statuses: &[OrderStatus::Accepted, OrderStatus::Working] })
            .await?;
        for order in open {
            self.broker.cancel(account_id, &order.broker_order_id).await?;
        }
        Ok(())
    }
}

fn sl_price_of(sl: &Option<StopLossPayload>) -> Option<Decimal> {
    match sl {
        Some(StopLossPayload::Fixed { price }) => Some(*price),
        _ => None,
    }
}

fn resolve_stop_loss(entry: Decimal, side: Side, root: &str, settings: &EffectiveSettings) -> Result<StopLossPayload, ExecutionError> {
    let direction = Decimal::from(side.direction());
    match settings.sl.kind {
        StopKind::Fixed => {
            let distance_price = distance_to_price(entry, root, settings.sl.distance, settings.sl.unit)?;
            let price = crate::instruments::round_to_tick(entry - direction * distance_price, root)?;
            Ok(StopLossPayload::Fixed { price })
        }
        StopKind::Trailing => {
            let trigger = settings.sl.trail_trigger.unwrap_or(settings.sl.distance);
            let freq = settings.sl.trail_frequency_secs.unwrap_or(30);
            Ok(StopLossPayload::Trailing { trigger_distance: trigger, frequency_secs: freq })
        }
    }
}

fn distance_to_price(entry: Decimal, root: &str, value: Decimal, unit: crate::types::DistanceUnit) -> Result<Decimal, ExecutionError> {
    use crate::types::DistanceUnit;
    Ok(match unit {
        DistanceUnit::Ticks => value * crate::instruments::tick_size(root)?,
        DistanceUnit::Points => value,
        DistanceUnit::Percent => entry * value / Decimal::from(100),
    })
}

/// Whether the webhook supplied a quantity is decided by field presence
/// (`Option`), not by its value — a webhook may legitimately send `qty: 1`.
pub fn resolve_entry_qty(requested_qty: Option<Decimal>, settings: &EffectiveSettings) -> Decimal {
    match requested_qty {
        Some(q) if q > Decimal::ZERO => q * settings.multiplier,
        _ => settings.initial_qty * settings.multiplier,
    }
}

/// Quantity safety net: when the broker reports flat and the resolved
/// quantity disagrees with `initial_qty · multiplier`, trust the broker.
/// `initial_qty` itself may legitimately be configured to `0` (meaning "use
/// the webhook-supplied quantity"), so this only ever overrides toward the
/// strategy's own configured size, never toward a truthy-zero default.
pub fn apply_quantity_safety_net(resolved_qty: Decimal, broker_flat: bool, settings: &EffectiveSettings) -> Decimal {
    let configured = settings.initial_qty * settings.multiplier;
    if broker_flat && configured > Decimal::ZERO && resolved_qty != configured {
        configured
    } else {
        resolved_qty
    }
}


#[cfg(test)]
mod scenario_tests {
    use super::*;
    use crate::broker::{BracketLeg, BracketOptions, BracketOrderResult, BrokerPosition, OrderRef, StopLossPayload};
    use crate::strategy_config::{BreakEvenConfig, Distance, FilterSet, StopLossConfig, Trim, TpTarget};
    use crate::trade_ledger::TradeLedger;
    use crate::types::{DistanceUnit, OrderKind, StopKind, TrimUnit};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    /// In-memory broker double that tracks one open position and a set of
    /// resting orders per account, enough to drive the execution engine
    /// through its full decision table without a real venue behind it.
    struct FakeBroker {
        positions: Mutex<HashMap<i64, BrokerPosition>>,
        orders: Mutex<Vec<OrderRef>>,
        next_id: Mutex<u64>,
    }

    impl FakeBroker {
        fn new() -> Self {
            Self { positions: Mutex::new(HashMap::new()), orders: Mutex::new(Vec::new()), next_id: Mutex::new(1) }
        }

        fn seed_position(&self, account_id: i64, symbol: &str, side: Side, qty: Decimal, avg_entry: Decimal) {
            self.positions.lock().insert(account_id, BrokerPosition { symbol: symbol.to_string(), side, qty, avg_entry });
        }

        fn seed_working_tp(&self, account_id: i64, symbol: &str, side: Side, qty: Decimal, price: Decimal) {
            let id = self.next_order_id();
            self.orders.lock().push(OrderRef {
                broker_order_id: id,
                broker_account_id: account_id,
                kind: OrderKind::TpLimit,
                symbol: symbol.to_string(),
                side,
                qty,
                price: Some(price),
                status: OrderStatus::Working,
            });
        }

        fn next_order_id(&self) -> String {
            let mut n = self.next_id.lock();
            *n += 1;
            format!("o{n}")
        }

        fn working_tps_for(&self, account_id: i64) -> Vec<OrderRef> {
            self.orders.lock().iter().filter(|o| o.broker_account_id == account_id && o.status == OrderStatus::Working).cloned().collect()
        }
    }

    #[async_trait]
    impl BrokerClient for FakeBroker {
        async fn place_bracket_order(
            &self,
            account_id: i64,
            side: Side,
            qty: Decimal,
            symbol: &str,
            legs: &[BracketLeg],
            sl: Option<StopLossPayload>,
            _options: BracketOptions,
        ) -> Result<BracketOrderResult, ExecutionError> {
            self.positions.lock().insert(account_id, BrokerPosition { symbol: symbol.to_string(), side, qty, avg_entry: dec!(0) });
            let mut leg_ids = Vec::new();
            for leg in legs {
                let id = self.next_order_id();
                self.orders.lock().push(OrderRef {
                    broker_order_id: id.clone(),
                    broker_account_id: account_id,
                    kind: OrderKind::TpLimit,
                    symbol: symbol.to_string(),
                    side: side.opposite(),
                    qty: leg.qty,
                    price: Some(leg.price),
                    status: OrderStatus::Working,
                });
                leg_ids.push(id);
            }
            let sl_id = sl.map(|_| self.next_order_id());
            Ok(BracketOrderResult { entry_id: self.next_order_id(), leg_ids, sl_id })
        }

        async fn place_market(&self, account_id: i64, side: Side, qty: Decimal, symbol: &str) -> Result<String, ExecutionError> {
            let mut positions = self.positions.lock();
            match positions.get(&account_id) {
                Some(existing) if existing.side == side.opposite() && existing.qty == qty => {
                    positions.remove(&account_id);
                }
                Some(existing) if existing.side == side.opposite() => {
                    // partial reduce, not exercised by these scenarios but kept honest
                    let remaining = existing.qty - qty;
                    let avg = existing.avg_entry;
                    positions.insert(account_id, BrokerPosition { symbol: symbol.to_string(), side: existing.side, qty: remaining, avg_entry: avg });
                }
                Some(existing) if existing.side == side => {
                    // same-side add: combine quantity, keep the pre-add average
                    // (a real venue reports the true blended fill price; this
                    // double only needs a consistent qty for the scenarios it drives)
                    let combined_qty = existing.qty + qty;
                    let avg = existing.avg_entry;
                    positions.insert(account_id, BrokerPosition { symbol: symbol.to_string(), side, qty: combined_qty, avg_entry: avg });
                }
                _ => {
                    positions.insert(account_id, BrokerPosition { symbol: symbol.to_string(), side, qty, avg_entry: dec!(0) });
                }
            }
            Ok(self.next_order_id())
        }

        async fn place_limit(&self, account_id: i64, side: Side, qty: Decimal, symbol: &str, price: Decimal) -> Result<String, ExecutionError> {
            let id = self.next_order_id();
            self.orders.lock().push(OrderRef {
                broker_order_id: id.clone(),
                broker_account_id: account_id,
                kind: OrderKind::TpLimit,
                symbol: symbol.to_string(),
                side,
                qty,
                price: Some(price),
                status: OrderStatus::Working,
            });
            Ok(id)
        }

        async fn cancel(&self, _account_id: i64, order_id: &str) -> Result<(), ExecutionError> {
            let mut orders = self.orders.lock();
            if let Some(order) = orders.iter_mut().find(|o| o.broker_order_id == order_id) {
                order.status = OrderStatus::Canceled;
            }
            Ok(())
        }

        async fn list_orders(&self, account_id: i64, filter: OrderFilter<'_>) -> Result<Vec<OrderRef>, ExecutionError> {
            Ok(self
                .orders
                .lock()
                .iter()
                .filter(|o| o.broker_account_id == account_id)
                .filter(|o| filter.symbol_root.map(|r| root_of(&o.symbol).map(|x| x == r).unwrap_or(false)).unwrap_or(true))
                .filter(|o| filter.side.map(|s| o.side == s).unwrap_or(true))
                .filter(|o| filter.statuses.contains(&o.status))
                .cloned()
                .collect())
        }

        async fn list_positions(&self, account_id: i64) -> Result<Vec<BrokerPosition>, ExecutionError> {
            Ok(self.positions.lock().get(&account_id).cloned().into_iter().collect())
        }

        async fn refresh_auth(&self, _account_id: i64) -> Result<DateTime<Utc>, ExecutionError> {
            Ok(Utc::now())
        }
    }

    fn contracts_leg(ticks: Decimal, contracts: Decimal) -> TpTarget {
        TpTarget {
            distance: Distance { value: ticks, unit: DistanceUnit::Ticks },
            trim: Trim { value: contracts, unit: TrimUnit::Contracts },
        }
    }

    fn engine(broker: Arc<FakeBroker>) -> (ExecutionEngine, Arc<PositionMirror>) {
        let mirror = Arc::new(PositionMirror::new(Arc::new(TradeLedger::new())));
        (ExecutionEngine::new(broker, mirror.clone()), mirror)
    }

    fn base_settings(root: &str) -> EffectiveSettings {
        EffectiveSettings {
            symbol_root: root.to_string(),
            initial_qty: dec!(2),
            dca_qty: dec!(2),
            dca_enabled: true,
            tp_targets: vec![contracts_leg(dec!(20), dec!(1)), contracts_leg(dec!(40), dec!(1))],
            sl: StopLossConfig { enabled: true, distance: dec!(50), unit: DistanceUnit::Ticks, kind: StopKind::Fixed, trail_trigger: None, trail_frequency_secs: None },
            break_even: BreakEvenConfig { enabled: false, ticks: dec!(0), offset: dec!(0) },
            filters: FilterSet::default(),
            multiplier: dec!(3),
        }
    }

    /// Scenario 1: fresh long entry, two TP legs.
    #[tokio::test]
    async fn fresh_long_entry_places_bracket_with_two_tp_legs_and_fixed_stop() {
        let broker = Arc::new(FakeBroker::new());
        let (engine, mirror) = engine(broker.clone());

        let task = ExecutionTask {
            account_id: 1,
            strategy_id: 1,
            settings: base_settings("MNQ"),
            action: SignalAction::Buy,
            symbol: "MNQZ5".to_string(),
            reference_price: dec!(21500),
            requested_qty: None,
            is_copy_follower: false,
            idempotency_key: "k1".to_string(),
        };
        engine.execute(task).await.unwrap();

        let tps = broker.working_tps_for(1);
        assert_eq!(tps.len(), 2);
        assert_eq!(tps[0].price, Some(dec!(21505.00)));
        assert_eq!(tps[0].qty, dec!(3));
        assert_eq!(tps[1].price, Some(dec!(21510.00)));
        assert_eq!(tps[1].qty, dec!(3));

        let position = mirror.open_position_for(1, "MNQ").unwrap();
        assert_eq!(position.total_qty, dec!(6));
        assert_eq!(position.avg_entry, dec!(21500));
    }

    /// Scenario 2: DCA add recomputes the average and replaces working TPs.
    #[tokio::test]
    async fn dca_add_recomputes_average_and_replaces_tps() {
        let broker = Arc::new(FakeBroker::new());
        broker.seed_position(1, "MNQZ5", Side::Long, dec!(2), dec!(21500));
        broker.seed_working_tp(1, "MNQZ5", Side::Short, dec!(2), dec!(21505));

        let (engine, mirror) = engine(broker.clone());
        mirror.apply_entry(1, "MNQZ5", "MNQ", Side::Long, dec!(21500), dec!(2), true, Some(dec!(21505)), None);

        let mut settings = base_settings("MNQ");
        settings.tp_targets = vec![contracts_leg(dec!(10), dec!(4))];
        settings.multiplier = dec!(1);

        let task = ExecutionTask {
            account_id: 1,
            strategy_id: 1,
            settings,
            action: SignalAction::Buy,
            symbol: "MNQZ5".to_string(),
            reference_price: dec!(21490),
            requested_qty: None,
            is_copy_follower: false,
            idempotency_key: "k2".to_string(),
        };
        engine.execute(task).await.unwrap();

        let position = broker.positions.lock().get(&1).cloned().unwrap();
        assert_eq!(position.qty, dec!(4));

        let tps = broker.working_tps_for(1);
        assert_eq!(tps.len(), 1);
        assert_eq!(tps[0].qty, dec!(4));

        let mirrored = mirror.open_position_for(1, "MNQ").unwrap();
        assert_eq!(mirrored.total_qty, dec!(4));
        assert_eq!(mirrored.avg_entry, dec!(21495));
    }

    /// Scenario 3: flip close cancels resting orders and opens the opposite side.
    #[tokio::test]
    async fn flip_close_cancels_resting_orders_and_opens_opposite_side() {
        let broker = Arc::new(FakeBroker::new());
        broker.seed_position(10, "GCJ6", Side::Long, dec!(3), dec!(2000));
        broker.seed_working_tp(10, "GCJ6", Side::Short, dec!(3), dec!(2020));

        let (engine, mirror) = engine(broker.clone());
        mirror.apply_entry(1, "GCJ6", "GC", Side::Long, dec!(2000), dec!(3), true, Some(dec!(2020)), None);

        let mut settings = base_settings("GC");
        settings.tp_targets = vec![contracts_leg(dec!(20), dec!(1))];
        settings.multiplier = dec!(1);
        settings.initial_qty = dec!(1);

        let task = ExecutionTask {
            account_id: 10,
            strategy_id: 1,
            settings,
            action: SignalAction::Sell,
            symbol: "GCJ6".to_string(),
            reference_price: dec!(2010),
            requested_qty: None,
            is_copy_follower: false,
            idempotency_key: "k3".to_string(),
        };
        engine.execute(task).await.unwrap();

        // the old long's TP was canceled, not left resting
        let canceled_old_tp = broker.orders.lock().iter().any(|o| o.side == Side::Short && o.status == OrderStatus::Canceled);
        assert!(canceled_old_tp);

        let position = broker.positions.lock().get(&10).cloned().unwrap();
        assert_eq!(position.side, Side::Short);

        let mirrored = mirror.open_position_for(1, "GC").unwrap();
        assert_eq!(mirrored.side, Side::Short);
    }

    /// Scenario 4: same-direction reset with DCA off trusts broker-truth
    /// quantity over a stale configured DCA size.
    #[tokio::test]
    async fn same_direction_reset_with_dca_off_uses_configured_initial_qty() {
        let broker = Arc::new(FakeBroker::new());
        // broker is actually flat; nothing seeded into `broker.positions`.

        let (engine, _mirror) = engine(broker.clone());

        let mut settings = base_settings("GC");
        settings.dca_enabled = false;
        settings.initial_qty = dec!(3);
        settings.multiplier = dec!(1);
        settings.tp_targets = vec![contracts_leg(dec!(20), dec!(1))];

        let task = ExecutionTask {
            account_id: 20,
            strategy_id: 1,
            settings,
            action: SignalAction::Buy,
            symbol: "GCJ6".to_string(),
            reference_price: dec!(2000),
            requested_qty: Some(dec!(1)),
            is_copy_follower: false,
            idempotency_key: "k4".to_string(),
        };
        engine.execute(task).await.unwrap();

        let position = broker.positions.lock().get(&20).cloned().unwrap();
        assert_eq!(position.qty, dec!(3));
    }
}
