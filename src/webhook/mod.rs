// =============================================================================
// Webhook Dispatcher (C11)
// =============================================================================
//
// `POST /webhook/:token`. Ten-step pipeline: parse, dedup, resolve
// strategy, filter chain, resolve accounts + overlay, build risk config,
// quantity pre-compute, enqueue (50ms budget), fire-and-forget paper-trade
// hook, respond. The handler itself never blocks on a broker call — it only
// ever touches in-memory state and the bounded execution queue.

pub mod filters;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Timelike;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::execution::{ExecutionEngine, ExecutionTask};
use crate::failures::FailuresFeed;
use crate::ids::now_millis;
use crate::position_mirror::PositionMirror;
use crate::signals::{ParsedSignal, SignalStore};
use crate::types::SignalAction;

use filters::{evaluate, FilterState};
use registry::StrategyRegistry;

const ENQUEUE_BUDGET: Duration = Duration::from_millis(50);

/// Accept a decimal-bearing JSON value whether the sender sent it as a
/// string (preferred, lossless) or a bare JSON number.
fn decimal_from_value(value: &Value) -> Option<Decimal> {
    if let Some(s) = value.as_str() {
        return s.parse().ok();
    }
    if let Some(f) = value.as_f64() {
        return Decimal::from_f64_retain(f);
    }
    None
}

pub struct WebhookState {
    pub registry: Arc<StrategyRegistry>,
    pub signal_store: Arc<SignalStore>,
    pub mirror: Arc<PositionMirror>,
    pub engine: Arc<ExecutionEngine>,
    pub queue: Arc<crate::execution::queue::ExecutionQueue>,
    pub failures: Arc<FailuresFeed>,
    filter_states: RwLock<HashMap<i64, Arc<FilterState>>>,
}

impl WebhookState {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        signal_store: Arc<SignalStore>,
        mirror: Arc<PositionMirror>,
        engine: Arc<ExecutionEngine>,
        queue: Arc<crate::execution::queue::ExecutionQueue>,
        failures: Arc<FailuresFeed>,
    ) -> Self {
        Self { registry, signal_store, mirror, engine, queue, failures, filter_states: RwLock::new(HashMap::new()) }
    }

    fn filter_state_for(&self, strategy_id: i64) -> Arc<FilterState> {
        if let Some(existing) = self.filter_states.read().get(&strategy_id) {
            return existing.clone();
        }
        let mut states = self.filter_states.write();
        states.entry(strategy_id).or_insert_with(|| Arc::new(FilterState::new())).clone()
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub deduped: bool,
    pub accepted_accounts: usize,
}

pub fn router(state: Arc<WebhookState>) -> axum::Router {
    axum::Router::new().route("/webhook/:token", axum::routing::post(handle_webhook)).with_state(state)
}

#[instrument(skip(state, body), fields(token = %token))]
async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    Path(token): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<WebhookResponse>, StatusCode> {
    // Step 1: parse. `action` and `symbol` are required; everything else is
    // tolerated as extra/advisory.
    let action_raw = body.get("action").and_then(Value::as_str).ok_or(StatusCode::BAD_REQUEST)?;
    let symbol = body.get("symbol").and_then(Value::as_str).ok_or(StatusCode::BAD_REQUEST)?.to_string();
    let action = SignalAction::parse(action_raw).ok_or(StatusCode::BAD_REQUEST)?;
    let price = body.get("price").and_then(decimal_from_value);
    // Field presence, not value, decides whether a quantity was supplied —
    // `qty` stays `Some(0)` if that's literally what was sent. Senders vary
    // on the field name; try each alias in order and take the first present.
    let qty = ["qty", "quantity", "contracts", "size"]
        .iter()
        .find_map(|field| body.get(*field).and_then(decimal_from_value));

    let parsed = ParsedSignal { action, symbol: symbol.clone(), price, qty };

    // Step 2: dedup (5s LRU, handled inside SignalStore::record).
    let signal = match state.signal_store.record(&token, body.clone(), parsed.clone()) {
        Ok(signal) => signal,
        Err(_existing_id) => {
            return Ok(Json(WebhookResponse { deduped: true, accepted_accounts: 0 }));
        }
    };

    // Step 3: resolve strategy.
    let strategy = state.registry.resolve_token(&token).ok_or(StatusCode::NOT_FOUND)?;

    // Step 4: filter chain, evaluated once at the strategy level.
    let filter_state = state.filter_state_for(strategy.id);
    let now = chrono::Utc::now();
    let minute_of_day = now.hour() * 60 + now.minute();
    let daily_loss = state.mirror.daily_realized_pnl(strategy.id);
    let qty_estimate = parsed.qty.filter(|q| *q > Decimal::ZERO).unwrap_or(strategy.initial_qty);

    if let Err(rejection) = evaluate(
        &strategy.filters,
        &filter_state,
        action.entry_side(),
        now_millis(),
        minute_of_day,
        qty_estimate,
        daily_loss,
    ) {
        info!(%rejection, strategy_id = strategy.id, "signal rejected by filter chain");
        return Ok(Json(WebhookResponse { deduped: false, accepted_accounts: 0 }));
    }

    // Step 5: resolve accounts + overlay effective settings.
    let traders = state.registry.enabled_traders_for(strategy.id);
    let reference_price = parsed.price.unwrap_or(Decimal::ZERO);

    let mut accepted = 0usize;
    let mut any_queue_full = false;
    for trader in traders {
        let settings = trader.overlay(&strategy);

        // Step 6/7: risk config is implicit in `settings`; qty pre-compute
        // happens inside the execution engine (`resolve_entry_qty`), kept
        // field-presence-based end to end.
        let task = ExecutionTask {
            account_id: trader.broker_account_id,
            strategy_id: strategy.id,
            settings,
            action,
            symbol: symbol.clone(),
            reference_price,
            requested_qty: parsed.qty,
            is_copy_follower: false,
            idempotency_key: format!("{}:{}", signal.id, trader.broker_account_id),
        };

        // Step 8: enqueue, 50ms budget. A queue_full on any trader is
        // backpressure, not a per-account detail to swallow — it flips the
        // whole response to 503 below, even though other traders in this
        // same loop may have enqueued fine.
        let engine = state.engine.clone();
        let failures = state.failures.clone();
        let task_account_id = task.account_id;
        let task_symbol = task.symbol.clone();
        let enqueue_result = state
            .queue
            .try_enqueue(
                task.account_id,
                &strategy.symbol_root,
                ENQUEUE_BUDGET,
                Box::new(move || {
                    Box::pin(async move {
                        if let Err(err) = engine.execute(task).await {
                            warn!(error = %err, classification = err.classification(), "execution task failed");
                            failures.record(task_account_id, task_symbol, err.classification(), err.to_string(), false);
                        }
                    })
                }),
            )
            .await;

        match enqueue_result {
            Ok(()) => accepted += 1,
            Err(err) => {
                warn!(error = %err, account_id = trader.broker_account_id, "failed to enqueue execution task");
                if matches!(err, crate::errors::ExecutionError::QueueFull) {
                    any_queue_full = true;
                }
                state.failures.record(trader.broker_account_id, symbol.clone(), err.classification(), err.to_string(), false);
            }
        }
    }

    // Step 9: fire-and-forget paper-trade/signal-tracking hooks would be
    // spawned here; this bridge's scope treats that as a no-op hook point
    // (see SPEC_FULL.md's Supplemented Features / Open Question 2).

    // Step 10: respond. A queue_full anywhere in the trader loop is
    // backpressure the caller must see and retry against, not buffered
    // behind a 200 — the failures feed still records the per-account detail.
    if any_queue_full {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(WebhookResponse { deduped: false, accepted_accounts: accepted }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        BracketLeg, BracketOptions, BracketOrderResult, BrokerClient, BrokerPosition, OrderFilter, OrderRef, StopLossPayload,
    };
    use crate::errors::ExecutionError;
    use crate::strategy_config::{BreakEvenConfig, FilterSet, Strategy, StopLossConfig, Trader};
    use crate::trade_ledger::TradeLedger;
    use crate::types::{DistanceUnit, OrderStatus, Side, StopKind};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;
    use std::time::Duration as StdDuration;

    struct NullBroker;

    #[async_trait]
    impl BrokerClient for NullBroker {
        async fn place_bracket_order(
            &self,
            _account_id: i64,
            _side: Side,
            _qty: Decimal,
            _symbol: &str,
            _legs: &[BracketLeg],
            _sl: Option<StopLossPayload>,
            _options: BracketOptions,
        ) -> Result<BracketOrderResult, ExecutionError> {
            Ok(BracketOrderResult { entry_id: "e1".into(), leg_ids: vec![], sl_id: None })
        }
        async fn place_market(&self, _account_id: i64, _side: Side, _qty: Decimal, _symbol: &str) -> Result<String, ExecutionError> {
            Ok("m1".into())
        }
        async fn place_limit(&self, _account_id: i64, _side: Side, _qty: Decimal, _symbol: &str, _price: Decimal) -> Result<String, ExecutionError> {
            Ok("l1".into())
        }
        async fn cancel(&self, _account_id: i64, _order_id: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
        async fn list_orders(&self, _account_id: i64, _filter: OrderFilter<'_>) -> Result<Vec<OrderRef>, ExecutionError> {
            Ok(vec![])
        }
        async fn list_positions(&self, _account_id: i64) -> Result<Vec<BrokerPosition>, ExecutionError> {
            Ok(vec![])
        }
        async fn refresh_auth(&self, _account_id: i64) -> Result<DateTime<Utc>, ExecutionError> {
            Ok(Utc::now())
        }
    }

    fn strategy() -> Strategy {
        Strategy {
            id: 1,
            display_name: "gold".into(),
            symbol_root: "GC".into(),
            initial_qty: dec!(1),
            dca_qty: dec!(1),
            dca_enabled: true,
            tp_targets: vec![],
            sl: StopLossConfig { enabled: false, distance: dec!(0), unit: DistanceUnit::Ticks, kind: StopKind::Fixed, trail_trigger: None, trail_frequency_secs: None },
            break_even: BreakEvenConfig { enabled: false, ticks: dec!(0), offset: dec!(0) },
            filters: FilterSet::default(),
        }
    }

    fn trader(id: i64, strategy_id: i64) -> Trader {
        Trader {
            id,
            strategy_id,
            broker_account_id: 100 + id,
            multiplier: dec!(1),
            enabled: true,
            is_leader: false,
            follower_of: None,
            initial_qty: None,
            dca_qty: None,
            dca_enabled: None,
            tp_targets: None,
            sl: None,
            break_even: None,
            filters: None,
        }
    }

    fn new_state() -> Arc<WebhookState> {
        let registry = Arc::new(StrategyRegistry::new());
        registry.register_strategy("tok-1", strategy());
        registry.register_trader(trader(1, 1));
        let signal_store = Arc::new(SignalStore::new(10_000, StdDuration::from_secs(5)));
        let ledger = Arc::new(TradeLedger::new());
        let mirror = Arc::new(PositionMirror::new(ledger));
        let engine = Arc::new(ExecutionEngine::new(Arc::new(NullBroker), mirror.clone()));
        let queue = Arc::new(crate::execution::queue::ExecutionQueue::start(64, 2));
        let failures = Arc::new(crate::failures::FailuresFeed::new());
        Arc::new(WebhookState::new(registry, signal_store, mirror, engine, queue, failures))
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let state = new_state();
        let result = handle_webhook(
            State(state),
            Path("nope".to_string()),
            Json(serde_json::json!({"action": "buy", "symbol": "GCJ6"})),
        )
        .await;
        assert_eq!(result.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_symbol_is_bad_request() {
        let state = new_state();
        let result = handle_webhook(State(state), Path("tok-1".to_string()), Json(serde_json::json!({"action": "buy"}))).await;
        assert_eq!(result.unwrap_err(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn known_token_dispatches_to_enabled_trader() {
        let state = new_state();
        let response = handle_webhook(
            State(state),
            Path("tok-1".to_string()),
            Json(serde_json::json!({"action": "buy", "symbol": "GCJ6", "price": "2000.00"})),
        )
        .await
        .unwrap();
        assert_eq!(response.0.accepted_accounts, 1);
    }

    #[tokio::test]
    async fn rapid_redelivery_is_deduped() {
        let state = new_state();
        let payload = serde_json::json!({"action": "buy", "symbol": "GCJ6", "price": "2000.00"});
        handle_webhook(State(state.clone()), Path("tok-1".to_string()), Json(payload.clone())).await.unwrap();
        let second = handle_webhook(State(state), Path("tok-1".to_string()), Json(payload)).await.unwrap();
        assert!(second.0.deduped);
    }
}
