// =============================================================================
// Central Application State — futures-bridge
// =============================================================================
//
// The single `Arc<AppState>` tying every subsystem together: the strategy
// registry, position mirror / trade ledger, broker client + rate limiters,
// WS manager and listeners, execution queue/engine, reconciliation loop,
// token refresh daemon, and copy-trade propagator. Built once at startup in
// `main.rs` and cloned (as `Arc`) into every spawned task and the webhook
// router's `axum::State`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::broker::rate_limit::RateLimiterRegistry;
use crate::broker::BrokerClient;
use crate::copytrade::{CopyTradePropagator, FollowerResolver};
use crate::execution::queue::ExecutionQueue;
use crate::execution::ExecutionEngine;
use crate::failures::FailuresFeed;
use crate::listeners::max_loss_listener::MaxLossListener;
use crate::position_mirror::PositionMirror;
use crate::reconcile::{ListenerConnectivity, ReconcileLoop};
use crate::runtime_config::RuntimeConfig;
use crate::signals::SignalStore;
use crate::strategy_config::{EffectiveSettings, Trader};
use crate::token_refresh::TokenRefreshDaemon;
use crate::trade_ledger::TradeLedger;
use crate::webhook::registry::StrategyRegistry;
use crate::webhook::WebhookState;
use crate::ws::WsManager;

/// Bridges `StrategyRegistry` lookups to the `FollowerResolver` seam the
/// copy-trade propagator depends on.
struct RegistryFollowerResolver {
    registry: Arc<StrategyRegistry>,
}

impl FollowerResolver for RegistryFollowerResolver {
    fn followers_of(&self, leader_account_id: i64) -> Vec<Trader> {
        self.registry.enabled_followers_of(leader_account_id)
    }

    fn is_webhook_driven_for_symbol(&self, account_id: i64, symbol_root: &str) -> bool {
        self.registry.has_direct_trader_for_root(account_id, symbol_root)
    }

    fn effective_settings_for(&self, trader: &Trader) -> EffectiveSettings {
        match self.registry.strategy_by_id(trader.strategy_id) {
            Some(strategy) => trader.overlay(&strategy),
            None => trader.overlay(&crate::strategy_config::Strategy {
                id: trader.strategy_id,
                display_name: String::new(),
                symbol_root: String::new(),
                initial_qty: rust_decimal::Decimal::ZERO,
                dca_qty: rust_decimal::Decimal::ZERO,
                dca_enabled: false,
                tp_targets: Vec::new(),
                sl: crate::strategy_config::StopLossConfig {
                    enabled: false,
                    distance: rust_decimal::Decimal::ZERO,
                    unit: crate::types::DistanceUnit::Ticks,
                    kind: crate::types::StopKind::Fixed,
                    trail_trigger: None,
                    trail_frequency_secs: None,
                },
                break_even: crate::strategy_config::BreakEvenConfig {
                    enabled: false,
                    ticks: rust_decimal::Decimal::ZERO,
                    offset: rust_decimal::Decimal::ZERO,
                },
                filters: crate::strategy_config::FilterSet::default(),
            }),
        }
    }
}

/// Bridges the `WsManager`'s per-token liveness state to the
/// `ListenerConnectivity` seam the reconciliation loop depends on, via the
/// strategy's registered webhook token as its WS `token_key`.
struct WsManagerConnectivity {
    ws_manager: Arc<WsManager>,
    strategy_tokens: RwLock<HashMap<i64, String>>,
}

impl ListenerConnectivity for WsManagerConnectivity {
    fn is_connected(&self, strategy_id: i64) -> bool {
        match self.strategy_tokens.read().get(&strategy_id) {
            Some(token_key) => self.ws_manager.is_connected(token_key),
            None => false,
        }
    }
}

/// Central application state shared across every async task via `Arc<AppState>`.
pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    pub registry: Arc<StrategyRegistry>,
    pub signal_store: Arc<SignalStore>,

    pub trade_ledger: Arc<TradeLedger>,
    pub mirror: Arc<PositionMirror>,

    pub rate_limiters: Arc<RateLimiterRegistry>,
    pub broker: Arc<dyn BrokerClient>,

    pub ws_manager: Arc<WsManager>,
    pub max_loss_listener: Arc<MaxLossListener>,

    pub execution_queue: Arc<ExecutionQueue>,
    pub execution_engine: Arc<ExecutionEngine>,

    pub reconcile_loop: Arc<ReconcileLoop>,
    pub token_refresh: Arc<TokenRefreshDaemon>,
    pub copy_propagator: Arc<CopyTradePropagator>,
    pub failures: Arc<FailuresFeed>,

    connectivity: Arc<WsManagerConnectivity>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct a new `AppState` from the given runtime configuration and a
    /// concrete broker client. `broker` is taken as a trait object so tests
    /// and alternate deployments can swap in a stub without touching this
    /// wiring.
    pub fn new(config: RuntimeConfig, broker: Arc<dyn BrokerClient>, max_loss_reactor: Arc<dyn crate::listeners::max_loss_listener::MaxLossReactor>) -> Arc<Self> {
        let registry = Arc::new(StrategyRegistry::new());
        let signal_store = Arc::new(SignalStore::new(config.dedup_capacity, std::time::Duration::from_secs(config.dedup_ttl_secs)));

        let trade_ledger = Arc::new(TradeLedger::new());
        let mirror = Arc::new(PositionMirror::new(trade_ledger.clone()));

        let rate_limiters = Arc::new(RateLimiterRegistry::new());
        let ws_manager = Arc::new(WsManager::new(config.broker_base_url.replace("https://", "wss://ws.")));
        let max_loss_listener = Arc::new(MaxLossListener::new(max_loss_reactor));

        let execution_queue = Arc::new(ExecutionQueue::start(config.execution_queue_capacity, config.execution_worker_count));
        let execution_engine = Arc::new(ExecutionEngine::new(broker.clone(), mirror.clone()));

        let connectivity = Arc::new(WsManagerConnectivity {
            ws_manager: ws_manager.clone(),
            strategy_tokens: RwLock::new(HashMap::new()),
        });
        let reconcile_loop = Arc::new(ReconcileLoop::new(broker.clone(), mirror.clone(), connectivity.clone()));
        let token_refresh = Arc::new(TokenRefreshDaemon::new(broker.clone()));

        let failures = Arc::new(FailuresFeed::new());
        let follower_resolver = Arc::new(RegistryFollowerResolver { registry: registry.clone() });
        let copy_propagator = Arc::new(CopyTradePropagator::new(follower_resolver, execution_engine.clone(), execution_queue.clone(), failures.clone()));

        Arc::new(Self {
            runtime_config: Arc::new(RwLock::new(config)),
            registry,
            signal_store,
            trade_ledger,
            mirror,
            rate_limiters,
            broker,
            ws_manager,
            max_loss_listener,
            execution_queue,
            execution_engine,
            reconcile_loop,
            token_refresh,
            copy_propagator,
            failures,
            connectivity,
            start_time: std::time::Instant::now(),
        })
    }

    /// Record which webhook token backs a strategy's WS subscription, so the
    /// reconciliation loop's missing-TP repair can tell whether the
    /// Position Listener already holds a live connection for it.
    pub fn register_strategy_token(&self, strategy_id: i64, token_key: impl Into<String>) {
        self.connectivity.strategy_tokens.write().insert(strategy_id, token_key.into());
    }

    /// Build the `axum::Router` state for the webhook dispatcher (C11).
    pub fn webhook_state(self: &Arc<Self>) -> Arc<WebhookState> {
        Arc::new(WebhookState::new(
            self.registry.clone(),
            self.signal_store.clone(),
            self.mirror.clone(),
            self.execution_engine.clone(),
            self.execution_queue.clone(),
            self.failures.clone(),
        ))
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BracketLeg, BracketOptions, BracketOrderResult, BrokerPosition, OrderFilter, OrderRef, StopLossPayload};
    use crate::errors::ExecutionError;
    use crate::listeners::max_loss_listener::MaxLossReactor;
    use crate::types::Side;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct NullBroker;

    #[async_trait]
    impl BrokerClient for NullBroker {
        async fn place_bracket_order(&self, _a: i64, _s: Side, _q: Decimal, _sym: &str, _legs: &[BracketLeg], _sl: Option<StopLossPayload>, _o: BracketOptions) -> Result<BracketOrderResult, ExecutionError> {
            Ok(BracketOrderResult { entry_id: "e".into(), leg_ids: vec![], sl_id: None })
        }
        async fn place_market(&self, _a: i64, _s: Side, _q: Decimal, _sym: &str) -> Result<String, ExecutionError> {
            Ok("m".into())
        }
        async fn place_limit(&self, _a: i64, _s: Side, _q: Decimal, _sym: &str, _p: Decimal) -> Result<String, ExecutionError> {
            Ok("l".into())
        }
        async fn cancel(&self, _a: i64, _order_id: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
        async fn list_orders(&self, _a: i64, _f: OrderFilter<'_>) -> Result<Vec<OrderRef>, ExecutionError> {
            Ok(vec![])
        }
        async fn list_positions(&self, _a: i64) -> Result<Vec<BrokerPosition>, ExecutionError> {
            Ok(vec![])
        }
        async fn refresh_auth(&self, _account_id: i64) -> Result<DateTime<Utc>, ExecutionError> {
            Ok(Utc::now())
        }
    }

    struct NullReactor;
    impl MaxLossReactor for NullReactor {
        fn on_breach(&self, _account_id: i64, _cash_balance: Decimal, _floor: Decimal) {}
    }

    #[test]
    fn new_app_state_wires_without_panicking() {
        let state = AppState::new(RuntimeConfig::default(), Arc::new(NullBroker), Arc::new(NullReactor));
        assert_eq!(state.registry.enabled_traders_for(1).len(), 0);
    }

    #[test]
    fn unregistered_strategy_token_is_not_connected() {
        let state = AppState::new(RuntimeConfig::default(), Arc::new(NullBroker), Arc::new(NullReactor));
        assert!(!state.connectivity.is_connected(1));
    }

    #[test]
    fn webhook_state_shares_the_same_mirror() {
        let state = AppState::new(RuntimeConfig::default(), Arc::new(NullBroker), Arc::new(NullReactor));
        let webhook_state = state.webhook_state();
        webhook_state.mirror.apply_entry(1, "GCJ6", "GC", Side::Long, dec!(2000), dec!(1), false, None, None);
        assert!(state.mirror.open_position_for(1, "GC").is_some());
    }
}
