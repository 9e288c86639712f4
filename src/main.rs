// =============================================================================
// futures-bridge — Main Entry Point
// =============================================================================
//
// The engine starts in Paused mode for safety. An operator must flip
// `trading_mode` to Live explicitly, either by editing runtime_config.json
// or through a future admin surface — nothing in this binary does it
// automatically.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod broker;
mod copytrade;
mod errors;
mod execution;
mod failures;
mod ids;
mod instruments;
mod listeners;
mod position_mirror;
mod reconcile;
mod runtime_config;
mod signals;
mod status_api;
mod strategy_config;
mod token_refresh;
mod trade_ledger;
mod types;
mod webhook;
mod ws;

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::rate_limit::RateLimiterRegistry;
use crate::broker::reference::{AccountCredentials, ReferenceBrokerClient};
use crate::broker::BrokerClient;
use crate::copytrade::CopyTradePropagator;
use crate::instruments::root_of;
use crate::listeners::leader_listener::{LeaderDelta, LeaderDeltaSink, LeaderListener};
use crate::listeners::max_loss_listener::MaxLossReactor;
use crate::listeners::position_listener::PositionListener;
use crate::reconcile::ReconcileTarget;
use crate::runtime_config::RuntimeConfig;
use crate::strategy_config::{Strategy, Trader};
use crate::types::TradingMode;

/// One account's broker credentials and linkage, read from the bootstrap
/// file at startup. There is no admin API yet — operators edit this file
/// and restart the process to add an account or change a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountBootstrap {
    account_id: i64,
    api_key: String,
    secret: String,
    token_key: String,
    /// Maximum realized loss this account may take in one session, measured
    /// against its balance the moment the WS connection picks up its first
    /// `balance` event — not a static dollar floor.
    #[serde(default)]
    max_daily_loss: Option<Decimal>,
}

/// One strategy plus its linked traders, keyed by the webhook token signal
/// providers post to.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StrategyBootstrap {
    webhook_token: String,
    strategy: Strategy,
    traders: Vec<Trader>,
    #[serde(default)]
    auto_flat_cutoff: Option<chrono::NaiveTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BootstrapConfig {
    #[serde(default)]
    accounts: Vec<AccountBootstrap>,
    #[serde(default)]
    strategies: Vec<StrategyBootstrap>,
}

impl BootstrapConfig {
    fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Disables the account's resting orders and market-closes its open
/// position on a max-loss breach (C10). The reactor only issues the close —
/// it does not touch `TokenRefreshDaemon` or `needs_reauth`, those are an
/// unrelated failure mode.
struct MarketCloseOnBreach {
    broker: Arc<dyn BrokerClient>,
}

impl MaxLossReactor for MarketCloseOnBreach {
    fn on_breach(&self, account_id: i64, cash_balance: Decimal, floor: Decimal) {
        let broker = self.broker.clone();
        tokio::spawn(async move {
            warn!(account_id, %cash_balance, %floor, "max-loss breach, flattening account");
            let positions = match broker.list_positions(account_id).await {
                Ok(p) => p,
                Err(err) => {
                    error!(account_id, error = %err, "failed to list positions during max-loss flatten");
                    return;
                }
            };
            for position in positions {
                if let Err(err) = broker.place_market(account_id, position.side.opposite(), position.qty, &position.symbol).await {
                    error!(account_id, symbol = %position.symbol, error = %err, "failed to market-close position during max-loss flatten");
                }
            }
        });
    }
}

/// Bridges the Leader Listener's synchronous `on_message` callback to the
/// async copy-trade propagator, firing one fan-out per classified delta.
struct CopyTradeDeltaSink {
    propagator: Arc<CopyTradePropagator>,
}

impl LeaderDeltaSink for CopyTradeDeltaSink {
    fn on_leader_delta(&self, leader_account_id: i64, symbol: &str, delta: LeaderDelta) {
        let Ok(symbol_root) = root_of(symbol) else {
            warn!(symbol, "leader delta for unrecognized symbol root, dropping");
            return;
        };
        let propagator = self.propagator.clone();
        let symbol = symbol.to_string();
        let symbol_root = symbol_root.to_string();
        tokio::spawn(async move {
            propagator.propagate(leader_account_id, &symbol, &symbol_root, delta).await;
        });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("futures-bridge starting up");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: force Paused on startup regardless of the persisted value.
    config.trading_mode = TradingMode::Paused;

    info!(trading_mode = %config.trading_mode, bind_addr = %config.bind_addr, "engine starting in SAFE mode (paused)");

    let bootstrap = BootstrapConfig::load("bootstrap.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load bootstrap config, starting with no strategies or accounts");
        BootstrapConfig::default()
    });

    // ── 2. Build broker client ───────────────────────────────────────────
    let rate_limiters = Arc::new(RateLimiterRegistry::new());
    let reference_broker = Arc::new(ReferenceBrokerClient::new(config.broker_base_url.clone(), rate_limiters.clone()));
    for account in &bootstrap.accounts {
        reference_broker.register_account(
            account.account_id,
            AccountCredentials {
                api_key: account.api_key.clone(),
                secret: account.secret.clone(),
                token_key: account.token_key.clone(),
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            },
        );
    }
    let broker: Arc<dyn BrokerClient> = reference_broker.clone();

    // ── 3. Build shared state ────────────────────────────────────────────
    let max_loss_reactor = Arc::new(MarketCloseOnBreach { broker: broker.clone() });
    let state = AppState::new(config, broker.clone(), max_loss_reactor);

    for strategy_bootstrap in &bootstrap.strategies {
        state.registry.register_strategy(strategy_bootstrap.webhook_token.clone(), strategy_bootstrap.strategy.clone());
        for trader in &strategy_bootstrap.traders {
            state.registry.register_trader(trader.clone());
        }
        state.register_strategy_token(strategy_bootstrap.strategy.id, strategy_bootstrap.webhook_token.clone());
    }
    for account in &bootstrap.accounts {
        if let Some(max_daily_loss) = account.max_daily_loss {
            state.max_loss_listener.set_max_daily_loss(account.account_id, max_daily_loss);
        }
        state.token_refresh.register_account(account.account_id, chrono::Utc::now() + chrono::Duration::hours(1));
    }

    info!(
        accounts = bootstrap.accounts.len(),
        strategies = bootstrap.strategies.len(),
        "bootstrap configuration loaded"
    );

    // ── 4. Register WS listeners per token, one shared connection each ──
    for strategy_bootstrap in &bootstrap.strategies {
        let token_key = &strategy_bootstrap.webhook_token;
        let account_ids: Vec<i64> = strategy_bootstrap.traders.iter().map(|t| t.broker_account_id).collect();

        let position_listener = Arc::new(PositionListener::new(strategy_bootstrap.strategy.id, state.mirror.clone(), state.trade_ledger.clone()));
        state.ws_manager.register_listener(token_key, &account_ids, position_listener);

        state.ws_manager.register_listener(token_key, &account_ids, state.max_loss_listener.clone());

        for trader in &strategy_bootstrap.traders {
            if trader.is_leader {
                let sink = Arc::new(CopyTradeDeltaSink { propagator: state.copy_propagator.clone() });
                let leader_listener = Arc::new(LeaderListener::new(trader.broker_account_id, sink));
                state.ws_manager.register_listener(token_key, &[trader.broker_account_id], leader_listener);
            }
        }
    }

    // ── 5. Start the webhook HTTP server ─────────────────────────────────
    let bind_addr = state.runtime_config.read().bind_addr.clone();
    let webhook_state = state.webhook_state();
    let status_state = state.clone();
    tokio::spawn(async move {
        let app = webhook::router(webhook_state).merge(status_api::router(status_state));
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind webhook server");
        info!(addr = %bind_addr, "webhook server listening");
        axum::serve(listener, app).await.expect("webhook server failed");
    });

    // ── 6. Reconciliation loop ────────────────────────────────────────────
    let recon_state = state.clone();
    let recon_bootstrap = bootstrap.clone();
    tokio::spawn(async move {
        let interval_secs = recon_state.runtime_config.read().reconciliation_interval_secs;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;

            if recon_state.runtime_config.read().trading_mode == TradingMode::Killed {
                continue;
            }

            let targets: Vec<ReconcileTarget> = recon_bootstrap
                .strategies
                .iter()
                .flat_map(|sb| {
                    sb.traders.iter().filter(|t| t.enabled).map(move |t| ReconcileTarget {
                        account_id: t.broker_account_id,
                        strategy_id: sb.strategy.id,
                        settings: t.overlay(&sb.strategy),
                        auto_flat_cutoff: sb.auto_flat_cutoff,
                    })
                })
                .collect();

            recon_state.reconcile_loop.run_sweep(&targets).await;
        }
    });

    // ── 7. Token refresh daemon ───────────────────────────────────────────
    tokio::spawn(state.token_refresh.clone().run_forever());

    info!("all subsystems running; press Ctrl+C to stop");

    // ── 8. Graceful shutdown ──────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping");

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("futures-bridge shut down complete");
    Ok(())
}
