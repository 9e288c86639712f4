// =============================================================================
// Strategy / Trader registry
// =============================================================================
//
// Resolves a webhook token to its Strategy and enumerates the enabled
// Traders (account links) that should receive signals for it. Backed by
// plain `RwLock`-guarded maps, matching the lock shape used throughout the
// rest of the state layer (`PositionMirror`, `SignalStore`).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::strategy_config::{Strategy, Trader};

pub struct StrategyRegistry {
    token_to_strategy: RwLock<HashMap<String, i64>>,
    strategies: RwLock<HashMap<i64, Strategy>>,
    traders_by_strategy: RwLock<HashMap<i64, Vec<Trader>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            token_to_strategy: RwLock::new(HashMap::new()),
            strategies: RwLock::new(HashMap::new()),
            traders_by_strategy: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_strategy(&self, webhook_token: impl Into<String>, strategy: Strategy) {
        self.token_to_strategy.write().insert(webhook_token.into(), strategy.id);
        self.strategies.write().insert(strategy.id, strategy);
    }

    pub fn register_trader(&self, trader: Trader) {
        self.traders_by_strategy.write().entry(trader.strategy_id).or_default().push(trader);
    }

    pub fn resolve_token(&self, webhook_token: &str) -> Option<Strategy> {
        let strategy_id = *self.token_to_strategy.read().get(webhook_token)?;
        self.strategies.read().get(&strategy_id).cloned()
    }

    /// Enabled traders linked to `strategy_id`, in registration order.
    pub fn enabled_traders_for(&self, strategy_id: i64) -> Vec<Trader> {
        self.traders_by_strategy
            .read()
            .get(&strategy_id)
            .map(|traders| traders.iter().filter(|t| t.enabled).cloned().collect())
            .unwrap_or_default()
    }

    pub fn strategy_by_id(&self, strategy_id: i64) -> Option<Strategy> {
        self.strategies.read().get(&strategy_id).cloned()
    }

    /// Every enabled trader across every strategy whose `follower_of` points
    /// at `leader_account_id`. Copy-trade fan-out is account-scoped, not
    /// strategy-scoped, so this deliberately searches the whole registry.
    pub fn enabled_followers_of(&self, leader_account_id: i64) -> Vec<Trader> {
        self.traders_by_strategy
            .read()
            .values()
            .flatten()
            .filter(|t| t.enabled && t.follower_of == Some(leader_account_id))
            .cloned()
            .collect()
    }

    /// `true` if `account_id` has its own enabled, non-follower trader row
    /// on a strategy for `symbol_root` — i.e. it already receives signals
    /// directly and must not also receive a copy-trade fan-out for that root.
    pub fn has_direct_trader_for_root(&self, account_id: i64, symbol_root: &str) -> bool {
        let strategies = self.strategies.read();
        let traders_by_strategy = self.traders_by_strategy.read();
        traders_by_strategy.iter().any(|(strategy_id, traders)| {
            let Some(strategy) = strategies.get(strategy_id) else { return false };
            if strategy.symbol_root != symbol_root {
                return false;
            }
            traders.iter().any(|t| t.enabled && t.broker_account_id == account_id && t.follower_of.is_none())
        })
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
