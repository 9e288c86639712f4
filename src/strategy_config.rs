// =============================================================================
// Strategy / Trader configuration and the NULL-means-inherit overlay
// =============================================================================
//
// A Strategy carries the full default configuration for a symbol root. An
// Account Link ("Trader") links that strategy to one broker account and may
// override any field; a trader field left unset means "inherit the strategy
// value", never "use zero" or "use false" — the truthy-zero and dict-null
// hazards this guards against are why every override field here is
// `Option<T>`, not a bare value with a sentinel.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{DistanceUnit, Side, StopKind, TrimUnit};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Distance {
    pub value: Decimal,
    pub unit: DistanceUnit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Trim {
    pub value: Decimal,
    pub unit: TrimUnit,
}

/// One ordered take-profit leg. Distance and trim are independent fields —
/// there is no cross-referencing between a percent distance and a contracts
/// trim or vice versa; see DESIGN.md Open Question 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TpTarget {
    pub distance: Distance,
    pub trim: Trim,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StopLossConfig {
    pub enabled: bool,
    pub distance: Decimal,
    pub unit: DistanceUnit,
    pub kind: StopKind,
    pub trail_trigger: Option<Decimal>,
    pub trail_frequency_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakEvenConfig {
    pub enabled: bool,
    pub ticks: Decimal,
    pub offset: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSet {
    /// When set, signals whose entry direction doesn't match are rejected.
    /// `None` accepts both directions.
    pub direction: Option<Side>,
    pub cooldown_secs: Option<u64>,
    pub session_cap: Option<u32>,
    pub daily_loss_cap: Option<Decimal>,
    pub contract_cap: Option<Decimal>,
    /// Each window is an inclusive `(start_minute_of_day, end_minute_of_day)`
    /// pair in the account's configured trading-session timezone.
    pub time_windows: Vec<(u32, u32)>,
    pub every_nth_signal: Option<u32>,
}

impl Default for FilterSet {
    fn default() -> Self {
        Self {
            direction: None,
            cooldown_secs: None,
            session_cap: None,
            daily_loss_cap: None,
            contract_cap: None,
            time_windows: Vec::new(),
            every_nth_signal: None,
        }
    }
}

/// Strategy — the configuration parent for a symbol root (C4/C5 in the
/// component design). Created and mutated by a user; never deleted while
/// linked positions exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub display_name: String,
    pub symbol_root: String,
    pub initial_qty: Decimal,
    pub dca_qty: Decimal,
    pub dca_enabled: bool,
    pub tp_targets: Vec<TpTarget>,
    pub sl: StopLossConfig,
    pub break_even: BreakEvenConfig,
    pub filters: FilterSet,
}

/// Account Link (Trader) — links a Strategy to one broker account.
/// `None` on any override field means "inherit the strategy value"; this
/// struct's fields MUST stay optional so a trader row loaded from storage
/// with a missing key never silently becomes zero/false/empty instead of
/// "inherit".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trader {
    pub id: i64,
    pub strategy_id: i64,
    pub broker_account_id: i64,
    pub multiplier: Decimal,
    pub enabled: bool,
    pub is_leader: bool,
    pub follower_of: Option<i64>,

    pub initial_qty: Option<Decimal>,
    pub dca_qty: Option<Decimal>,
    pub dca_enabled: Option<bool>,
    pub tp_targets: Option<Vec<TpTarget>>,
    pub sl: Option<StopLossConfig>,
    pub break_even: Option<BreakEvenConfig>,
    pub filters: Option<FilterSet>,
}

/// Fully resolved settings for one (strategy, trader) pair. No `Option<T>`
/// reaches here — by the time execution sees this, every field has a
/// concrete value, because a NULL trader override is exactly "use the
/// strategy's own value", not "use nothing".
#[derive(Debug, Clone)]
pub struct EffectiveSettings {
    pub symbol_root: String,
    pub initial_qty: Decimal,
    pub dca_qty: Decimal,
    pub dca_enabled: bool,
    pub tp_targets: Vec<TpTarget>,
    pub sl: StopLossConfig,
    pub break_even: BreakEvenConfig,
    pub filters: FilterSet,
    pub multiplier: Decimal,
}

impl Trader {
    /// Overlay this trader's overrides onto its parent strategy. `enabled`
    /// must be checked by the caller before dispatch; a disabled trader
    /// still resolves (useful for the UI) but must not receive tasks.
    pub fn overlay(&self, strategy: &Strategy) -> EffectiveSettings {
        EffectiveSettings {
            symbol_root: strategy.symbol_root.clone(),
            initial_qty: self.initial_qty.unwrap_or(strategy.initial_qty),
            dca_qty: self.dca_qty.unwrap_or(strategy.dca_qty),
            dca_enabled: self.dca_enabled.unwrap_or(strategy.dca_enabled),
            tp_targets: self
                .tp_targets
                .clone()
                .unwrap_or_else(|| strategy.tp_targets.clone()),
            sl: self.sl.unwrap_or(strategy.sl),
            break_even: self.break_even.unwrap_or(strategy.break_even),
            filters: self
                .filters
                .clone()
                .unwrap_or_else(|| strategy.filters.clone()),
            multiplier: self.multiplier,
        }
    }
}
