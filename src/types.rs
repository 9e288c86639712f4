// =============================================================================
// Shared types used across the execution pipeline
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether the engine is actively trading, paused, or killed. Process-wide;
/// a kill overrides every strategy and account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Long or short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn direction(self) -> i32 {
        match self {
            Side::Long => 1,
            Side::Short => -1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Unit a take-profit/stop-loss distance is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceUnit {
    Ticks,
    Points,
    Percent,
}

/// Unit a take-profit trim value is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimUnit {
    Contracts,
    Percent,
}

/// Stop-loss kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    Fixed,
    Trailing,
}

/// Position lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Trade lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// Why a trade was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Tp,
    Sl,
    Signal,
    Flip,
    Flatten,
    Manual,
}

/// Parsed webhook action, case-insensitively normalized at the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    Buy,
    Sell,
    Flatten,
    TpHit,
    SlHit,
    /// Partial same-side reduction by a specific quantity (a copy-trade
    /// TRIM). Distinct from `Flatten`, which closes the entire position —
    /// never produced by `parse`, only by the copy-trade propagator.
    Reduce,
}

impl SignalAction {
    /// Parse the free-form, case-insensitive action strings the webhook
    /// payload may carry: buy/long, sell/short, close/flatten/exit,
    /// tp_hit, sl_hit.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "buy" | "long" => Some(Self::Buy),
            "sell" | "short" => Some(Self::Sell),
            "close" | "flatten" | "exit" => Some(Self::Flatten),
            "tp_hit" => Some(Self::TpHit),
            "sl_hit" => Some(Self::SlHit),
            _ => None,
        }
    }

    /// The entry side this action implies, if it is a directional entry.
    pub fn entry_side(self) -> Option<Side> {
        match self {
            Self::Buy => Some(Side::Long),
            Self::Sell => Some(Side::Short),
            _ => None,
        }
    }

    pub fn is_exit_only(self) -> bool {
        matches!(self, Self::Flatten | Self::TpHit | Self::SlHit)
    }
}

/// Kind of broker order a local `OrderRef` cache entry mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    EntryMarket,
    EntryBracket,
    TpLimit,
    SlStop,
    OcoPartner,
}

/// Broker-side order status, enumerated the way `listOrders`/events report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Accepted,
    Working,
    Filled,
    Canceled,
    Rejected,
}

/// Live vs. demo/paper account routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountEnv {
    Live,
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_documented_action_spellings() {
        assert_eq!(SignalAction::parse("BUY"), Some(SignalAction::Buy));
        assert_eq!(SignalAction::parse("long"), Some(SignalAction::Buy));
        assert_eq!(SignalAction::parse("Sell"), Some(SignalAction::Sell));
        assert_eq!(SignalAction::parse("short"), Some(SignalAction::Sell));
        assert_eq!(SignalAction::parse("close"), Some(SignalAction::Flatten));
        assert_eq!(SignalAction::parse("flatten"), Some(SignalAction::Flatten));
        assert_eq!(SignalAction::parse("exit"), Some(SignalAction::Flatten));
        assert_eq!(SignalAction::parse("tp_hit"), Some(SignalAction::TpHit));
        assert_eq!(SignalAction::parse("sl_hit"), Some(SignalAction::SlHit));
        assert_eq!(SignalAction::parse("banana"), None);
    }

    #[test]
    fn side_opposite_and_direction() {
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.opposite(), Side::Long);
        assert_eq!(Side::Long.direction(), 1);
        assert_eq!(Side::Short.direction(), -1);
    }
}
