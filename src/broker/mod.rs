// =============================================================================
// Broker Client (C6) — abstract capability set a concrete broker must provide
// =============================================================================
//
// Transport policy: entries, cancels, and replacements are all REST,
// synchronous per-call, with a per-call timeout. The WebSocket channel
// (see `crate::ws`) is read-only except for authenticated subscription
// control — no order placement ever goes over WS.

pub mod rate_limit;
pub mod reference;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ExecutionError;
use crate::types::{OrderKind, OrderStatus, Side};

/// One ordered take-profit leg sent in a bracket order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BracketLeg {
    pub price: Decimal,
    pub qty: Decimal,
}

/// Fixed price or trailing trigger/frequency, mutually exclusive with
/// break-even — the engine enforces that constraint before this ever
/// reaches a broker implementation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum StopLossPayload {
    Fixed { price: Decimal },
    Trailing { trigger_distance: Decimal, frequency_secs: u64 },
}

/// Break-even payload. Values are always positive on both sides regardless
/// of position direction — the broker implementation is responsible for
/// signing them correctly per its own wire format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakEvenPayload {
    pub ticks: Decimal,
    pub offset: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct BracketOptions {
    pub break_even: Option<BreakEvenPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketOrderResult {
    pub entry_id: String,
    pub leg_ids: Vec<String>,
    pub sl_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRef {
    pub broker_order_id: String,
    pub broker_account_id: i64,
    pub kind: OrderKind,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFilter<'a> {
    pub symbol_root: Option<&'a str>,
    pub side: Option<Side>,
    pub statuses: &'a [OrderStatus],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub avg_entry: Decimal,
}

/// Everything the execution engine, reconciliation loop, and WS manager
/// need from a broker, independent of the wire protocol any one broker
/// actually speaks. A concrete implementation owns HMAC signing, retries,
/// and response-shape parsing; this trait only fixes the contract.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Atomic entry + TP legs + SL. `legs` is the ordered list of TP legs;
    /// `sl` is `None` when stop-loss is disabled for this strategy.
    async fn place_bracket_order(
        &self,
        account_id: i64,
        side: Side,
        qty: Decimal,
        symbol: &str,
        legs: &[BracketLeg],
        sl: Option<StopLossPayload>,
        options: BracketOptions,
    ) -> Result<BracketOrderResult, ExecutionError>;

    async fn place_market(
        &self,
        account_id: i64,
        side: Side,
        qty: Decimal,
        symbol: &str,
    ) -> Result<String, ExecutionError>;

    async fn place_limit(
        &self,
        account_id: i64,
        side: Side,
        qty: Decimal,
        symbol: &str,
        price: Decimal,
    ) -> Result<String, ExecutionError>;

    async fn cancel(&self, account_id: i64, order_id: &str) -> Result<(), ExecutionError>;

    /// MUST filter by account at source — cross-account order-list
    /// contamination is a known hazard.
    async fn list_orders(
        &self,
        account_id: i64,
        filter: OrderFilter<'_>,
    ) -> Result<Vec<OrderRef>, ExecutionError>;

    async fn list_positions(&self, account_id: i64) -> Result<Vec<BrokerPosition>, ExecutionError>;

    async fn refresh_auth(&self, account_id: i64) -> Result<DateTime<Utc>, ExecutionError>;
}

/// Helper shared by every concrete broker: the engine must never send a
/// break-even payload alongside a trailing stop.
pub fn validate_bracket_options(
    sl: Option<&StopLossPayload>,
    options: &BracketOptions,
) -> Result<(), ExecutionError> {
    if options.break_even.is_some() {
        if let Some(StopLossPayload::Trailing { .. }) = sl {
            return Err(ExecutionError::BrokerRejected(
                "break-even cannot be combined with a trailing stop".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn break_even_with_trailing_stop_is_rejected() {
        let sl = StopLossPayload::Trailing { trigger_distance: dec!(10), frequency_secs: 5 };
        let options = BracketOptions {
            break_even: Some(BreakEvenPayload { ticks: dec!(5), offset: dec!(1) }),
        };
        assert!(validate_bracket_options(Some(&sl), &options).is_err());
    }

    #[test]
    fn break_even_with_fixed_stop_is_allowed() {
        let sl = StopLossPayload::Fixed { price: dec!(2000) };
        let options = BracketOptions {
            break_even: Some(BreakEvenPayload { ticks: dec!(5), offset: dec!(1) }),
        };
        assert!(validate_bracket_options(Some(&sl), &options).is_ok());
    }
}
