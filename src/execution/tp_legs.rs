// =============================================================================
// Take-profit leg construction
// =============================================================================
//
// Turns a Strategy's ordered `TpTarget` list into concrete broker-ready legs:
// a price (snapped to the instrument's tick grid) and a quantity. Distance
// and trim units are resolved independently of each other per target.

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;

use crate::broker::BracketLeg;
use crate::errors::ExecutionError;
use crate::instruments::{round_to_tick, tick_size};
use crate::strategy_config::TpTarget;
use crate::types::{DistanceUnit, Side, TrimUnit};

/// Price distance for one target, in the instrument's native price units.
fn resolve_distance(entry: rust_decimal::Decimal, root: &str, target: &TpTarget) -> Result<rust_decimal::Decimal, ExecutionError> {
    let v = target.distance.value;
    Ok(match target.distance.unit {
        DistanceUnit::Ticks => v * tick_size(root)?,
        DistanceUnit::Points => v,
        DistanceUnit::Percent => entry * v / dec!(100),
    })
}

/// Leg quantity before last-leg rebalancing. Percent trim: at least 1
/// contract, rounded off total qty. Contracts trim: the configured count
/// scaled by the trader's multiplier, clamped into `[1, remaining]`.
fn resolve_leg_qty(
    target: &TpTarget,
    total_qty: rust_decimal::Decimal,
    multiplier: rust_decimal::Decimal,
    remaining: rust_decimal::Decimal,
) -> rust_decimal::Decimal {
    let raw = match target.trim.unit {
        TrimUnit::Percent => (total_qty * target.trim.value / dec!(100)).round(),
        TrimUnit::Contracts => (target.trim.value * multiplier).round(),
    };
    raw.max(Decimal::ONE).min(remaining)
}

/// Build the ordered TP legs for a bracket order. The final leg absorbs
/// whatever quantity remains after the earlier legs round off, so the legs
/// always sum to exactly `total_qty`.
pub fn compute_tp_legs(
    entry: rust_decimal::Decimal,
    side: Side,
    root: &str,
    total_qty: rust_decimal::Decimal,
    multiplier: rust_decimal::Decimal,
    targets: &[TpTarget],
) -> Result<Vec<BracketLeg>, ExecutionError> {
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    let direction = rust_decimal::Decimal::from(side.direction());
    let mut legs = Vec::with_capacity(targets.len());
    let mut remaining = total_qty;

    for (i, target) in targets.iter().enumerate() {
        let is_last = i == targets.len() - 1;
        let qty = if is_last {
            remaining
        } else {
            resolve_leg_qty(target, total_qty, multiplier, remaining)
        };

        let distance = resolve_distance(entry, root, target)?;
        let raw_price = entry + direction * distance;
        let price = round_to_tick(raw_price, root)?;

        legs.push(BracketLeg { price, qty });
        remaining -= qty;

        if remaining <= Decimal::ZERO && !is_last {
            // Earlier legs already consumed the whole position; every
            // remaining target gets the tick-rounded price but zero qty
            // skipped entirely rather than emitting a zero-size leg.
            break;
        }
    }

    Ok(legs)
}
