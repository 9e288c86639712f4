// =============================================================================
// Webhook filter chain
// =============================================================================
//
// Evaluated in order, first-fail short-circuits: direction, time window(s),
// cooldown, session cap, daily loss cap, contract cap, every-Nth-signal.
// State is mutated only on a full pass — a signal rejected partway through
// must not advance the cooldown clock or consume a session-cap slot.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRejection {
    Direction,
    TimeWindow,
    Cooldown,
    SessionCap,
    DailyLossCap,
    ContractCap,
    EveryNthSignal,
}

impl std::fmt::Display for FilterRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Direction => "direction_filter",
            Self::TimeWindow => "time_window",
            Self::Cooldown => "cooldown",
            Self::SessionCap => "session_cap",
            Self::DailyLossCap => "daily_loss_cap",
            Self::ContractCap => "contract_cap",
            Self::EveryNthSignal => "every_nth_signal",
        };
        write!(f, "{s}")
    }
}

/// Per-strategy running counters the filter chain consults and updates.
/// Session-scoped fields are reset by `reset_session` (called by whatever
/// owns the daily rollover, e.g. the reconciliation loop at session open).
pub struct FilterState {
    last_accepted_ms: AtomicI64,
    session_count: AtomicU32,
    seen_count: AtomicU32,
    has_last_accepted: Mutex<bool>,
}

impl FilterState {
    pub fn new() -> Self {
        Self {
            last_accepted_ms: AtomicI64::new(0),
            session_count: AtomicU32::new(0),
            seen_count: AtomicU32::new(0),
            has_last_accepted: Mutex::new(false),
        }
    }

    pub fn reset_session(&self) {
        self.session_count.store(0, Ordering::Relaxed);
        self.seen_count.store(0, Ordering::Relaxed);
        *self.has_last_accepted.lock() = false;
    }
}

impl Default for FilterState {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the full chain for one signal. `qty_after_multiplier` and
/// `daily_realized_loss` are already-resolved numbers; this function makes
/// no broker calls.
#[allow(clippy::too_many_arguments)]
pub fn evaluate(
    filters: &crate::strategy_config::FilterSet,
    state: &FilterState,
    entry_side: Option<Side>,
    now_ms: i64,
    minute_of_day: u32,
    qty_after_multiplier: Decimal,
    daily_realized_loss: Decimal,
) -> Result<(), FilterRejection> {
    if let (Some(required), Some(actual)) = (filters.direction, entry_side) {
        if required != actual {
            return Err(FilterRejection::Direction);
        }
    }

    if !filters.time_windows.is_empty() {
        let in_window = filters
            .time_windows
            .iter()
            .any(|(start, end)| minute_of_day >= *start && minute_of_day <= *end);
        if !in_window {
            return Err(FilterRejection::TimeWindow);
        }
    }

    if let Some(cooldown_secs) = filters.cooldown_secs {
        if *state.has_last_accepted.lock() {
            let elapsed_ms = now_ms - state.last_accepted_ms.load(Ordering::Relaxed);
            if elapsed_ms < (cooldown_secs as i64) * 1000 {
                return Err(FilterRejection::Cooldown);
            }
        }
    }

    if let Some(cap) = filters.session_cap {
        if state.session_count.load(Ordering::Relaxed) >= cap {
            return Err(FilterRejection::SessionCap);
        }
    }

    if let Some(cap) = filters.daily_loss_cap {
        if daily_realized_loss <= -cap {
            return Err(FilterRejection::DailyLossCap);
        }
    }

    if let Some(cap) = filters.contract_cap {
        if qty_after_multiplier > cap {
            return Err(FilterRejection::ContractCap);
        }
    }

    if let Some(n) = filters.every_nth_signal {
        let seen = state.seen_count.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 0 || seen % n != 0 {
            return Err(FilterRejection::EveryNthSignal);
        }
    }

    state.last_accepted_ms.store(now_ms, Ordering::Relaxed);
    *state.has_last_accepted.lock() = true;
    state.session_count.fetch_add(1, Ordering::Relaxed);
    Ok(())
}
