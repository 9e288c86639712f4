// =============================================================================
// Instrument Registry — symbol root resolution and tick arithmetic
// =============================================================================
//
// Maps a raw chart ticker (e.g. `GCJ6`, `MNQZ5`, `MNQ1!`) to a canonical
// symbol root and its trading constants. The root table is a static list
// shipped with the binary; there is no remote lookup and no default
// fallback — an unrecognized root is a hard error, never a silent guess.

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown instrument symbol: {0}")]
pub struct UnknownSymbol(pub String);

/// Tick size and tick value for one instrument root.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentSpec {
    pub root: &'static str,
    pub tick_size: Decimal,
    pub tick_value: Decimal,
}

// Ordered so 3-character roots are checked before 2-character roots at the
// call site; within each length group, order doesn't matter.
const ROOTS: &[InstrumentSpec] = &[
    InstrumentSpec { root: "MNQ", tick_size: dec!(0.25), tick_value: dec!(0.50) },
    InstrumentSpec { root: "MES", tick_size: dec!(0.25), tick_value: dec!(1.25) },
    InstrumentSpec { root: "MGC", tick_size: dec!(0.10), tick_value: dec!(1.00) },
    InstrumentSpec { root: "MCL", tick_size: dec!(0.01), tick_value: dec!(1.00) },
    InstrumentSpec { root: "M2K", tick_size: dec!(0.10), tick_value: dec!(0.50) },
    InstrumentSpec { root: "NQ", tick_size: dec!(0.25), tick_value: dec!(5.00) },
    InstrumentSpec { root: "ES", tick_size: dec!(0.25), tick_value: dec!(12.50) },
    InstrumentSpec { root: "GC", tick_size: dec!(0.10), tick_value: dec!(10.00) },
    InstrumentSpec { root: "CL", tick_size: dec!(0.01), tick_value: dec!(10.00) },
    InstrumentSpec { root: "SI", tick_size: dec!(0.005), tick_value: dec!(25.00) },
    InstrumentSpec { root: "ZB", tick_size: dec!(0.03125), tick_value: dec!(31.25) },
    InstrumentSpec { root: "RTY", tick_size: dec!(0.10), tick_value: dec!(5.00) },
];

const CONTRACT_MONTHS: &[char] = &['H', 'J', 'K', 'M', 'N', 'Q', 'U', 'V', 'X', 'Z'];

fn find_root(prefix: &str, len: usize) -> Option<&'static InstrumentSpec> {
    if prefix.len() < len {
        return None;
    }
    let candidate = &prefix[..len];
    ROOTS.iter().find(|spec| spec.root.eq_ignore_ascii_case(candidate))
}

/// Strip a trailing contract-month/year suffix and resolve the remaining
/// prefix to a known root. Tries a 3-character match before falling back to
/// 2 characters, so two-letter roots like `GC` never swallow a month letter
/// out of a 3-letter ticker such as `GCJ6`.
pub fn root_of(ticker: &str) -> Result<&'static str, UnknownSymbol> {
    let prefix: String = ticker
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    let prefix = prefix.to_ascii_uppercase();

    if let Some(spec) = find_root(&prefix, 3) {
        return Ok(spec.root);
    }
    if let Some(spec) = find_root(&prefix, 2) {
        return Ok(spec.root);
    }
    Err(UnknownSymbol(ticker.to_string()))
}

fn spec_for(root: &str) -> Result<&'static InstrumentSpec, UnknownSymbol> {
    ROOTS
        .iter()
        .find(|spec| spec.root.eq_ignore_ascii_case(root))
        .ok_or_else(|| UnknownSymbol(root.to_string()))
}

pub fn tick_size(root: &str) -> Result<Decimal, UnknownSymbol> {
    spec_for(root).map(|s| s.tick_size)
}

pub fn tick_value(root: &str) -> Result<Decimal, UnknownSymbol> {
    spec_for(root).map(|s| s.tick_value)
}

/// `round(round(price/tick)*tick, 10)`. The double-round collapses floating
/// residue from weighted-average arithmetic that would otherwise trip a
/// broker's increment validation. All prices sent over the wire must pass
/// through this function.
pub fn round_to_tick(price: Decimal, root: &str) -> Result<Decimal, UnknownSymbol> {
    let tick = tick_size(root)?;
    let ticks = (price / tick).round();
    let rounded = (ticks * tick).round_dp(10);
    Ok(rounded)
}

/// True if `ticker`'s leading alphabetic prefix ends in one of the
/// recognized contract-month letters, used by callers that want to strip a
/// month/year suffix for logging without resolving the full root.
pub fn has_contract_month_suffix(ticker: &str) -> bool {
    ticker
        .chars()
        .find(|c| !c.is_ascii_alphabetic())
        .map(|_| false)
        .unwrap_or(false)
        || ticker
            .chars()
            .rev()
            .find(|c| c.is_ascii_alphabetic())
            .map(|c| CONTRACT_MONTHS.contains(&c.to_ascii_uppercase()))
            .unwrap_or(false)
}
