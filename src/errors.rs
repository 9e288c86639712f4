// =============================================================================
// Execution error taxonomy
// =============================================================================
//
// A structured, matchable error kind per call surface. Daemon loops and glue
// code still use `anyhow::Result` for convenience, but anything that crosses
// the executor/broker boundary returns one of these variants so the worker
// can decide retry/backoff/repair policy instead of treating every failure
// as an opaque string.

use thiserror::Error;

use crate::instruments::UnknownSymbol;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Broker 5xx or network timeout. Retried with backoff for idempotent
    /// ops (cancels, status polls); never retried for entry placement.
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Broker responded 429. Caller must back off and update the
    /// token-level rate limiter; this does not count as a failed attempt.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Broker responded 401. `needs_reauth` is set; current task fails;
    /// the token refresh daemon heals this asynchronously.
    #[error("auth expired")]
    AuthExpired,

    /// Order-shape rejection: tick misalignment, invalid params, signed/
    /// unsigned SL mismatch. Non-retriable — this is a code-bug class, not
    /// a broker hiccup. Surfaced to the failures feed with the full payload.
    #[error("broker rejected order: {0}")]
    BrokerRejected(String),

    /// Local state disagrees with broker truth (qty mismatch, orphaned TP,
    /// stale open signal). Reconciliation repairs on its next sweep; the
    /// entry path proceeds using broker truth, the close path fails.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The execution queue is at capacity. No retry; caller returns 503.
    #[error("execution queue full")]
    QueueFull,

    #[error("unknown instrument symbol: {0}")]
    UnknownSymbol(String),

    /// A required config value (e.g. `initial_qty`) was absent or null and
    /// no webhook-supplied override was present either.
    #[error("missing required configuration: {0}")]
    ConfigMissing(String),
}

impl From<UnknownSymbol> for ExecutionError {
    fn from(err: UnknownSymbol) -> Self {
        ExecutionError::UnknownSymbol(err.0)
    }
}

impl ExecutionError {
    /// Short tag used as the `classification` field in structured logs and
    /// in the failures feed.
    pub fn classification(&self) -> &'static str {
        match self {
            ExecutionError::Transient(_) => "transient",
            ExecutionError::RateLimited(_) => "rate_limited",
            ExecutionError::AuthExpired => "auth_expired",
            ExecutionError::BrokerRejected(_) => "broker_rejected",
            ExecutionError::InvariantViolation(_) => "invariant_violation",
            ExecutionError::QueueFull => "queue_full",
            ExecutionError::UnknownSymbol(_) => "unknown_symbol",
            ExecutionError::ConfigMissing(_) => "config_missing",
        }
    }

    /// Whether this error class is safe to retry for idempotent operations
    /// (cancels, status polls) — never for entry placement, which the
    /// caller must gate separately to avoid duplicate fills.
    pub fn is_retriable_for_idempotent_ops(&self) -> bool {
        matches!(self, ExecutionError::Transient(_) | ExecutionError::RateLimited(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy_names() {
        assert_eq!(ExecutionError::AuthExpired.classification(), "auth_expired");
        assert_eq!(ExecutionError::QueueFull.classification(), "queue_full");
        assert_eq!(
            ExecutionError::BrokerRejected("tick misaligned".into()).classification(),
            "broker_rejected"
        );
    }

    #[test]
    fn only_transient_and_rate_limited_are_retriable() {
        assert!(ExecutionError::Transient("timeout".into()).is_retriable_for_idempotent_ops());
        assert!(ExecutionError::RateLimited("429".into()).is_retriable_for_idempotent_ops());
        assert!(!ExecutionError::BrokerRejected("bad params".into()).is_retriable_for_idempotent_ops());
        assert!(!ExecutionError::AuthExpired.is_retriable_for_idempotent_ops());
    }

    #[test]
    fn unknown_symbol_converts_from_instrument_error() {
        let err: ExecutionError = UnknownSymbol("ZZZQ6".to_string()).into();
        assert!(matches!(err, ExecutionError::UnknownSymbol(s) if s == "ZZZQ6"));
    }
}
