// =============================================================================
// Signal Store (C3)
// =============================================================================
//
// Append-only record of every parsed webhook signal. Writes are
// fire-and-forget from the hot path; readers (reconciliation, UI) tolerate
// brief lag. A bounded in-memory LRU with a 5s TTL collapses duplicate
// deliveries of the same logical signal before they ever reach dispatch.

pub mod dedup;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{new_id, now_millis};
use crate::types::SignalAction;
use dedup::DedupIndex;

/// Parsed webhook payload, independent of its raw wire representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedSignal {
    pub action: SignalAction,
    pub symbol: String,
    pub price: Option<rust_decimal::Decimal>,
    pub qty: Option<rust_decimal::Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub webhook_token: String,
    pub received_ts_ms: i64,
    pub raw_payload: Value,
    pub parsed: ParsedSignal,
    pub dedup_key: String,
}

/// `hash(webhook_token, action, symbol, round(received_ts, 1s))` — two
/// signals whose key matches within the same one-second bucket are
/// considered the same logical delivery.
pub fn compute_dedup_key(
    webhook_token: &str,
    action: SignalAction,
    symbol: &str,
    received_ts_ms: i64,
) -> String {
    let bucket_secs = received_ts_ms / 1000;
    let mut hasher = DefaultHasher::new();
    webhook_token.hash(&mut hasher);
    format!("{:?}", action).hash(&mut hasher);
    symbol.to_ascii_uppercase().hash(&mut hasher);
    bucket_secs.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub struct SignalStore {
    log: RwLock<Vec<Signal>>,
    dedup: RwLock<DedupIndex>,
}

impl SignalStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            log: RwLock::new(Vec::new()),
            dedup: RwLock::new(DedupIndex::new(capacity, ttl)),
        }
    }

    /// Record a parsed signal. Returns `Ok(signal)` if this is a new,
    /// accepted signal, or `Err(existing_signal_id)` if it collapsed into a
    /// duplicate within the dedup window.
    pub fn record(
        &self,
        webhook_token: &str,
        raw_payload: Value,
        parsed: ParsedSignal,
    ) -> Result<Signal, String> {
        let received_ts_ms = now_millis();
        let dedup_key = compute_dedup_key(webhook_token, parsed.action, &parsed.symbol, received_ts_ms);
        let id = new_id();

        if let Some(existing) = self.dedup.write().check_and_insert(&dedup_key, &id) {
            return Err(existing);
        }

        let signal = Signal {
            id,
            webhook_token: webhook_token.to_string(),
            received_ts_ms,
            raw_payload,
            parsed,
            dedup_key,
        };
        self.log.write().push(signal.clone());
        Ok(signal)
    }

    pub fn recent(&self, limit: usize) -> Vec<Signal> {
        let log = self.log.read();
        let start = log.len().saturating_sub(limit);
        log[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }
}
