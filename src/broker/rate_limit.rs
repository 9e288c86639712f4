// =============================================================================
// Token-scoped rate limiter
// =============================================================================
//
// The broker's rate limit is per-token, not per-account. A token may
// be shared by N accounts, so the effective call budget any one account may
// assume for itself is `quota/N`. One `TokenRateLimiter` is shared by every
// account registered under the same `token_key`; atomic counters let any
// thread query or update it lock-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Hard ceiling on request weight per rolling minute, shared across every
/// account on this token.
const WEIGHT_HARD_LIMIT: u32 = 1000;
const WEIGHT_WARN_THRESHOLD: u32 = 800;
const ORDER_10S_LIMIT: u32 = 10;
const ORDER_1D_LIMIT: u32 = 200_000;

pub struct TokenRateLimiter {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    order_count_1d: AtomicU32,
    account_count: AtomicU32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub order_count_10s: u32,
    pub order_count_1d: u32,
    pub account_count: u32,
    pub per_account_weight_budget: u32,
}

impl TokenRateLimiter {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_count_1d: AtomicU32::new(0),
            account_count: AtomicU32::new(0),
        }
    }

    pub fn register_account(&self) {
        self.account_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deregister_account(&self) {
        self.account_count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        }).ok();
    }

    /// The weight any single account sharing this token may assume it can
    /// spend right now, i.e. `quota_remaining / N`.
    pub fn per_account_weight_budget(&self) -> u32 {
        let n = self.account_count.load(Ordering::Relaxed).max(1);
        let used = self.used_weight_1m.load(Ordering::Relaxed);
        let remaining = WEIGHT_HARD_LIMIT.saturating_sub(used);
        remaining / n
    }

    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(val) = headers.get("X-RATE-USED-WEIGHT-1M") {
            if let Ok(s) = val.to_str() {
                if let Ok(w) = s.parse::<u32>() {
                    let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
                    if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                        warn!(used_weight = w, hard_limit = WEIGHT_HARD_LIMIT, "rate-limit weight crossed warning threshold");
                    }
                }
            }
        }
        if let Some(val) = headers.get("X-RATE-ORDER-COUNT-10S") {
            if let Ok(s) = val.to_str() {
                if let Ok(c) = s.parse::<u32>() {
                    self.order_count_10s.store(c, Ordering::Relaxed);
                }
            }
        }
        if let Some(val) = headers.get("X-RATE-ORDER-COUNT-1D") {
            if let Ok(s) = val.to_str() {
                if let Ok(c) = s.parse::<u32>() {
                    self.order_count_1d.store(c, Ordering::Relaxed);
                }
            }
        }
    }

    /// Whether a single account may afford to spend `weight` more, given the
    /// shared token quota divided across every account currently registered
    /// on it.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let allowed = weight <= self.per_account_weight_budget();
        if !allowed {
            warn!(
                weight,
                budget = self.per_account_weight_budget(),
                "request blocked — would exceed this account's share of the token's rate limit"
            );
        }
        allowed
    }

    pub fn can_place_order(&self) -> bool {
        let count_10s = self.order_count_10s.load(Ordering::Relaxed);
        let count_1d = self.order_count_1d.load(Ordering::Relaxed);
        if count_10s >= ORDER_10S_LIMIT {
            warn!(count_10s, limit = ORDER_10S_LIMIT, "order blocked — 10s order limit reached");
            return false;
        }
        if count_1d >= ORDER_1D_LIMIT {
            warn!(count_1d, limit = ORDER_1D_LIMIT, "order blocked — daily order limit reached");
            return false;
        }
        true
    }

    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
        self.order_count_1d.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_10s_counter(&self) {
        self.order_count_10s.store(0, Ordering::Relaxed);
    }

    pub fn reset_1m_weight(&self) {
        self.used_weight_1m.store(0, Ordering::Relaxed);
    }

    pub fn reset_daily_counter(&self) {
        self.order_count_1d.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            order_count_1d: self.order_count_1d.load(Ordering::Relaxed),
            account_count: self.account_count.load(Ordering::Relaxed),
            per_account_weight_budget: self.per_account_weight_budget(),
        }
    }
}

impl Default for TokenRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of one `TokenRateLimiter` per `token_key`, so every account
/// sharing a token shares the same counters.
pub struct RateLimiterRegistry {
    limiters: RwLock<HashMap<String, Arc<TokenRateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self { limiters: RwLock::new(HashMap::new()) }
    }

    pub fn for_token(&self, token_key: &str) -> Arc<TokenRateLimiter> {
        if let Some(existing) = self.limiters.read().get(token_key) {
            return existing.clone();
        }
        let mut limiters = self.limiters.write();
        limiters
            .entry(token_key.to_string())
            .or_insert_with(|| Arc::new(TokenRateLimiter::new()))
            .clone()
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
