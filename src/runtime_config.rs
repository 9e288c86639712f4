// =============================================================================
// Runtime Configuration — Hot-reloadable process-wide settings with atomic save
// =============================================================================
//
// Central configuration hub for process-wide operational settings: bind
// address, queue sizing, broker base URL, reconciliation cadence, trading
// mode. Per-strategy/per-trader settings live in `strategy_config.rs` with
// their own NULL-means-inherit overlay; this file is strictly the knobs an
// operator tunes for the process as a whole.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TradingMode;

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_execution_queue_capacity() -> usize {
    1024
}

fn default_execution_worker_count() -> usize {
    10
}

fn default_broker_base_url() -> String {
    "https://api.broker.example".to_string()
}

fn default_reconciliation_interval_secs() -> u64 {
    60
}

fn default_token_refresh_interval_secs() -> u64 {
    300
}

fn default_token_refresh_lead_secs() -> u64 {
    1800
}

fn default_dedup_ttl_secs() -> u64 {
    5
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_webhook_enqueue_budget_ms() -> u64 {
    50
}

/// Top-level runtime configuration for the bridge process.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Current trading mode: Live, Paused, or Killed. Process-wide; a kill
    /// overrides every strategy and account regardless of their own config.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Address the webhook HTTP server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Bounded channel capacity for the execution queue. A full queue
    /// returns 503 to the webhook caller rather than blocking.
    #[serde(default = "default_execution_queue_capacity")]
    pub execution_queue_capacity: usize,

    /// Number of workers draining the execution queue.
    #[serde(default = "default_execution_worker_count")]
    pub execution_worker_count: usize,

    /// Base URL for outbound broker REST calls.
    #[serde(default = "default_broker_base_url")]
    pub broker_base_url: String,

    /// Interval between reconciliation sweeps.
    #[serde(default = "default_reconciliation_interval_secs")]
    pub reconciliation_interval_secs: u64,

    /// Interval between token-refresh daemon passes.
    #[serde(default = "default_token_refresh_interval_secs")]
    pub token_refresh_interval_secs: u64,

    /// Refresh a token once its expiry is within this many seconds.
    #[serde(default = "default_token_refresh_lead_secs")]
    pub token_refresh_lead_secs: u64,

    /// Signal dedup window, in seconds.
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,

    /// Max entries held in the signal dedup LRU before oldest are evicted.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Soft budget, in milliseconds, the webhook handler has to enqueue a
    /// task before it should give up and respond 503 rather than stall the
    /// caller.
    #[serde(default = "default_webhook_enqueue_budget_ms")]
    pub webhook_enqueue_budget_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            bind_addr: default_bind_addr(),
            execution_queue_capacity: default_execution_queue_capacity(),
            execution_worker_count: default_execution_worker_count(),
            broker_base_url: default_broker_base_url(),
            reconciliation_interval_secs: default_reconciliation_interval_secs(),
            token_refresh_interval_secs: default_token_refresh_interval_secs(),
            token_refresh_lead_secs: default_token_refresh_lead_secs(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            dedup_capacity: default_dedup_capacity(),
            webhook_enqueue_budget_ms: default_webhook_enqueue_budget_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            trading_mode = %config.trading_mode,
            bind_addr = %config.bind_addr,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
