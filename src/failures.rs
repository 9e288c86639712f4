// =============================================================================
// Failures Feed — bounded ring buffer of recent execution failures
// =============================================================================
//
// Every failed execution task (broker rejection, queue_full drop, invariant
// violation) lands here with its classification so an operator surface can
// show what went wrong without tailing structured logs. Newest first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

const CAPACITY: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct FailureEntry {
    pub ts: DateTime<Utc>,
    pub account_id: i64,
    pub symbol: String,
    pub classification: &'static str,
    pub message: String,
    pub is_copy_follower: bool,
}

pub struct FailuresFeed {
    entries: Mutex<VecDeque<FailureEntry>>,
}

impl FailuresFeed {
    pub fn new() -> Self {
        Self { entries: Mutex::new(VecDeque::with_capacity(CAPACITY)) }
    }

    pub fn record(&self, account_id: i64, symbol: impl Into<String>, classification: &'static str, message: impl Into<String>, is_copy_follower: bool) {
        let mut entries = self.entries.lock();
        entries.push_front(FailureEntry {
            ts: Utc::now(),
            account_id,
            symbol: symbol.into(),
            classification,
            message: message.into(),
            is_copy_follower,
        });
        entries.truncate(CAPACITY);
    }

    /// Newest-first, capped at `limit`.
    pub fn recent(&self, limit: usize) -> Vec<FailureEntry> {
        self.entries.lock().iter().take(limit).cloned().collect()
    }
}

impl Default for FailuresFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_returns_newest_first() {
        let feed = FailuresFeed::new();
        feed.record(1, "GC", "transient", "first", false);
        feed.record(1, "GC", "rate_limited", "second", false);
        let recent = feed.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "second");
        assert_eq!(recent[1].message, "first");
    }

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let feed = FailuresFeed::new();
        for i in 0..(CAPACITY + 10) {
            feed.record(1, "GC", "transient", format!("n{i}"), false);
        }
        let recent = feed.recent(CAPACITY + 10);
        assert_eq!(recent.len(), CAPACITY);
        assert_eq!(recent[0].message, format!("n{}", CAPACITY + 9));
    }
}
