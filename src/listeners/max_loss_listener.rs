// =============================================================================
// Max-Loss Listener (C10)
// =============================================================================
//
// Tracks `cashBalance` per account from the `balance` WS event against a
// configured `max_daily_loss` cap. The first balance event of a session seeds
// that account's starting-balance snapshot; every later event is compared
// against the realized delta from that snapshot, not a static dollar floor —
// a breach disables resting orders, market-closes open positions, and
// disables the account's traders for the rest of the session, scoped to that
// one account, not the whole strategy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{instrument, warn};

use crate::ws::{WsEvent, WsListener};

use super::EventDedup;

const DEDUP_CAPACITY: usize = 4096;

/// Breach reaction, decoupled from the broker client so this module stays
/// testable without a live connection.
pub trait MaxLossReactor: Send + Sync {
    fn on_breach(&self, account_id: i64, cash_balance: Decimal, floor: Decimal);
}

pub struct MaxLossListener {
    max_daily_loss: RwLock<HashMap<i64, Decimal>>,
    session_start_balance: RwLock<HashMap<i64, Decimal>>,
    disabled: RwLock<HashMap<i64, bool>>,
    dedup: EventDedup,
    reactor: Arc<dyn MaxLossReactor>,
}

impl MaxLossListener {
    pub fn new(reactor: Arc<dyn MaxLossReactor>) -> Self {
        Self {
            max_daily_loss: RwLock::new(HashMap::new()),
            session_start_balance: RwLock::new(HashMap::new()),
            disabled: RwLock::new(HashMap::new()),
            dedup: EventDedup::new(DEDUP_CAPACITY),
            reactor,
        }
    }

    pub fn set_max_daily_loss(&self, account_id: i64, max_daily_loss: Decimal) {
        self.max_daily_loss.write().insert(account_id, max_daily_loss);
    }

    pub fn is_disabled_for_session(&self, account_id: i64) -> bool {
        *self.disabled.read().get(&account_id).unwrap_or(&false)
    }

    /// Reset at the start of a new trading session (e.g. daily restart).
    /// Clearing `session_start_balance` makes the next balance event reseed
    /// the day's starting snapshot, so the cap is measured against today's
    /// realized change, not whatever balance the prior session ended on.
    pub fn reset_session(&self) {
        self.disabled.write().clear();
        self.session_start_balance.write().clear();
    }

    #[instrument(skip(self))]
    fn handle_balance(&self, event_id: &str, account_id: i64, cash_balance: Decimal) {
        if !self.dedup.check_and_mark(event_id) {
            return;
        }
        if self.is_disabled_for_session(account_id) {
            return;
        }
        let Some(max_daily_loss) = self.max_daily_loss.read().get(&account_id).copied() else {
            return;
        };

        let baseline = *self.session_start_balance.write().entry(account_id).or_insert(cash_balance);
        let loss_so_far = baseline - cash_balance;

        if loss_so_far >= max_daily_loss {
            warn!(account_id, %cash_balance, %baseline, %loss_so_far, %max_daily_loss, "daily loss cap breached, disabling account for session");
            self.disabled.write().insert(account_id, true);
            self.reactor.on_breach(account_id, cash_balance, baseline - max_daily_loss);
        }
    }
}

impl WsListener for MaxLossListener {
    fn on_message(&self, event: &WsEvent) {
        if let WsEvent::Balance { event_id, account_id, cash_balance } = event {
            self.handle_balance(event_id, *account_id, *cash_balance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct RecordingReactor(parking_lot::Mutex<Vec<(i64, Decimal)>>);
    impl MaxLossReactor for RecordingReactor {
        fn on_breach(&self, account_id: i64, cash_balance: Decimal, _floor: Decimal) {
            self.0.lock().push((account_id, cash_balance));
        }
    }

    #[test]
    fn first_balance_event_seeds_baseline_without_breaching() {
        let reactor = Arc::new(RecordingReactor(parking_lot::Mutex::new(Vec::new())));
        let listener = MaxLossListener::new(reactor.clone());
        listener.set_max_daily_loss(1, dec!(500));

        // Even a low absolute balance must not breach on the very first
        // event — it establishes the day's starting snapshot, not a loss.
        listener.on_message(&WsEvent::Balance { event_id: "b1".into(), account_id: 1, cash_balance: dec!(900) });

        assert!(!listener.is_disabled_for_session(1));
        assert!(reactor.0.lock().is_empty());
    }

    #[test]
    fn breach_disables_only_that_account() {
        let reactor = Arc::new(RecordingReactor(parking_lot::Mutex::new(Vec::new())));
        let listener = MaxLossListener::new(reactor.clone());
        listener.set_max_daily_loss(1, dec!(500));
        listener.set_max_daily_loss(2, dec!(500));

        listener.on_message(&WsEvent::Balance { event_id: "b1".into(), account_id: 1, cash_balance: dec!(10000) });
        listener.on_message(&WsEvent::Balance { event_id: "b2".into(), account_id: 2, cash_balance: dec!(10000) });

        // account 1 drops 600 from its baseline, past the 500 cap; account 2
        // holds steady.
        listener.on_message(&WsEvent::Balance { event_id: "b3".into(), account_id: 1, cash_balance: dec!(9400) });
        listener.on_message(&WsEvent::Balance { event_id: "b4".into(), account_id: 2, cash_balance: dec!(9900) });

        assert!(listener.is_disabled_for_session(1));
        assert!(!listener.is_disabled_for_session(2));
        assert_eq!(reactor.0.lock().len(), 1);
    }

    #[test]
    fn loss_under_cap_does_not_breach() {
        let reactor = Arc::new(RecordingReactor(parking_lot::Mutex::new(Vec::new())));
        let listener = MaxLossListener::new(reactor.clone());
        listener.set_max_daily_loss(1, dec!(500));
        listener.on_message(&WsEvent::Balance { event_id: "b1".into(), account_id: 1, cash_balance: dec!(10000) });
        listener.on_message(&WsEvent::Balance { event_id: "b2".into(), account_id: 1, cash_balance: dec!(9700) });
        assert!(!listener.is_disabled_for_session(1));
    }

    #[test]
    fn once_disabled_further_breach_events_are_ignored() {
        let reactor = Arc::new(RecordingReactor(parking_lot::Mutex::new(Vec::new())));
        let listener = MaxLossListener::new(reactor.clone());
        listener.set_max_daily_loss(1, dec!(500));
        listener.on_message(&WsEvent::Balance { event_id: "b1".into(), account_id: 1, cash_balance: dec!(10000) });
        listener.on_message(&WsEvent::Balance { event_id: "b2".into(), account_id: 1, cash_balance: dec!(9400) });
        listener.on_message(&WsEvent::Balance { event_id: "b3".into(), account_id: 1, cash_balance: dec!(9000) });
        assert_eq!(reactor.0.lock().len(), 1);
    }

    #[test]
    fn reset_session_clears_disabled_flags_and_rebaselines() {
        let reactor = Arc::new(RecordingReactor(parking_lot::Mutex::new(Vec::new())));
        let listener = MaxLossListener::new(reactor.clone());
        listener.set_max_daily_loss(1, dec!(500));
        listener.on_message(&WsEvent::Balance { event_id: "b1".into(), account_id: 1, cash_balance: dec!(10000) });
        listener.on_message(&WsEvent::Balance { event_id: "b2".into(), account_id: 1, cash_balance: dec!(9400) });
        assert!(listener.is_disabled_for_session(1));

        listener.reset_session();
        assert!(!listener.is_disabled_for_session(1));

        // new session's baseline is whatever balance comes in next, not the
        // stale pre-breach figure.
        listener.on_message(&WsEvent::Balance { event_id: "b3".into(), account_id: 1, cash_balance: dec!(9400) });
        listener.on_message(&WsEvent::Balance { event_id: "b4".into(), account_id: 1, cash_balance: dec!(9400) });
        assert!(!listener.is_disabled_for_session(1));
    }
}
