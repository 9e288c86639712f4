// =============================================================================
// Token Refresh Daemon (C14)
// =============================================================================
//
// Every 5 minutes, walks the registered broker accounts and refreshes auth
// for any whose token expires within 30 minutes. A refresh failure adds the
// account to `needs_reauth` instead of retrying inline — a human or an
// operator action clears it once the account is re-authorized.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, instrument, warn};

use crate::broker::BrokerClient;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const REFRESH_WINDOW: chrono::Duration = chrono::Duration::minutes(30);

pub struct TokenRefreshDaemon {
    broker: Arc<dyn BrokerClient>,
    expiries: RwLock<std::collections::HashMap<i64, DateTime<Utc>>>,
    needs_reauth: RwLock<HashSet<i64>>,
}

impl TokenRefreshDaemon {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            expiries: RwLock::new(std::collections::HashMap::new()),
            needs_reauth: RwLock::new(HashSet::new()),
        }
    }

    /// Record (or update) the known expiry for an account, e.g. after a
    /// successful login or a manual re-auth clears `needs_reauth`.
    pub fn register_account(&self, account_id: i64, expires_at: DateTime<Utc>) {
        self.expiries.write().insert(account_id, expires_at);
        self.needs_reauth.write().remove(&account_id);
    }

    pub fn needs_reauth_accounts(&self) -> Vec<i64> {
        self.needs_reauth.read().iter().copied().collect()
    }

    pub fn is_healthy(&self, account_id: i64) -> bool {
        !self.needs_reauth.read().contains(&account_id)
    }

    #[instrument(skip(self, account_id), fields(account_id))]
    async fn refresh_one(&self, account_id: i64) {
        match self.broker.refresh_auth(account_id).await {
            Ok(new_expiry) => {
                self.expiries.write().insert(account_id, new_expiry);
                self.needs_reauth.write().remove(&account_id);
                info!(new_expiry = %new_expiry, "refreshed broker auth");
            }
            Err(err) => {
                warn!(error = %err, "auth refresh failed; marking account for re-auth");
                self.needs_reauth.write().insert(account_id);
            }
        }
    }

    /// One sweep: every account whose known expiry is within the refresh
    /// window gets a refresh attempt. Accounts with no recorded expiry are
    /// skipped — they haven't been registered yet, which is the caller's
    /// responsibility at account-link time.
    pub async fn run_once(&self) {
        let due: Vec<i64> = {
            let now = Utc::now();
            self.expiries
                .read()
                .iter()
                .filter(|(_, expiry)| **expiry - now < REFRESH_WINDOW)
                .map(|(id, _)| *id)
                .collect()
        };

        for account_id in due {
            self.refresh_one(account_id).await;
        }
    }

    /// Run forever on a fixed tick. Intended to be spawned once at startup.
    pub async fn run_forever(self: Arc<Self>) {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            interval.tick().await;
            self.run_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BracketLeg, BracketOptions, BracketOrderResult, BrokerPosition, OrderFilter, OrderRef, StopLossPayload};
    use crate::errors::ExecutionError;
    use crate::types::Side;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    struct StubBroker {
        fail_accounts: HashSet<i64>,
        refreshed: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl BrokerClient for StubBroker {
        async fn place_bracket_order(&self, _a: i64, _s: Side, _q: Decimal, _sym: &str, _legs: &[BracketLeg], _sl: Option<StopLossPayload>, _o: BracketOptions) -> Result<BracketOrderResult, ExecutionError> {
            unimplemented!()
        }
        async fn place_market(&self, _a: i64, _s: Side, _q: Decimal, _sym: &str) -> Result<String, ExecutionError> {
            unimplemented!()
        }
        async fn place_limit(&self, _a: i64, _s: Side, _q: Decimal, _sym: &str, _p: Decimal) -> Result<String, ExecutionError> {
            unimplemented!()
        }
        async fn cancel(&self, _a: i64, _order_id: &str) -> Result<(), ExecutionError> {
            unimplemented!()
        }
        async fn list_orders(&self, _a: i64, _f: OrderFilter<'_>) -> Result<Vec<OrderRef>, ExecutionError> {
            unimplemented!()
        }
        async fn list_positions(&self, _a: i64) -> Result<Vec<BrokerPosition>, ExecutionError> {
            unimplemented!()
        }
        async fn refresh_auth(&self, account_id: i64) -> Result<DateTime<Utc>, ExecutionError> {
            if self.fail_accounts.contains(&account_id) {
                Err(ExecutionError::AuthExpired)
            } else {
                self.refreshed.lock().push(account_id);
                Ok(Utc::now() + chrono::Duration::hours(1))
            }
        }
    }

    #[tokio::test]
    async fn account_expiring_soon_is_refreshed() {
        let broker = Arc::new(StubBroker { fail_accounts: HashSet::new(), refreshed: Mutex::new(vec![]) });
        let daemon = TokenRefreshDaemon::new(broker.clone());
        daemon.register_account(1, Utc::now() + chrono::Duration::minutes(10));
        daemon.run_once().await;
        assert_eq!(broker.refreshed.lock().clone(), vec![1]);
        assert!(daemon.is_healthy(1));
    }

    #[tokio::test]
    async fn account_with_plenty_of_runway_is_left_alone() {
        let broker = Arc::new(StubBroker { fail_accounts: HashSet::new(), refreshed: Mutex::new(vec![]) });
        let daemon = TokenRefreshDaemon::new(broker.clone());
        daemon.register_account(1, Utc::now() + chrono::Duration::hours(2));
        daemon.run_once().await;
        assert!(broker.refreshed.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_marks_account_needing_reauth() {
        let mut fail = HashSet::new();
        fail.insert(1);
        let broker = Arc::new(StubBroker { fail_accounts: fail, refreshed: Mutex::new(vec![]) });
        let daemon = TokenRefreshDaemon::new(broker);
        daemon.register_account(1, Utc::now() + chrono::Duration::minutes(5));
        daemon.run_once().await;
        assert!(!daemon.is_healthy(1));
        assert_eq!(daemon.needs_reauth_accounts(), vec![1]);
    }

    #[tokio::test]
    async fn successful_reregistration_clears_needs_reauth() {
        let mut fail = HashSet::new();
        fail.insert(1);
        let broker = Arc::new(StubBroker { fail_accounts: fail, refreshed: Mutex::new(vec![]) });
        let daemon = TokenRefreshDaemon::new(broker);
        daemon.register_account(1, Utc::now() + chrono::Duration::minutes(5));
        daemon.run_once().await;
        assert!(!daemon.is_healthy(1));

        daemon.register_account(1, Utc::now() + chrono::Duration::hours(1));
        assert!(daemon.is_healthy(1));
    }
}
