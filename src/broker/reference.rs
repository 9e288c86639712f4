// =============================================================================
// Reference Broker Client — HMAC-signed REST implementation of BrokerClient
// =============================================================================
//
// SECURITY: secrets are never logged or serialized. Every signed request
// carries a recvWindow of 5000ms to tolerate minor clock drift between this
// process and the broker.
//
// This is one concrete implementation of the `BrokerClient` trait, wired to
// a generic signed-REST futures broker. A production deployment swaps this
// module for its broker's actual SDK without touching the execution engine,
// reconciliation loop, or WS manager — all of which depend only on the
// trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use super::rate_limit::RateLimiterRegistry;
use super::{
    BracketLeg, BracketOptions, BracketOrderResult, BrokerClient, BrokerPosition, OrderFilter,
    OrderRef, StopLossPayload, validate_bracket_options,
};
use crate::errors::ExecutionError;
use crate::types::{OrderKind, OrderStatus, Side};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub api_key: String,
    pub secret: String,
    pub token_key: String,
    pub expires_at: DateTime<Utc>,
}

pub struct ReferenceBrokerClient {
    base_url: String,
    client: reqwest::Client,
    accounts: RwLock<HashMap<i64, AccountCredentials>>,
    rate_limiters: Arc<RateLimiterRegistry>,
}

impl ReferenceBrokerClient {
    pub fn new(base_url: impl Into<String>, rate_limiters: Arc<RateLimiterRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
            accounts: RwLock::new(HashMap::new()),
            rate_limiters,
        }
    }

    pub fn register_account(&self, account_id: i64, creds: AccountCredentials) {
        self.rate_limiters.for_token(&creds.token_key).register_account();
        self.accounts.write().insert(account_id, creds);
    }

    fn credentials_for(&self, account_id: i64) -> Result<AccountCredentials, ExecutionError> {
        self.accounts
            .read()
            .get(&account_id)
            .cloned()
            .ok_or_else(|| ExecutionError::ConfigMissing(format!("no credentials registered for account {account_id}")))
    }

    fn sign(secret: &str, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(secret: &str, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = Self::sign(secret, &base);
        format!("{base}&signature={sig}")
    }

    fn classify_status(status: StatusCode, body: &serde_json::Value) -> ExecutionError {
        match status.as_u16() {
            401 => ExecutionError::AuthExpired,
            429 => ExecutionError::RateLimited(body.to_string()),
            400..=499 => ExecutionError::BrokerRejected(body.to_string()),
            _ => ExecutionError::Transient(format!("{status}: {body}")),
        }
    }

    async fn signed_request(
        &self,
        account_id: i64,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value, ExecutionError> {
        let creds = self.credentials_for(account_id)?;
        let limiter = self.rate_limiters.for_token(&creds.token_key);
        if !limiter.can_send_request(10) {
            return Err(ExecutionError::RateLimited("token weight budget exhausted for this account".to_string()));
        }

        let qs = Self::signed_query(&creds.secret, params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .request(method, &url)
            .header("X-API-KEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| ExecutionError::Transient(e.to_string()))?;

        limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExecutionError::Transient(format!("failed to parse response body: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }
        Ok(body)
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Long => "BUY",
        Side::Short => "SELL",
    }
}

#[async_trait]
impl BrokerClient for ReferenceBrokerClient {
    #[instrument(skip(self, legs, sl, options), fields(account_id, symbol))]
    async fn place_bracket_order(
        &self,
        account_id: i64,
        side: Side,
        qty: Decimal,
        symbol: &str,
        legs: &[BracketLeg],
        sl: Option<StopLossPayload>,
        options: BracketOptions,
    ) -> Result<BracketOrderResult, ExecutionError> {
        validate_bracket_options(sl.as_ref(), &options)?;

        let entry_id = self.place_market(account_id, side, qty, symbol).await?;

        let exit_side = side.opposite();
        let mut leg_ids = Vec::with_capacity(legs.len());
        for leg in legs {
            let id = self.place_limit(account_id, exit_side, leg.qty, symbol, leg.price).await?;
            leg_ids.push(id);
        }

        let sl_id = match sl {
            Some(StopLossPayload::Fixed { price }) => {
                let params = format!(
                    "symbol={symbol}&side={}&type=STOP&quantity={qty}&stopPrice={price}",
                    side_str(exit_side)
                );
                let body = self.signed_request(account_id, reqwest::Method::POST, "/v1/order", &params).await?;
                Some(body["orderId"].to_string())
            }
            Some(StopLossPayload::Trailing { trigger_distance, frequency_secs }) => {
                let params = format!(
                    "symbol={symbol}&side={}&type=TRAILING_STOP&quantity={qty}&activationDistance={trigger_distance}&frequencySecs={frequency_secs}",
                    side_str(exit_side)
                );
                let body = self.signed_request(account_id, reqwest::Method::POST, "/v1/order", &params).await?;
                Some(body["orderId"].to_string())
            }
            None => None,
        };

        debug!(account_id, symbol, entry_id = %entry_id, leg_count = leg_ids.len(), "bracket order placed");
        Ok(BracketOrderResult { entry_id, leg_ids, sl_id })
    }

    async fn place_market(&self, account_id: i64, side: Side, qty: Decimal, symbol: &str) -> Result<String, ExecutionError> {
        let params = format!("symbol={symbol}&side={}&type=MARKET&quantity={qty}", side_str(side));
        let body = self.signed_request(account_id, reqwest::Method::POST, "/v1/order", &params).await?;
        self.rate_limiters
            .for_token(&self.credentials_for(account_id)?.token_key)
            .record_order_sent();
        Ok(body["orderId"].to_string())
    }

    async fn place_limit(&self, account_id: i64, side: Side, qty: Decimal, symbol: &str, price: Decimal) -> Result<String, ExecutionError> {
        let params = format!(
            "symbol={symbol}&side={}&type=LIMIT&quantity={qty}&price={price}&timeInForce=GTC",
            side_str(side)
        );
        let body = self.signed_request(account_id, reqwest::Method::POST, "/v1/order", &params).await?;
        self.rate_limiters
            .for_token(&self.credentials_for(account_id)?.token_key)
            .record_order_sent();
        Ok(body["orderId"].to_string())
    }

    async fn cancel(&self, account_id: i64, order_id: &str) -> Result<(), ExecutionError> {
        let params = format!("orderId={order_id}");
        self.signed_request(account_id, reqwest::Method::DELETE, "/v1/order", &params).await?;
        Ok(())
    }

    async fn list_orders(&self, account_id: i64, filter: OrderFilter<'_>) -> Result<Vec<OrderRef>, ExecutionError> {
        let body = self.signed_request(account_id, reqwest::Method::GET, "/v1/openOrders", "").await?;
        let raw = body.as_array().cloned().unwrap_or_default();

        let orders: Vec<OrderRef> = raw
            .into_iter()
            .filter_map(|entry| parse_order_ref(account_id, &entry))
            .filter(|o| {
                filter
                    .symbol_root
                    .map(|root| crate::instruments::root_of(&o.symbol).map(|r| r == root).unwrap_or(false))
                    .unwrap_or(true)
            })
            .filter(|o| filter.side.map(|s| s == o.side).unwrap_or(true))
            .filter(|o| filter.statuses.is_empty() || filter.statuses.contains(&o.status))
            .collect();

        Ok(orders)
    }

    async fn list_positions(&self, account_id: i64) -> Result<Vec<BrokerPosition>, ExecutionError> {
        let body = self.signed_request(account_id, reqwest::Method::GET, "/v1/positions", "").await?;
        let raw = body.as_array().cloned().unwrap_or_default();
        Ok(raw.into_iter().filter_map(parse_broker_position).collect())
    }

    async fn refresh_auth(&self, account_id: i64) -> Result<DateTime<Utc>, ExecutionError> {
        let body = self.signed_request(account_id, reqwest::Method::POST, "/v1/auth/refresh", "").await?;
        let expires_in_secs = body["expiresIn"].as_i64().unwrap_or(3600);
        let new_expiry = Utc::now() + chrono::Duration::seconds(expires_in_secs);

        if let Some(creds) = self.accounts.write().get_mut(&account_id) {
            creds.expires_at = new_expiry;
        }
        Ok(new_expiry)
    }
}

fn parse_order_ref(account_id: i64, entry: &serde_json::Value) -> Option<OrderRef> {
    let broker_order_id = entry["orderId"].to_string();
    let symbol = entry["symbol"].as_str()?.to_string();
    let side = match entry["side"].as_str()? {
        "BUY" => Side::Long,
        "SELL" => Side::Short,
        _ => return None,
    };
    let qty: Decimal = entry["origQty"].as_str().and_then(|s| s.parse().ok())?;
    let price: Option<Decimal> = entry["price"].as_str().and_then(|s| s.parse().ok());
    let status = match entry["status"].as_str()? {
        "NEW" => OrderStatus::Accepted,
        "PARTIALLY_FILLED" => OrderStatus::Working,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" | "EXPIRED" => OrderStatus::Rejected,
        _ => return None,
    };
    let kind = match entry["type"].as_str()? {
        "MARKET" => OrderKind::EntryMarket,
        "LIMIT" => OrderKind::TpLimit,
        "STOP" | "TRAILING_STOP" => OrderKind::SlStop,
        _ => OrderKind::OcoPartner,
    };

    Some(OrderRef { broker_order_id, broker_account_id: account_id, kind, symbol, side, qty, price, status })
}

fn parse_broker_position(entry: serde_json::Value) -> Option<BrokerPosition> {
    let symbol = entry["symbol"].as_str()?.to_string();
    let qty: Decimal = entry["positionAmt"].as_str().and_then(|s| s.parse().ok())?;
    let side = if qty.is_sign_negative() { Side::Short } else { Side::Long };
    let avg_entry: Decimal = entry["entryPrice"].as_str().and_then(|s| s.parse().ok())?;
    Some(BrokerPosition { symbol, side, qty: qty.abs(), avg_entry })
}
