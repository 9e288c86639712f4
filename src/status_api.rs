// =============================================================================
// Operator Read Surface
// =============================================================================
//
// `GET /health`, `/positions`, `/trades`, `/failures` — a thin read-only
// window over the Position Mirror and the failures feed. No write
// endpoints live here; everything mutating state still goes through the
// webhook dispatcher.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/positions", get(positions))
        .route("/trades", get(trades))
        .route("/failures", get(failures))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.mirror.open_positions())
}

async fn trades(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.mirror.closed_positions(500))
}

async fn failures(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.failures.recent(200))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BracketLeg, BracketOptions, BracketOrderResult, BrokerClient, BrokerPosition, OrderFilter, OrderRef, StopLossPayload};
    use crate::errors::ExecutionError;
    use crate::listeners::max_loss_listener::MaxLossReactor;
    use crate::runtime_config::RuntimeConfig;
    use crate::types::Side;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct NullBroker;

    #[async_trait]
    impl BrokerClient for NullBroker {
        async fn place_bracket_order(&self, _a: i64, _s: Side, _q: Decimal, _sym: &str, _legs: &[BracketLeg], _sl: Option<StopLossPayload>, _o: BracketOptions) -> Result<BracketOrderResult, ExecutionError> {
            Ok(BracketOrderResult { entry_id: "e".into(), leg_ids: vec![], sl_id: None })
        }
        async fn place_market(&self, _a: i64, _s: Side, _q: Decimal, _sym: &str) -> Result<String, ExecutionError> {
            Ok("m".into())
        }
        async fn place_limit(&self, _a: i64, _s: Side, _q: Decimal, _sym: &str, _p: Decimal) -> Result<String, ExecutionError> {
            Ok("l".into())
        }
        async fn cancel(&self, _a: i64, _order_id: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
        async fn list_orders(&self, _a: i64, _f: OrderFilter<'_>) -> Result<Vec<OrderRef>, ExecutionError> {
            Ok(vec![])
        }
        async fn list_positions(&self, _a: i64) -> Result<Vec<BrokerPosition>, ExecutionError> {
            Ok(vec![])
        }
        async fn refresh_auth(&self, _account_id: i64) -> Result<DateTime<Utc>, ExecutionError> {
            Ok(Utc::now())
        }
    }

    struct NullReactor;
    impl MaxLossReactor for NullReactor {
        fn on_breach(&self, _account_id: i64, _cash_balance: Decimal, _floor: Decimal) {}
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let state = AppState::new(RuntimeConfig::default(), Arc::new(NullBroker), Arc::new(NullReactor));
        let resp = health(State(state)).await.into_response();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn positions_reflects_mirror_state() {
        let state = AppState::new(RuntimeConfig::default(), Arc::new(NullBroker), Arc::new(NullReactor));
        state.mirror.apply_entry(1, "GCJ6", "GC", Side::Long, dec!(2000), dec!(1), false, None, None);
        let open = state.mirror.open_positions();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn failures_feed_starts_empty() {
        let state = AppState::new(RuntimeConfig::default(), Arc::new(NullBroker), Arc::new(NullReactor));
        assert!(state.failures.recent(10).is_empty());
    }
}
