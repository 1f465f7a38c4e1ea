// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Chart state is read from the session
// task through its handle; health is answered from the published status.
//
// CORS is configured permissively so a chart page on any origin can connect.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::runtime_config::IndicatorConfig;
use crate::types::{CandleKey, PriceSample, StreamStatus};

/// `lag` used by `/price/ago` when the query omits it.
const DEFAULT_LAG_SECS: i64 = 60;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.to_string() })))
}

fn session_unavailable(e: anyhow::Error) -> ApiError {
    warn!(error = %e, "chart session unavailable");
    api_error(StatusCode::SERVICE_UNAVAILABLE, "chart session unavailable")
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/price/current", get(current_price))
        .route("/api/v1/price/ago", get(price_ago))
        .route("/api/v1/chart", get(chart))
        .route("/api/v1/subscription", post(switch_subscription))
        .route("/api/v1/indicators", get(get_indicators).put(set_indicators))
        // ── WebSocket (handled in the ws module but mounted here) ───
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    symbol: String,
    interval: String,
    stream: StreamStatus,
    bars: usize,
    last_bar_time: Option<i64>,
    indicators_ready: bool,
    chart_clients: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.status();
    Json(HealthResponse {
        status: "ok",
        symbol: status.key.symbol,
        interval: status.key.interval,
        stream: status.stream,
        bars: status.bars,
        last_bar_time: status.last_bar_time,
        indicators_ready: status.indicators_ready,
        chart_clients: state.connected_clients(),
        uptime_secs: state.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Prices
// =============================================================================

async fn current_price(State(state): State<Arc<AppState>>) -> Result<Json<PriceSample>, ApiError> {
    match state.session.current_price().await {
        Ok(Some(sample)) => Ok(Json(sample)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "no candles loaded yet")),
        Err(e) => Err(session_unavailable(e)),
    }
}

#[derive(Deserialize)]
struct PriceAgoQuery {
    /// Seconds back from now.
    #[serde(default = "default_lag")]
    lag: i64,
}

fn default_lag() -> i64 {
    DEFAULT_LAG_SECS
}

fn validate_lag(lag: i64) -> Result<i64, ApiError> {
    if lag < 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, format!("lag must be >= 0, got {lag}")));
    }
    Ok(lag)
}

async fn price_ago(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PriceAgoQuery>,
) -> Result<Json<PriceSample>, ApiError> {
    let lag = validate_lag(query.lag)?;
    match state.session.price_ago(lag).await {
        Ok(Some(sample)) => Ok(Json(sample)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "no price history yet")),
        Err(e) => Err(session_unavailable(e)),
    }
}

// =============================================================================
// Chart snapshot
// =============================================================================

async fn chart(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.session.snapshot().await.map_err(session_unavailable)?;
    Ok(Json(snapshot))
}

// =============================================================================
// Subscription switch
// =============================================================================

#[derive(Deserialize)]
struct SubscriptionRequest {
    symbol: String,
    interval: String,
}

#[derive(Serialize)]
struct SubscriptionResponse {
    symbol: String,
    interval: String,
}

async fn switch_subscription(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubscriptionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = CandleKey::new(&req.symbol, &req.interval)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    state
        .session
        .switch(key.clone())
        .await
        .map_err(session_unavailable)?;
    info!(key = %key, "chart pair switched via API");

    // Remember the pair across restarts (best-effort).
    let config_clone = {
        let mut config = state.config.write();
        config.symbol = key.symbol.clone();
        config.interval = key.interval.clone();
        config.clone()
    };
    if let Err(e) = config_clone.save(&state.config_path) {
        warn!(error = %e, "failed to save chart config to disk");
    }

    Ok(Json(SubscriptionResponse {
        symbol: key.symbol,
        interval: key.interval,
    }))
}

// =============================================================================
// Indicator toggles
// =============================================================================

async fn get_indicators(State(state): State<Arc<AppState>>) -> Json<IndicatorConfig> {
    Json(state.config.read().indicators.clone())
}

async fn set_indicators(
    State(state): State<Arc<AppState>>,
    Json(indicators): Json<IndicatorConfig>,
) -> Result<Json<IndicatorConfig>, ApiError> {
    let settings = indicators.settings();
    state
        .session
        .set_indicators(settings)
        .await
        .map_err(session_unavailable)?;
    info!(?settings, "indicator set changed via API");

    let config_clone = {
        let mut config = state.config.write();
        config.indicators = indicators.clone();
        config.clone()
    };
    if let Err(e) = config_clone.save(&state.config_path) {
        warn!(error = %e, "failed to save chart config to disk");
    }

    Ok(Json(indicators))
}
