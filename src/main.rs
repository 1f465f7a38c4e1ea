// =============================================================================
// Kline Chart Feed — Main Entry Point
// =============================================================================
//
// Seeds a candlestick chart from Binance's REST history, keeps it current
// from the kline WebSocket, derives indicators incrementally and serves the
// result to chart clients over HTTP + WebSocket.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod indicators;
mod market_data;
mod pipeline;
mod render;
mod runtime_config;
mod session;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, RENDER_CHANNEL_CAPACITY};
use crate::binance::{BinanceClient, BinanceKlineSource};
use crate::render::BroadcastSink;
use crate::runtime_config::ChartConfig;
use crate::session::{ChartSession, SessionOptions, SessionStatus};

const CONFIG_PATH: &str = "chart_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Kline chart feed starting up");

    let mut config = ChartConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        ChartConfig::default()
    });
    config.apply_env_overrides();

    let key = config.initial_key()?;
    let settings = config.indicators.settings();
    info!(
        key = %key,
        history_limit = config.history_limit,
        min_history = settings.min_history(),
        "Configured chart"
    );

    // ── 2. Exchange collaborators ────────────────────────────────────────
    let historical = BinanceClient::new(config.rest_base_url.clone())?;
    let live = BinanceKlineSource::new(config.ws_base_url.clone());

    // ── 3. Chart session ─────────────────────────────────────────────────
    let (render_tx, _) = broadcast::channel(RENDER_CHANNEL_CAPACITY);
    let status = Arc::new(RwLock::new(SessionStatus::new(key.clone())));
    let options = SessionOptions {
        settings,
        history_limit: config.history_limit,
        price_retention_secs: config.price_retention_secs,
        reconnect_delay: (config.reconnect_delay_secs > 0)
            .then(|| Duration::from_secs(config.reconnect_delay_secs)),
    };
    let (session, handle) = ChartSession::new(
        key,
        options,
        historical,
        live,
        BroadcastSink::new(render_tx.clone()),
        status.clone(),
    );
    tokio::spawn(session.run());

    // ── 4. API server ────────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(handle, status, render_tx, config, CONFIG_PATH));
    let app = api::rest::router(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server to {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server error");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save chart config on shutdown");
    }

    info!("Kline chart feed shut down complete.");
    Ok(())
}
