// Aegisum mining daemon
//
// Wires PostgreSQL (durable store), Redis (status cache + completion
// events) and the mining engine, then serves the mining API plus /health
// and /metrics until SIGINT/SIGTERM.

use aegisum_mining::config::Config;
use aegisum_mining::metrics;
use aegisum_mining::postgres::PgMiningStore;
use aegisum_mining::redis_backend::RedisBackend;
use aegisum_mining::MiningEngine;
use anyhow::{Context, Result};
use axum::{extract::State, http::{header, StatusCode}, response::IntoResponse, routing::get, Json};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct ApiState {
    engine: Arc<MiningEngine>,
    redis: Arc<RedisBackend>,
}

async fn api_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let redis_ok = state.redis.ping().await.is_ok();
    Json(json!({
        "status": "ok",
        "redis": redis_ok,
        "scheduler": state.engine.is_running().await,
        "active_sessions": state.engine.sessions().len(),
    }))
}

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let ctrl_c = tokio::signal::ctrl_c();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                    _ = ctrl_c => tracing::info!("SIGINT, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                let _ = ctrl_c.await;
                tracing::info!("SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C, shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::info!("Aegisum mining daemon v{}", env!("CARGO_PKG_VERSION"));
    let cfg = Config::load();

    let store = Arc::new(
        PgMiningStore::new(&cfg.database_url)
            .await
            .context("Failed to connect to PostgreSQL")?,
    );
    store.init_schema().await.context("Failed to initialize mining schema")?;

    let redis = Arc::new(RedisBackend::new(&cfg.redis_url).context("Failed to create Redis client")?);
    if let Err(e) = redis.ping().await {
        // start, status and energy reads need the cache and answer 503 until it is up
        tracing::warn!("Redis not reachable at startup: {}", e);
    }

    let engine = Arc::new(MiningEngine::new(
        cfg.mining.clone(),
        store,
        redis.clone(),
        redis.clone(),
    ));
    engine.initialize().await.context("Failed to initialize mining engine")?;

    let api = axum::Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics))
        .with_state(ApiState { engine: engine.clone(), redis })
        .merge(aegisum_mining::api::router(engine.clone()));

    let listener = tokio::net::TcpListener::bind(&cfg.metrics_listen)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.metrics_listen))?;

    tracing::info!(
        "Mining engine running: block_time={}ms, API on {}",
        cfg.mining.block_time_ms,
        cfg.metrics_listen
    );
    axum::serve(listener, api)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    if let Err(e) = engine.shutdown().await {
        tracing::error!("Failed to save active sessions on shutdown: {}", e);
    }
    tracing::info!("Aegisum mining daemon shut down cleanly");
    Ok(())
}
