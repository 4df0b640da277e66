// HTTP surface for the mining engine
//
// Thin handlers over `MiningEngine`. Every body carries `ok`; failures add
// `error` and a stable `code`. Callers are authenticated upstream.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::engine::MiningEngine;
use crate::error::MiningError;
use crate::store::BlockFilter;
use crate::UserId;

type ApiResponse = (StatusCode, Json<Value>);

pub fn router(engine: Arc<MiningEngine>) -> Router {
    Router::new()
        .route("/api/v1/mining/:user_id/start", post(api_start_mining))
        .route("/api/v1/mining/:user_id/stop", post(api_stop_mining))
        .route("/api/v1/mining/:user_id/status", get(api_mining_status))
        .route("/api/v1/mining/:user_id/history", get(api_mining_history))
        .route("/api/v1/energy/:user_id", get(api_energy_status))
        .route("/api/v1/leaderboard", get(api_leaderboard))
        .route("/api/v1/blocks/recent", get(api_recent_blocks))
        .with_state(engine)
}

fn status_for(e: &MiningError) -> StatusCode {
    match e {
        MiningError::AlreadyMining
        | MiningError::NotMining
        | MiningError::InsufficientEnergy { .. } => StatusCode::BAD_REQUEST,
        MiningError::UserNotFound => StatusCode::NOT_FOUND,
        MiningError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn failure(e: MiningError) -> ApiResponse {
    let status = status_for(&e);
    if status == StatusCode::SERVICE_UNAVAILABLE {
        tracing::warn!("Mining API storage failure: {}", e);
    }
    (status, Json(json!({"ok": false, "error": e.to_string(), "code": e.code()})))
}

fn success(body: Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

async fn api_start_mining(
    Path(user_id): Path<UserId>,
    State(engine): State<Arc<MiningEngine>>,
) -> ApiResponse {
    match engine.start_mining(user_id).await {
        Ok(receipt) => success(json!({"ok": true, "mining": receipt})),
        Err(e) => failure(e),
    }
}

async fn api_stop_mining(
    Path(user_id): Path<UserId>,
    State(engine): State<Arc<MiningEngine>>,
) -> ApiResponse {
    match engine.stop_mining(user_id).await {
        Ok(session) => success(json!({
            "ok": true,
            "block_number": session.block_number,
            "energy_used": session.energy_reserved,
        })),
        Err(e) => failure(e),
    }
}

async fn api_mining_status(
    Path(user_id): Path<UserId>,
    State(engine): State<Arc<MiningEngine>>,
) -> ApiResponse {
    match engine.get_status(user_id).await {
        Ok(status) => success(json!({"ok": true, "status": status})),
        Err(e) => failure(e),
    }
}

#[derive(Deserialize)]
struct HistoryParams {
    filter: Option<BlockFilter>,
    page: Option<u32>,
    limit: Option<u32>,
}

async fn api_mining_history(
    Path(user_id): Path<UserId>,
    Query(params): Query<HistoryParams>,
    State(engine): State<Arc<MiningEngine>>,
) -> ApiResponse {
    let filter = params.filter.unwrap_or_default();
    let page = params.page.unwrap_or(1);
    let limit = params.limit.unwrap_or(20);
    match engine.mining_history(user_id, filter, page, limit).await {
        Ok(history) => success(json!({"ok": true, "history": history})),
        Err(e) => failure(e),
    }
}

async fn api_energy_status(
    Path(user_id): Path<UserId>,
    State(engine): State<Arc<MiningEngine>>,
) -> ApiResponse {
    match engine.energy_status(user_id).await {
        Ok(energy) => success(json!({"ok": true, "energy": energy})),
        Err(e) => failure(e),
    }
}

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<u32>,
}

async fn api_leaderboard(
    Query(params): Query<LimitParams>,
    State(engine): State<Arc<MiningEngine>>,
) -> ApiResponse {
    match engine.get_leaderboard(params.limit.unwrap_or(10)).await {
        Ok(leaders) => success(json!({"ok": true, "count": leaders.len(), "leaderboard": leaders})),
        Err(e) => failure(e),
    }
}

async fn api_recent_blocks(
    Query(params): Query<LimitParams>,
    State(engine): State<Arc<MiningEngine>>,
) -> ApiResponse {
    match engine.recent_blocks(params.limit.unwrap_or(10)).await {
        Ok(blocks) => success(json!({"ok": true, "count": blocks.len(), "blocks": blocks})),
        Err(e) => failure(e),
    }
}
