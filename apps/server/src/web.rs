use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use preheat_core::arrival::ArrivalReport;
use preheat_core::config::PreheatConfig;
use preheat_core::model::ThermalModel;
use preheat_core::schedule::ScheduleOutcome;

use crate::{AppState, Status};

#[derive(Deserialize)]
pub struct StatePush {
    entity_id: String,
    state: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/state", post(push_state))
        .route("/api/model", get(get_model))
        .route("/api/model/reset", post(reset_model))
        .route("/api/config", get(get_config))
        .route("/api/evaluate", post(evaluate_arrival))
        .route("/api/recompute", post(recompute))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("serving preheat api on http://{}", addr);
    axum::serve(listener, router(state))
        .await
        .context("web server stopped")
}

async fn get_status(State(state): State<AppState>) -> Json<Status> {
    Json(state.status().await)
}

async fn push_state(
    State(state): State<AppState>,
    Json(request): Json<StatePush>,
) -> Json<serde_json::Value> {
    let captured = state.push_state(&request.entity_id, &request.state).await;
    Json(serde_json::json!({
        "success": true,
        "captured": captured,
    }))
}

async fn get_model(State(state): State<AppState>) -> Json<ThermalModel> {
    Json(state.model().await)
}

async fn reset_model(State(state): State<AppState>) -> Json<ThermalModel> {
    Json(state.reset_model().await)
}

async fn get_config(State(state): State<AppState>) -> Json<PreheatConfig> {
    let cfg = state.config().await;
    info!("effective cfg = {:?}", cfg);
    Json(cfg)
}

async fn evaluate_arrival(State(state): State<AppState>) -> Json<ArrivalReport> {
    Json(state.evaluate_arrival().await)
}

async fn recompute(State(state): State<AppState>) -> Json<ScheduleOutcome> {
    Json(state.recompute().await)
}
