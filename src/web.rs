//! HTTP control surface.
//!
//! A thin axum router over the manager: status, record start/stop, mode
//! and model switches. TLS and accounts are out of scope; this surface
//! sits behind the device's own access control.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::detect::DetectorKind;
use crate::error::MediaError;
use crate::pipeline::manager::{PipelineManager, PipelineMode};

#[derive(Clone)]
struct AppState {
    manager: Arc<PipelineManager>,
}

pub fn router(manager: Arc<PipelineManager>) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/record/start", post(record_start_handler))
        .route("/api/record/stop", post(record_stop_handler))
        .route("/api/mode", post(mode_handler))
        .route("/api/model", post(model_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(AppState { manager })
}

pub async fn serve(port: u16, manager: Arc<PipelineManager>) -> anyhow::Result<()> {
    let app = router(manager);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http control surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn status_handler(State(state): State<AppState>) -> Response {
    Json(state.manager.status().await).into_response()
}

async fn record_start_handler(State(state): State<AppState>) -> Response {
    result_response(state.manager.record_start().await)
}

async fn record_stop_handler(State(state): State<AppState>) -> Response {
    result_response(state.manager.record_stop().await)
}

#[derive(Deserialize)]
struct ModeRequest {
    mode: String,
}

async fn mode_handler(State(state): State<AppState>, Json(req): Json<ModeRequest>) -> Response {
    match PipelineMode::parse(&req.mode) {
        Some(mode) => result_response(state.manager.switch_mode(mode).await),
        None => bad_request(format!("unknown mode: {}", req.mode)),
    }
}

#[derive(Deserialize)]
struct ModelRequest {
    model: String,
}

async fn model_handler(State(state): State<AppState>, Json(req): Json<ModelRequest>) -> Response {
    let target = match req.model.as_str() {
        "none" => None,
        other => match DetectorKind::parse(other) {
            Some(kind) => Some(kind),
            None => return bad_request(format!("unknown model: {}", req.model)),
        },
    };
    result_response(state.manager.switch_detector(target).await)
}

fn result_response(result: Result<(), MediaError>) -> Response {
    match result {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => {
            let code = match e {
                MediaError::InvalidState(_) | MediaError::Malformed(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (code, Json(json!({"status": "error", "message": e.to_string()}))).into_response()
        }
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"status": "error", "message": message})),
    )
        .into_response()
}
