//! Read-only administrative surface.
//!
//! `/health`, `/stats`, and `/logs` plus the device WebSocket endpoint.
//! CORS is wide open: the surface is read-only and deployed behind an
//! authenticating reverse proxy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::logbuf::LogBuffer;
use crate::session::{device_ws, SessionDeps, SessionRegistry};
use crate::store::Store;

#[derive(Clone)]
pub struct AdminState {
    pub store: Arc<Store>,
    pub registry: Arc<SessionRegistry>,
    pub logs: LogBuffer,
    pub started_at: Instant,
    pub push_ok: bool,
}

pub fn build_router(admin: AdminState, sessions: SessionDeps) -> Router {
    let api = Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/logs", get(logs_handler))
        .with_state(admin);

    Router::new()
        .route("/ws", get(device_ws).with_state(sessions))
        .merge(api)
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    if state.store.healthy().await {
        (StatusCode::OK, Json(json!({"status": "healthy"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unhealthy"})),
        )
    }
}

async fn stats_handler(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(json!({
        "active_clients": state.registry.active_count().await,
        "uptime": format_duration(state.started_at.elapsed()),
        "db_status": state.store.healthy().await,
        "push_status": state.push_ok,
        "timestamp": Utc::now().timestamp(),
    }))
}

async fn logs_handler(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(json!({ "logs": state.logs.lines() }))
}

fn format_duration(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
