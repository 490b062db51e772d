use crate::pool::PoolStatus;
use crate::stats::{CounterSnapshot, Counters};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct HealthState {
    pub status: Arc<PoolStatus>,
    pub counters: Arc<Counters>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn serve(bind: &str, state: HealthState, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, "health server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("serve health endpoints")
}

async fn health() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn ready(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    if state.status.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "reason": "shutting down"})),
        );
    }

    if !state.status.is_ready() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "reason": "consumer workers not running",
                "live_workers": state.status.live(),
                "expected_workers": state.status.expected(),
            })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "workers": state.status.live(),
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

async fn stats(State(state): State<HealthState>) -> Json<CounterSnapshot> {
    Json(state.counters.snapshot())
}
