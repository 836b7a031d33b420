//! The one HTTP contract this crate implements: `POST /command/{identity}`
//! (§4.7), plus the teacher's ambient `/health`, `/ready`, `/metrics`
//! routes. Everything else in spec.md §1's HTTP surface (CRUD, route/
//! distance queries, operator dashboard) stays an external collaborator.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::dispatcher;
use crate::identity::DeviceIdentity;
use crate::metrics::Metrics;
use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/command/:identity", post(send_command))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

#[derive(Deserialize)]
struct CommandRequest {
    content: String,
    timeout_ms: Option<u64>,
}

fn parse_identity(raw: &str) -> Option<DeviceIdentity> {
    if raw.len() != 16 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&raw[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(DeviceIdentity::from_bytes(bytes))
}

async fn send_command(
    State(state): State<AppState>,
    Path(identity_hex): Path<String>,
    Json(body): Json<CommandRequest>,
) -> axum::response::Response {
    let Some(identity) = parse_identity(&identity_hex) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "invalid identity"})),
        )
            .into_response();
    };

    let timeout = Duration::from_millis(
        body.timeout_ms
            .unwrap_or(state.config.command_default_timeout_seconds * 1000),
    );
    let result =
        dispatcher::send_command_to_device(&state.registry, &state.metrics, identity, body.content, timeout)
            .await;

    let status = if result.success {
        StatusCode::OK
    } else if result.error.as_deref() == Some("not connected") {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(result)).into_response()
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn ready() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot(state.registry.len()))
}
