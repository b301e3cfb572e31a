//! Read-only HTTP status API.
//!
//! - GET /health
//! - GET /v1/cache/usage
//! - GET /v1/blocks/{id}
//! - GET /v1/registry/blocks/{id}
//! - GET /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::cache::block::{BlockDescriptor, BlockId};
use crate::master::registry::MasterRegistry;
use crate::master::WorkerId;
use crate::worker::Worker;

/// Application state shared across handlers.
pub struct AppState {
    pub worker: Arc<Worker>,
    /// In-process master, when this process runs one.
    pub registry: Option<Arc<MasterRegistry>>,
    pub start_time: Instant,
}

/// Build the axum router with all status routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/cache/usage", get(cache_usage))
        .route("/v1/blocks/{id}", get(block_info))
        .route("/v1/registry/blocks/{id}", get(block_locations))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ─── Response Types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
    pub utilization: f64,
    pub resident_blocks: usize,
    pub active_leases: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub worker_id: WorkerId,
    pub uptime_secs: u64,
    pub cache: UsageResponse,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocationsResponse {
    pub block_id: BlockId,
    pub workers: Vec<WorkerId>,
}

// ─── Handlers ──────────────────────────────────────────────────────────────

fn usage(worker: &Worker) -> UsageResponse {
    let store = worker.store();
    let usage = store.current_usage();
    UsageResponse {
        used_bytes: usage.used_bytes,
        capacity_bytes: usage.capacity_bytes,
        free_bytes: usage.free_bytes(),
        utilization: usage.usage_fraction(),
        resident_blocks: store.resident_blocks().len(),
        active_leases: store.active_leases(),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        worker_id: state.worker.config().worker.worker_id,
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache: usage(&state.worker),
    })
}

async fn cache_usage(State(state): State<Arc<AppState>>) -> Json<UsageResponse> {
    Json(usage(&state.worker))
}

async fn block_info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
) -> Result<Json<BlockDescriptor>, StatusCode> {
    state
        .worker
        .store()
        .describe(id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn block_locations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
) -> Result<Json<LocationsResponse>, StatusCode> {
    let registry = state.registry.as_ref().ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(LocationsResponse {
        block_id: id,
        workers: registry.block_locations(id),
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.worker.metrics().encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
