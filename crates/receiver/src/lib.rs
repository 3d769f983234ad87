//! Upload receiver for job accounting data
//!
//! Accepts `POST /<jobid>/<filename>` uploads from job agents and stores
//! each body atomically under the configured base path. Also serves
//! `/healthz` and Prometheus `/metrics`.

pub mod config;
pub mod metrics;
pub mod storage;

pub use config::ReceiverConfig;
pub use metrics::ReceiverMetrics;
pub use storage::{StoreError, UploadStore};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: UploadStore,
    pub metrics: ReceiverMetrics,
}

impl AppState {
    pub fn new(store: UploadStore, metrics: ReceiverMetrics) -> Self {
        Self { store, metrics }
    }

    pub fn from_config(config: &ReceiverConfig) -> Self {
        Self::new(
            UploadStore::new(&config.base_path, config.jobid_hash_size),
            ReceiverMetrics::new(),
        )
    }
}

/// Store one uploaded file
async fn upload(
    State(state): State<Arc<AppState>>,
    Path((jobid, filename)): Path<(String, String)>,
    body: Bytes,
) -> impl IntoResponse {
    match state.store.store(&jobid, &filename, &body).await {
        Ok(path) => {
            state.metrics.record_upload(body.len());
            info!(jobid = %jobid, path = %path.display(), bytes = body.len(), "Stored upload");
            (StatusCode::OK, "OK".to_string())
        }
        Err(e) if e.is_client_error() => {
            state.metrics.record_failure();
            warn!(jobid = %jobid, filename = %filename, error = %e, "Rejected upload");
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            state.metrics.record_failure();
            error!(jobid = %jobid, filename = %filename, error = %e, "Failed to store upload");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to write".to_string())
        }
    }
}

async fn healthz() -> &'static str {
    "OK"
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, [("content-type", "text/plain; charset=utf-8")], Vec::new());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the receiver router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/:jobid/:filename", post(upload))
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn serve(config: &ReceiverConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    info!(addr = %config.listen, base_path = %config.base_path.display(), "Starting upload receiver");

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
