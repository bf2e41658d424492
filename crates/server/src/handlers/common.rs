//! Health and capability discovery handlers.

use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub storage: String,
}

/// GET /v1/health - Liveness/readiness probe. Unauthenticated by
/// design for load balancers.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.storage_health().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                storage: "ok".to_string(),
            }),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "degraded",
                storage: err.to_string(),
            }),
        ),
    }
}

/// Capability discovery response.
#[derive(Debug, Serialize)]
pub struct CapabilitiesResponse {
    pub server: &'static str,
    pub version: &'static str,
    pub multipart_threshold_bytes: u64,
    pub max_chunk_bytes: u64,
    pub recommended_chunk_bytes: u64,
}

/// GET /v1/capabilities - Limits a client needs before uploading.
pub async fn get_capabilities(State(state): State<AppState>) -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        server: "depot",
        version: env!("CARGO_PKG_VERSION"),
        multipart_threshold_bytes: state.config.server.multipart_threshold_bytes,
        max_chunk_bytes: state.config.server.max_chunk_bytes,
        recommended_chunk_bytes: state.config.server.recommended_chunk_bytes,
    })
}
