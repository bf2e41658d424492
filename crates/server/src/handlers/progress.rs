//! Progress read-path handlers: snapshot lookup and server-streaming
//! subscription (the RPC variant of the duplex gateway).

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use depot_core::{OperationId, ProgressSnapshot};
use depot_progress::SubscribeError;
use depot_service::ServiceError;
use futures::StreamExt;

fn parse_operation_id(raw: &str) -> ApiResult<OperationId> {
    OperationId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// GET /v1/progress/{operation_id} - Current snapshot.
#[tracing::instrument(skip(state))]
pub async fn get_progress(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> ApiResult<Json<ProgressSnapshot>> {
    let operation_id = parse_operation_id(&operation_id)?;
    state
        .progress
        .snapshot(&operation_id)
        .map(Json)
        .ok_or_else(|| {
            ApiError::Service(ServiceError::NotFound(format!(
                "operation {operation_id}"
            )))
        })
}

/// GET /v1/progress/{operation_id}/stream - Server-streaming snapshots
/// as newline-delimited JSON, ending after the terminal snapshot.
#[tracing::instrument(skip(state))]
pub async fn stream_progress(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> ApiResult<Response> {
    let operation_id = parse_operation_id(&operation_id)?;

    let stream = state.progress.subscribe(&operation_id).map_err(|err| {
        let SubscribeError::NotFound(id) = err;
        ApiError::Service(ServiceError::NotFound(format!("operation {id}")))
    })?;

    let body_stream = stream.map(|snapshot| {
        serde_json::to_vec(&snapshot)
            .map(|mut line| {
                line.push(b'\n');
                bytes::Bytes::from(line)
            })
            .map_err(std::io::Error::other)
    });

    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body_stream),
    )
        .into_response())
}
