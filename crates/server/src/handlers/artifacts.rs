//! Artifact read-path handlers: download, metadata, signed URLs,
//! listing, deletion.

use crate::error::{ApiError, ApiResult};
use crate::metrics::{BYTES_DOWNLOADED, DOWNLOADS_STARTED};
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, StatusCode};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use depot_core::ArtifactCoordinate;
use depot_protocol::frame::{DataFrameHeader, encode_data_frame};
use depot_storage::{ByteRange, ListPage, SignedUrl};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Content type of framed download bodies.
pub const FRAMED_CONTENT_TYPE: &str = "application/x-depot-frames";

/// Response header carrying the download's progress operation id.
pub const OPERATION_ID_HEADER: &str = "x-depot-operation-id";

fn parse_coordinate(
    app: String,
    version: String,
    platform: String,
    filename: String,
) -> ApiResult<ArtifactCoordinate> {
    ArtifactCoordinate::new(app, version, platform, filename)
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Query parameters for ranged downloads.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    /// Range start (inclusive).
    pub start: Option<u64>,
    /// Range end (exclusive).
    pub end: Option<u64>,
}

impl DownloadQuery {
    fn byte_range(&self) -> ApiResult<Option<ByteRange>> {
        match (self.start, self.end) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => ByteRange::new(start, end)
                .map(Some)
                .map_err(|e| ApiError::BadRequest(e.to_string())),
            _ => Err(ApiError::BadRequest(
                "range requires both start and end".to_string(),
            )),
        }
    }
}

/// GET /v1/artifacts/{app}/{version}/{platform}/{filename} - Streaming
/// framed download, range-capable.
#[tracing::instrument(skip(state))]
pub async fn download_artifact(
    State(state): State<AppState>,
    Path((app, version, platform, filename)): Path<(String, String, String, String)>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let coordinate = parse_coordinate(app, version, platform, filename)?;
    let range = query.byte_range()?;

    let download = state.service.stream_download(&coordinate, range).await?;
    DOWNLOADS_STARTED.inc();

    let total_size = download.total_size;
    let operation_id = download.operation_id.to_string();

    let body_stream = download.frames.map(|result| match result {
        Ok(frame) => {
            BYTES_DOWNLOADED.inc_by(frame.payload.len() as u64);
            let header = DataFrameHeader {
                sequence: frame.sequence,
                payload_len: frame.payload.len() as u64,
                total_size: frame.total_size,
                is_final: frame.is_final,
            };
            encode_data_frame(&header, &frame.payload).map_err(std::io::Error::other)
        }
        Err(err) => Err(std::io::Error::other(err)),
    });

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, FRAMED_CONTENT_TYPE.to_string()),
            (HeaderName::from_static(OPERATION_ID_HEADER), operation_id),
        ],
        Body::from_stream(body_stream),
    )
        .into_response())
}

/// Artifact metadata response.
#[derive(Debug, Serialize)]
pub struct ArtifactMetaResponse {
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<time::OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// GET /v1/artifacts/{app}/{version}/{platform}/{filename}/meta -
/// Object metadata (Head).
#[tracing::instrument(skip(state))]
pub async fn get_artifact_meta(
    State(state): State<AppState>,
    Path((app, version, platform, filename)): Path<(String, String, String, String)>,
) -> ApiResult<Json<ArtifactMetaResponse>> {
    let coordinate = parse_coordinate(app, version, platform, filename)?;
    let meta = state.service.head(&coordinate).await?;
    Ok(Json(ArtifactMetaResponse {
        size: meta.size,
        content_type: meta.content_type,
        updated_at: meta.updated_at,
        etag: meta.etag,
    }))
}

/// Query parameters for signed URL requests.
#[derive(Debug, Deserialize)]
pub struct SignedUrlQuery {
    /// Requested URL lifetime in seconds.
    pub ttl_seconds: u64,
}

/// GET /v1/artifacts/{app}/{version}/{platform}/{filename}/url -
/// Presigned out-of-band download URL.
#[tracing::instrument(skip(state))]
pub async fn get_signed_url(
    State(state): State<AppState>,
    Path((app, version, platform, filename)): Path<(String, String, String, String)>,
    Query(query): Query<SignedUrlQuery>,
) -> ApiResult<Json<SignedUrl>> {
    let coordinate = parse_coordinate(app, version, platform, filename)?;
    let url = state
        .service
        .signed_url(&coordinate, Duration::from_secs(query.ttl_seconds))
        .await?;
    Ok(Json(url))
}

/// Query parameters for listing.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Default and maximum listing page sizes.
const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

/// GET /v1/artifacts - List stored artifacts, lexicographic, paged.
#[tracing::instrument(skip(state))]
pub async fn list_artifacts(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ListPage>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let page = state
        .service
        .list(
            query.prefix.as_deref().unwrap_or(""),
            query.cursor.as_deref(),
            limit,
        )
        .await?;
    Ok(Json(page))
}

/// Deletion response.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

/// DELETE /v1/artifacts/{app}/{version}/{platform}/{filename}
#[tracing::instrument(skip(state))]
pub async fn delete_artifact(
    State(state): State<AppState>,
    Path((app, version, platform, filename)): Path<(String, String, String, String)>,
) -> ApiResult<Json<DeleteResponse>> {
    let coordinate = parse_coordinate(app, version, platform, filename)?;
    let deleted = state.service.delete(&coordinate).await?;
    Ok(Json(DeleteResponse { deleted }))
}
