//! Upload control-plane and chunk ingest handlers.

use crate::error::{ApiError, ApiResult};
use crate::metrics::{
    BYTES_UPLOADED, CHUNK_INGEST_DURATION, COMMIT_DURATION, SESSIONS_ACTIVE,
    UPLOAD_SESSIONS_COMMITTED, UPLOAD_SESSIONS_CREATED, UPLOAD_SESSIONS_FAILED,
};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use depot_core::session::{
    AbortRequest, CommitRequest, CommitResponse, InitiateRequest, InitiateResponse, UploadSummary,
};
use depot_core::{ChunkMessage, ContentDigest, SessionId};
use depot_protocol::frame::{FrameError, read_chunk_frame};
use depot_service::TransferService;
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::io::StreamReader;

/// Aborts the session if an upload stream ends without reaching a clean
/// stop, cascading client disconnects into session cleanup.
struct StreamAbortGuard {
    service: Arc<TransferService>,
    session_id: SessionId,
    armed: bool,
}

impl StreamAbortGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StreamAbortGuard {
    fn drop(&mut self) {
        if self.armed
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            let service = self.service.clone();
            let session_id = self.session_id;
            runtime.spawn(async move {
                if let Err(e) = service
                    .abort(session_id, Some("stream_interrupted".to_string()))
                    .await
                {
                    tracing::debug!(session_id = %session_id, error = %e,
                        "session already settled when abort guard fired");
                }
            });
        }
    }
}

/// POST /v1/sessions - Initiate an upload session.
#[tracing::instrument(skip(state, request), fields(coordinate = %request.coordinate))]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<InitiateRequest>,
) -> ApiResult<(StatusCode, Json<InitiateResponse>)> {
    let response = state.service.initiate(request).await?;
    UPLOAD_SESSIONS_CREATED.inc();
    SESSIONS_ACTIVE.set(state.service.session_count() as i64);
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /v1/sessions/{session_id}/chunks - Client-streaming chunk
/// ingest.
///
/// The request body is a sequence of length-delimited chunk frames.
/// Frames are applied strictly in order; the first rejected chunk ends
/// the call with the session left as the service decided (an invalid
/// chunk leaves it open, a transport error aborts it).
#[tracing::instrument(skip(state, request), fields(session_id = %session_id))]
pub async fn upload_chunks(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    request: Request,
) -> ApiResult<Json<UploadSummary>> {
    let session_id =
        SessionId::parse(&session_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let body_stream = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let mut reader = StreamReader::new(body_stream);

    let mut guard = StreamAbortGuard {
        service: state.service.clone(),
        session_id,
        armed: true,
    };

    let max_payload = state.config.server.max_chunk_bytes;
    loop {
        let frame = match read_chunk_frame(&mut reader, max_payload).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(FrameError::PayloadTooLarge { len, max }) => {
                // An oversized chunk is a client error, not a transport
                // failure; the session stays open.
                guard.disarm();
                return Err(ApiError::BadRequest(format!(
                    "chunk of {len} bytes exceeds maximum {max}"
                )));
            }
            Err(err) => {
                // Malformed framing or a broken transport: the guard
                // aborts the session on drop.
                return Err(ApiError::BadRequest(format!("chunk stream error: {err}")));
            }
        };
        let (header, payload) = frame;

        if header.session_id != session_id.to_string() {
            guard.disarm();
            return Err(ApiError::BadRequest(format!(
                "frame session id {} does not match path session id {session_id}",
                header.session_id
            )));
        }

        let checksum = header
            .checksum
            .as_deref()
            .map(ContentDigest::from_hex)
            .transpose()
            .map_err(|e| {
                guard.disarm();
                ApiError::BadRequest(e.to_string())
            })?;

        let message = ChunkMessage {
            session_id,
            sequence: header.sequence,
            payload,
            is_final: header.is_final,
            checksum,
        };
        let payload_len = message.payload.len() as u64;

        let started = Instant::now();
        match state.service.ingest_chunk(message).await {
            Ok(()) => {
                CHUNK_INGEST_DURATION.observe(started.elapsed().as_secs_f64());
                BYTES_UPLOADED.inc_by(payload_len);
            }
            Err(err) => {
                // A rejected chunk is the service's call; it has already
                // settled the session state accordingly.
                guard.disarm();
                return Err(err.into());
            }
        }
    }

    guard.disarm();
    let summary = state.service.summary(&session_id).await?;
    Ok(Json(summary))
}

/// POST /v1/sessions/{session_id}/commit - Commit an upload session.
#[tracing::instrument(skip(state, request), fields(session_id = %session_id))]
pub async fn commit_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<CommitRequest>,
) -> ApiResult<Json<CommitResponse>> {
    let session_id =
        SessionId::parse(&session_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let started = Instant::now();
    match state.service.commit(session_id, request).await {
        Ok(response) => {
            COMMIT_DURATION.observe(started.elapsed().as_secs_f64());
            UPLOAD_SESSIONS_COMMITTED.inc();
            SESSIONS_ACTIVE.set(state.service.session_count() as i64);
            Ok(Json(response))
        }
        Err(err) => {
            UPLOAD_SESSIONS_FAILED.inc();
            Err(err.into())
        }
    }
}

/// POST /v1/sessions/{session_id}/abort - Abort an upload session.
#[tracing::instrument(skip(state, request), fields(session_id = %session_id))]
pub async fn abort_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<AbortRequest>,
) -> ApiResult<StatusCode> {
    let session_id =
        SessionId::parse(&session_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state.service.abort(session_id, request.reason).await?;
    UPLOAD_SESSIONS_FAILED.inc();
    SESSIONS_ACTIVE.set(state.service.session_count() as i64);
    Ok(StatusCode::NO_CONTENT)
}
