//! Shared fixtures for server tests.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use depot_core::config::AppConfig;
use depot_progress::{ProgressRegistry, RegistryOptions};
use depot_protocol::frame::{ChunkFrameHeader, DataFrameHeader, read_data_frame, write_chunk_frame, write_end_marker};
use depot_server::{AppState, create_router};
use depot_service::TransferService;
use depot_storage::{FilesystemBackend, ObjectStore};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::util::ServiceExt;

/// Build a full application router over a temp-dir backend.
pub async fn build_app() -> (TempDir, AppState, Router) {
    depot_server::metrics::register_metrics();
    let temp = TempDir::new().unwrap();
    let mut config = AppConfig::for_testing();
    config.storage = depot_core::config::StorageConfig::Filesystem {
        path: temp.path().to_path_buf(),
    };

    let storage: Arc<dyn ObjectStore> =
        Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
    let registry = ProgressRegistry::new(RegistryOptions {
        coalesce_interval: Duration::ZERO,
        retention_after_terminal: Duration::from_secs(60),
        subscriber_buffer_capacity: 64,
    });
    let service = TransferService::new(
        storage,
        registry.clone(),
        config.server.clone(),
        Duration::from_secs(60),
    );

    let state = AppState::new(config, service, registry);
    let router = create_router(state.clone());
    (temp, state, router)
}

/// One-shot a request against the router.
pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn json_body<T: DeserializeOwned>(response: Response<Body>) -> T {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).unwrap()
}

/// Encode `data` as a chunk-frame request body.
pub async fn encode_chunk_body(session_id: &str, data: &[u8], chunk_size: usize) -> Vec<u8> {
    let mut body = Vec::new();
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![&[]]
    } else {
        data.chunks(chunk_size).collect()
    };
    let count = chunks.len();
    for (i, piece) in chunks.into_iter().enumerate() {
        let header = ChunkFrameHeader {
            session_id: session_id.to_string(),
            sequence: (i + 1) as u64,
            payload_len: piece.len() as u64,
            is_final: i + 1 == count,
            checksum: None,
        };
        write_chunk_frame(&mut body, &header, piece).await.unwrap();
    }
    write_end_marker(&mut body).await.unwrap();
    body
}

/// Decode a framed download body back into payload bytes, checking
/// frame invariants.
pub async fn decode_download_body(body: &[u8]) -> (Vec<u8>, Vec<DataFrameHeader>) {
    let mut cursor = body;
    let mut payload = Vec::new();
    let mut headers = Vec::new();
    while let Some((header, data)) = read_data_frame(&mut cursor, u64::MAX).await.unwrap() {
        payload.extend_from_slice(&data);
        let is_final = header.is_final;
        headers.push(header);
        if is_final {
            break;
        }
    }
    (payload, headers)
}

/// Deterministic pseudo-random payload.
pub fn test_bytes(len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    let mut state = 0x9E3779B9u32;
    for _ in 0..len {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        data.push((state >> 24) as u8);
    }
    data
}

/// Drive a full upload through the HTTP surface, returning the session
/// id.
pub async fn upload_artifact(router: &Router, path: &str, data: &[u8]) -> String {
    let (app, rest) = path.split_once('/').unwrap();
    let (version, rest) = rest.split_once('/').unwrap();
    let (platform, filename) = rest.split_once('/').unwrap();

    let response = send(
        router,
        json_request(
            "POST",
            "/v1/sessions",
            serde_json::json!({
                "coordinate": {
                    "app": app,
                    "version": version,
                    "platform": platform,
                    "filename": filename,
                },
                "declared_size": data.len(),
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let initiate: serde_json::Value = json_body(response).await;
    let session_id = initiate["session_id"].as_str().unwrap().to_string();

    let body = encode_chunk_body(&session_id, data, 64 * 1024).await;
    let response = send(
        router,
        Request::builder()
            .method("POST")
            .uri(format!("/v1/sessions/{session_id}/chunks"))
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let digest = depot_core::ContentDigest::of(data).to_hex();
    let response = send(
        router,
        json_request(
            "POST",
            &format!("/v1/sessions/{session_id}/commit"),
            serde_json::json!({ "expected_digest": digest }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    session_id
}
