//! HTTP surface tests: upload, download, catalog, progress, errors.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use depot_core::ContentDigest;

#[tokio::test]
async fn capabilities_reports_limits() {
    let (_temp, state, router) = build_app().await;
    let response = send(&router, get("/v1/capabilities")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = json_body(response).await;
    assert_eq!(body["server"], "depot");
    assert_eq!(
        body["multipart_threshold_bytes"].as_u64().unwrap(),
        state.config.server.multipart_threshold_bytes
    );
    assert!(body["max_chunk_bytes"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn health_reports_ok() {
    let (_temp, _state, router) = build_app().await;
    let response = send(&router, get("/v1/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = json_body(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn upload_download_roundtrip() {
    let (_temp, _state, router) = build_app().await;
    let data = test_bytes(300_000);
    upload_artifact(&router, "app/2.0.0/linux-x86_64/app.bin", &data).await;

    // Metadata
    let response = send(&router, get("/v1/artifacts/app/2.0.0/linux-x86_64/app.bin/meta")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let meta: serde_json::Value = json_body(response).await;
    assert_eq!(meta["size"].as_u64().unwrap(), 300_000);

    // Full download
    let response = send(&router, get("/v1/artifacts/app/2.0.0/linux-x86_64/app.bin")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get("x-depot-operation-id")
            .is_some()
    );
    let body = body_bytes(response).await;
    let (payload, headers) = decode_download_body(&body).await;
    assert_eq!(payload, data);
    assert!(headers.last().unwrap().is_final);
    for header in &headers {
        assert_eq!(header.total_size, 300_000);
    }
    for pair in headers.windows(2) {
        assert_eq!(pair[1].sequence, pair[0].sequence + 1);
    }
}

#[tokio::test]
async fn ranged_download_honours_bounds() {
    let (_temp, _state, router) = build_app().await;
    let data = test_bytes(100_000);
    upload_artifact(&router, "rng/1.0.0/linux-x86_64/r.bin", &data).await;

    let response = send(
        &router,
        get("/v1/artifacts/rng/1.0.0/linux-x86_64/r.bin?start=10000&end=20000"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_bytes(response).await;
    let (payload, headers) = decode_download_body(&body).await;
    assert_eq!(payload, &data[10_000..20_000]);
    assert!(headers.iter().all(|h| h.total_size == 10_000));
}

#[tokio::test]
async fn download_missing_is_404() {
    let (_temp, _state, router) = build_app().await;
    let response = send(&router, get("/v1/artifacts/none/1.0.0/linux/x.bin")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = json_body(response).await;
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn invalid_coordinate_is_400() {
    let (_temp, _state, router) = build_app().await;
    let response = send(
        &router,
        json_request(
            "POST",
            "/v1/sessions",
            serde_json::json!({
                "coordinate": {
                    "app": "..",
                    "version": "1.0.0",
                    "platform": "linux",
                    "filename": "a.bin",
                },
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn commit_unknown_session_is_404() {
    let (_temp, _state, router) = build_app().await;
    let ghost = depot_core::SessionId::new();
    let response = send(
        &router,
        json_request(
            "POST",
            &format!("/v1/sessions/{ghost}/commit"),
            serde_json::json!({}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn digest_mismatch_is_422() {
    let (_temp, _state, router) = build_app().await;
    let data = test_bytes(4096);

    let response = send(
        &router,
        json_request(
            "POST",
            "/v1/sessions",
            serde_json::json!({
                "coordinate": {
                    "app": "bad", "version": "1.0.0",
                    "platform": "linux", "filename": "b.bin",
                },
                "declared_size": data.len(),
            }),
        ),
    )
    .await;
    let initiate: serde_json::Value = json_body(response).await;
    let session_id = initiate["session_id"].as_str().unwrap().to_string();

    let body = encode_chunk_body(&session_id, &data, 1024).await;
    let response = send(
        &router,
        Request::builder()
            .method("POST")
            .uri(format!("/v1/sessions/{session_id}/chunks"))
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let wrong = ContentDigest::of(b"wrong").to_hex();
    let response = send(
        &router,
        json_request(
            "POST",
            &format!("/v1/sessions/{session_id}/commit"),
            serde_json::json!({ "expected_digest": wrong }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = json_body(response).await;
    assert_eq!(body["code"], "integrity");

    // Nothing observable was stored.
    let response = send(&router, get("/v1/artifacts/bad/1.0.0/linux/b.bin/meta")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chunk_stream_session_mismatch_is_400() {
    let (_temp, _state, router) = build_app().await;

    let response = send(
        &router,
        json_request(
            "POST",
            "/v1/sessions",
            serde_json::json!({
                "coordinate": {
                    "app": "mm", "version": "1.0.0",
                    "platform": "linux", "filename": "m.bin",
                },
            }),
        ),
    )
    .await;
    let initiate: serde_json::Value = json_body(response).await;
    let session_id = initiate["session_id"].as_str().unwrap().to_string();

    // Frames claim a different session than the path.
    let other = depot_core::SessionId::new().to_string();
    let body = encode_chunk_body(&other, b"data", 4).await;
    let response = send(
        &router,
        Request::builder()
            .method("POST")
            .uri(format!("/v1/sessions/{session_id}/chunks"))
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn abort_then_chunks_conflict() {
    let (_temp, _state, router) = build_app().await;

    let response = send(
        &router,
        json_request(
            "POST",
            "/v1/sessions",
            serde_json::json!({
                "coordinate": {
                    "app": "ab", "version": "1.0.0",
                    "platform": "linux", "filename": "a.bin",
                },
            }),
        ),
    )
    .await;
    let initiate: serde_json::Value = json_body(response).await;
    let session_id = initiate["session_id"].as_str().unwrap().to_string();

    let response = send(
        &router,
        json_request(
            "POST",
            &format!("/v1/sessions/{session_id}/abort"),
            serde_json::json!({ "reason": "test" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let body = encode_chunk_body(&session_id, b"late", 4).await;
    let response = send(
        &router,
        Request::builder()
            .method("POST")
            .uri(format!("/v1/sessions/{session_id}/chunks"))
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn list_and_delete() {
    let (_temp, _state, router) = build_app().await;
    upload_artifact(&router, "cat/1.0.0/linux-x86_64/a.bin", &test_bytes(256)).await;
    upload_artifact(&router, "cat/1.0.0/linux-x86_64/b.bin", &test_bytes(256)).await;

    let response = send(&router, get("/v1/artifacts?prefix=cat/&limit=10")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let page: serde_json::Value = json_body(response).await;
    assert_eq!(page["entries"].as_array().unwrap().len(), 2);

    let response = send(
        &router,
        Request::builder()
            .method("DELETE")
            .uri("/v1/artifacts/cat/1.0.0/linux-x86_64/a.bin")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = json_body(response).await;
    assert_eq!(body["deleted"], true);

    // Second delete reports absence.
    let response = send(
        &router,
        Request::builder()
            .method("DELETE")
            .uri("/v1/artifacts/cat/1.0.0/linux-x86_64/a.bin")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let body: serde_json::Value = json_body(response).await;
    assert_eq!(body["deleted"], false);
}

#[tokio::test]
async fn progress_snapshot_and_stream() {
    let (_temp, _state, router) = build_app().await;
    let data = test_bytes(8192);
    let session_id = upload_artifact(&router, "pr/1.0.0/linux-x86_64/p.bin", &data).await;

    // The session id doubles as the progress operation id; the record
    // is retained within the grace window.
    let response = send(&router, get(&format!("/v1/progress/{session_id}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot: serde_json::Value = json_body(response).await;
    assert_eq!(snapshot["status"], "completed");
    assert_eq!(snapshot["bytes_processed"].as_u64().unwrap(), 8192);

    // The streaming variant delivers NDJSON ending with the terminal
    // snapshot.
    let response = send(&router, get(&format!("/v1/progress/{session_id}/stream"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_bytes(response).await;
    let lines: Vec<serde_json::Value> = body
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).unwrap())
        .collect();
    assert!(!lines.is_empty());
    assert_eq!(lines.last().unwrap()["status"], "completed");
}

#[tokio::test]
async fn progress_unknown_operation_is_404() {
    let (_temp, _state, router) = build_app().await;
    let ghost = depot_core::OperationId::new();
    let response = send(&router, get(&format!("/v1/progress/{ghost}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&router, get(&format!("/v1/progress/{ghost}/stream"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_endpoint_exposes_counters() {
    let (_temp, _state, router) = build_app().await;
    upload_artifact(&router, "m/1.0.0/linux-x86_64/m.bin", &test_bytes(128)).await;

    let response = send(&router, get("/metrics")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("depot_upload_sessions_created_total"));
}
