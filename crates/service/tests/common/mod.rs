//! Shared fixtures for transfer service tests.

use bytes::Bytes;
use depot_core::config::ServerConfig;
use depot_core::session::InitiateRequest;
use depot_core::{ArtifactCoordinate, ChunkMessage, SessionId};
use depot_progress::{ProgressRegistry, RegistryOptions};
use depot_service::{Download, TransferService};
use depot_storage::{FilesystemBackend, ObjectStore};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Build a service over a temp-dir filesystem backend with fast
/// progress settings.
pub async fn build_service() -> (TempDir, Arc<TransferService>) {
    build_service_with(ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        gateway_bind: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    })
    .await
}

pub async fn build_service_with(config: ServerConfig) -> (TempDir, Arc<TransferService>) {
    let temp = TempDir::new().unwrap();
    let storage: Arc<dyn ObjectStore> =
        Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
    let registry = ProgressRegistry::new(RegistryOptions {
        coalesce_interval: Duration::ZERO,
        retention_after_terminal: Duration::from_secs(60),
        subscriber_buffer_capacity: 64,
    });
    let service = TransferService::new(storage, registry, config, Duration::from_secs(60));
    (temp, service)
}

pub fn coordinate(app: &str, filename: &str) -> ArtifactCoordinate {
    ArtifactCoordinate::new(app, "1.0.0", "linux-x86_64", filename).unwrap()
}

pub fn initiate_request(
    coordinate: &ArtifactCoordinate,
    declared_size: Option<u64>,
) -> InitiateRequest {
    InitiateRequest {
        coordinate: coordinate.clone(),
        declared_size,
        content_type: Some("application/octet-stream".to_string()),
        expected_digest: None,
    }
}

pub fn chunk(session_id: SessionId, sequence: u64, payload: Vec<u8>, is_final: bool) -> ChunkMessage {
    ChunkMessage {
        session_id,
        sequence,
        payload: Bytes::from(payload),
        is_final,
        checksum: None,
    }
}

/// Deterministic pseudo-random payload.
pub fn test_bytes(len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    let mut state = 0x2545F491u32;
    for _ in 0..len {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        data.push((state >> 24) as u8);
    }
    data
}

/// Stream all chunks of `data` into a session in `chunk_size` pieces.
pub async fn stream_data(
    service: &TransferService,
    session_id: SessionId,
    data: &[u8],
    chunk_size: usize,
) {
    let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
    let count = chunks.len();
    for (i, piece) in chunks.into_iter().enumerate() {
        let sequence = (i + 1) as u64;
        let is_final = i + 1 == count;
        service
            .ingest_chunk(chunk(session_id, sequence, piece.to_vec(), is_final))
            .await
            .unwrap();
    }
}

/// Drain a download into its byte payload, checking frame invariants.
pub async fn collect_download(mut download: Download) -> Vec<u8> {
    let mut out = Vec::new();
    let mut last_sequence = 0;
    let mut finished = false;
    while let Some(frame) = download.frames.next().await {
        let frame = frame.unwrap();
        assert_eq!(frame.sequence, last_sequence + 1, "frames strictly ordered");
        assert_eq!(frame.total_size, download.total_size);
        last_sequence = frame.sequence;
        if frame.is_final {
            assert!(frame.payload.is_empty(), "final frame carries no payload");
            finished = true;
        } else {
            assert!(!finished, "no frames after final");
            out.extend_from_slice(&frame.payload);
        }
    }
    assert!(finished, "download must end with a final frame");
    out
}
