//! Download streaming, ranges, cancellation, and subscriber fan-out.

mod common;

use common::*;
use depot_core::session::CommitRequest;
use depot_core::{ContentDigest, ErrorKind, OperationId, ProgressStatus, SessionId};
use depot_storage::ByteRange;
use futures::StreamExt;
use std::time::Duration;

async fn store_artifact(
    service: &depot_service::TransferService,
    coordinate: &depot_core::ArtifactCoordinate,
    data: &[u8],
) {
    let response = service
        .initiate(initiate_request(coordinate, Some(data.len() as u64)))
        .await
        .unwrap();
    let session_id = SessionId::parse(&response.session_id).unwrap();
    stream_data(service, session_id, data, 1_048_576).await;
    service
        .commit(
            session_id,
            CommitRequest {
                expected_digest: Some(ContentDigest::of(data).to_hex()),
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn download_missing_artifact_is_not_found() {
    let (_temp, service) = build_service().await;
    let err = service
        .stream_download(&coordinate("ghost", "g.bin"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn ranged_download_covers_exactly_the_range() {
    let (_temp, service) = build_service().await;
    let coordinate = coordinate("ranged", "r.bin");
    let data = test_bytes(10 * 1024 * 1024);
    store_artifact(&service, &coordinate, &data).await;

    let range = ByteRange::new(1_000_000, 2_000_000).unwrap();
    let download = service
        .stream_download(&coordinate, Some(range))
        .await
        .unwrap();
    assert_eq!(download.total_size, 1_000_000);

    let bytes = collect_download(download).await;
    assert_eq!(bytes.len(), 1_000_000);
    assert_eq!(&bytes[..], &data[1_000_000..2_000_000]);
}

#[tokio::test]
async fn range_outside_object_is_invalid() {
    let (_temp, service) = build_service().await;
    let coordinate = coordinate("small", "s.bin");
    store_artifact(&service, &coordinate, &test_bytes(1024)).await;

    let range = ByteRange::new(500, 5000).unwrap();
    let err = service
        .stream_download(&coordinate, Some(range))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[tokio::test]
async fn download_completes_progress() {
    let (_temp, service) = build_service().await;
    let coordinate = coordinate("dl", "d.bin");
    let data = test_bytes(512 * 1024);
    store_artifact(&service, &coordinate, &data).await;

    let download = service.stream_download(&coordinate, None).await.unwrap();
    let operation_id = download.operation_id;
    collect_download(download).await;

    let snapshot = service.progress().snapshot(&operation_id).unwrap();
    assert_eq!(snapshot.status, ProgressStatus::Completed);
    assert_eq!(snapshot.bytes_processed, 512 * 1024);
    assert_eq!(snapshot.bytes_total, 512 * 1024);
}

#[tokio::test]
async fn dropped_download_marks_progress_cancelled() {
    let (_temp, service) = build_service().await;
    let coordinate = coordinate("cancel", "c.bin");
    store_artifact(&service, &coordinate, &test_bytes(4 * 1024 * 1024)).await;

    let mut download = service.stream_download(&coordinate, None).await.unwrap();
    let operation_id = download.operation_id;

    // Take one frame, then hang up.
    let first = download.frames.next().await.unwrap().unwrap();
    assert_eq!(first.sequence, 1);
    drop(download);

    let snapshot = service.progress().snapshot(&operation_id).unwrap();
    assert_eq!(snapshot.status, ProgressStatus::Failed);
    assert_eq!(snapshot.error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn subscriber_fanout_with_slow_subscriber() {
    let (_temp, service) = build_service().await;
    let coordinate = coordinate("fan", "f.bin");
    let data = test_bytes(2 * 1024 * 1024);

    let response = service
        .initiate(initiate_request(&coordinate, Some(data.len() as u64)))
        .await
        .unwrap();
    let session_id = SessionId::parse(&response.session_id).unwrap();
    let operation_id = OperationId::from(session_id);

    // Two subscribers attach mid-upload: one reads eagerly, one stalls.
    let fast = service.progress().subscribe(&operation_id).unwrap();
    let slow = service.progress().subscribe(&operation_id).unwrap();

    let fast_task = tokio::spawn(async move { fast.collect::<Vec<_>>().await });

    let started = std::time::Instant::now();
    stream_data(&service, session_id, &data, 64 * 1024).await;
    service
        .commit(
            session_id,
            CommitRequest {
                expected_digest: Some(ContentDigest::of(&data).to_hex()),
            },
        )
        .await
        .unwrap();
    let ingest_elapsed = started.elapsed();

    // The stalled subscriber must not have slowed ingest; this bound is
    // generous enough for CI noise while catching real blocking.
    assert!(
        ingest_elapsed < Duration::from_secs(5),
        "ingest took {ingest_elapsed:?}"
    );

    let fast_snapshots = fast_task.await.unwrap();
    assert!(fast_snapshots.len() >= 2);
    assert_eq!(
        fast_snapshots.last().unwrap().status,
        ProgressStatus::Completed
    );
    for pair in fast_snapshots.windows(2) {
        assert!(pair[0].bytes_processed <= pair[1].bytes_processed);
    }

    // The slow subscriber drains only now: a coalesced sequence that
    // still ends with the terminal snapshot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let slow_snapshots: Vec<_> = slow.collect().await;
    assert!(!slow_snapshots.is_empty());
    let last = slow_snapshots.last().unwrap();
    assert_eq!(last.status, ProgressStatus::Completed);
    assert_eq!(last.bytes_processed, data.len() as u64);
    for pair in slow_snapshots.windows(2) {
        assert!(pair[0].bytes_processed <= pair[1].bytes_processed);
    }
}

#[tokio::test]
async fn signed_url_unsupported_on_filesystem() {
    let (_temp, service) = build_service().await;
    let coordinate = coordinate("url", "u.bin");
    store_artifact(&service, &coordinate, &test_bytes(64)).await;

    let err = service
        .signed_url(&coordinate, Duration::from_secs(600))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[tokio::test]
async fn head_is_idempotent() {
    let (_temp, service) = build_service().await;
    let coordinate = coordinate("head", "h.bin");
    store_artifact(&service, &coordinate, &test_bytes(4096)).await;

    let first = service.head(&coordinate).await.unwrap();
    let second = service.head(&coordinate).await.unwrap();
    assert_eq!(first.size, second.size);
    assert_eq!(first.etag, second.etag);
}
