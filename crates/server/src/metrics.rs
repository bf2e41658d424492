//! Prometheus metrics for the depot server.
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus
//! scraping; restrict it at the network level in production.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static UPLOAD_SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_upload_sessions_created_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_COMMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_upload_sessions_committed_total",
        "Total number of upload sessions successfully committed",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_upload_sessions_failed_total",
        "Total number of upload sessions that failed or were aborted",
    )
    .expect("metric creation failed")
});

pub static BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_bytes_uploaded_total", "Total artifact bytes ingested")
        .expect("metric creation failed")
});

pub static BYTES_DOWNLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_bytes_downloaded_total",
        "Total artifact bytes streamed to clients",
    )
    .expect("metric creation failed")
});

pub static DOWNLOADS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_downloads_started_total",
        "Total number of streaming downloads opened",
    )
    .expect("metric creation failed")
});

pub static CHUNK_INGEST_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "depot_chunk_ingest_duration_seconds",
            "Time taken to ingest a single chunk",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
    )
    .expect("metric creation failed")
});

pub static COMMIT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "depot_commit_duration_seconds",
            "Time taken to commit an upload session",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

pub static SESSIONS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("depot_sessions_active", "Currently tracked upload sessions")
        .expect("metric creation failed")
});

pub static GATEWAY_CONNECTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "depot_gateway_connections",
        "Currently connected gateway clients",
    )
    .expect("metric creation failed")
});

pub static GATEWAY_SUBSCRIPTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "depot_gateway_subscriptions",
        "Active progress subscriptions across gateway connections",
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry. Idempotent.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOAD_SESSIONS_CREATED.clone()),
            Box::new(UPLOAD_SESSIONS_COMMITTED.clone()),
            Box::new(UPLOAD_SESSIONS_FAILED.clone()),
            Box::new(BYTES_UPLOADED.clone()),
            Box::new(BYTES_DOWNLOADED.clone()),
            Box::new(DOWNLOADS_STARTED.clone()),
            Box::new(CHUNK_INGEST_DURATION.clone()),
            Box::new(COMMIT_DURATION.clone()),
            Box::new(SESSIONS_ACTIVE.clone()),
            Box::new(GATEWAY_CONNECTIONS.clone()),
            Box::new(GATEWAY_SUBSCRIPTIONS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "failed to register metric");
            }
        }
    });
}

/// GET /metrics - Prometheus text exposition.
pub async fn metrics_handler() -> impl IntoResponse {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", prometheus::TEXT_FORMAT)],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        register_metrics();
        register_metrics();
        UPLOAD_SESSIONS_CREATED.inc();
        assert!(UPLOAD_SESSIONS_CREATED.get() >= 1);
    }

    #[tokio::test]
    async fn metrics_handler_produces_text() {
        register_metrics();
        BYTES_UPLOADED.inc_by(10);
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
