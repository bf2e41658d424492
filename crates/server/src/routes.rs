//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Discovery and health (unauthenticated for probes)
        .route("/v1/capabilities", get(handlers::get_capabilities))
        .route("/v1/health", get(handlers::health_check))
        // Upload control plane
        .route("/v1/sessions", post(handlers::create_session))
        .route(
            "/v1/sessions/{session_id}/chunks",
            post(handlers::upload_chunks),
        )
        .route(
            "/v1/sessions/{session_id}/commit",
            post(handlers::commit_session),
        )
        .route(
            "/v1/sessions/{session_id}/abort",
            post(handlers::abort_session),
        )
        // Artifact read path
        .route("/v1/artifacts", get(handlers::list_artifacts))
        .route(
            "/v1/artifacts/{app}/{version}/{platform}/{filename}",
            get(handlers::download_artifact).delete(handlers::delete_artifact),
        )
        .route(
            "/v1/artifacts/{app}/{version}/{platform}/{filename}/meta",
            get(handlers::get_artifact_meta),
        )
        .route(
            "/v1/artifacts/{app}/{version}/{platform}/{filename}/url",
            get(handlers::get_signed_url),
        )
        // Progress read path
        .route("/v1/progress/{operation_id}", get(handlers::get_progress))
        .route(
            "/v1/progress/{operation_id}/stream",
            get(handlers::stream_progress),
        );

    let mut router = Router::new().merge(api_routes);

    // Restrict /metrics at the network level in production.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
