//! Application state shared across handlers.

use depot_core::config::AppConfig;
use depot_progress::ProgressRegistry;
use depot_service::TransferService;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Transfer service.
    pub service: Arc<TransferService>,
    /// Progress registry (shared with the service and the gateway).
    pub progress: Arc<ProgressRegistry>,
}

impl AppState {
    /// Create application state.
    ///
    /// # Panics
    ///
    /// Panics if the server configuration is invalid; this is a startup
    /// error and the process must not come up half-configured.
    pub fn new(
        config: AppConfig,
        service: Arc<TransferService>,
        progress: Arc<ProgressRegistry>,
    ) -> Self {
        if let Err(error) = config.server.validate() {
            panic!("invalid server configuration: {error}");
        }
        if let Err(error) = config.storage.validate() {
            panic!("invalid storage configuration: {error}");
        }

        Self {
            config: Arc::new(config),
            service,
            progress,
        }
    }
}
