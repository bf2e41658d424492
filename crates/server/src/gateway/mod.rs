//! Subscription gateway.
//!
//! A WebSocket listener that externalises progress registry streams:
//! clients subscribe by operation id and receive progress events until
//! the terminal snapshot. Client identity is connection-scoped; all
//! subscriptions are released on disconnect.

mod connection;

use depot_core::config::GatewayConfig;
use depot_progress::ProgressRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Gateway server errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The subscription gateway server.
///
/// Depends on the progress registry only; it never reaches into
/// sessions or the transfer service.
pub struct GatewayServer {
    bind: String,
    registry: Arc<ProgressRegistry>,
    config: GatewayConfig,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl GatewayServer {
    /// Create a new gateway server.
    pub fn new(
        bind: String,
        registry: Arc<ProgressRegistry>,
        config: GatewayConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind,
            registry,
            config,
            cancel,
            local_addr: Mutex::new(None),
        })
    }

    /// The bound address. Only available after [`run`](Self::run) binds
    /// the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Gracefully shut down the gateway and all connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the gateway until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), GatewayServerError> {
        let listener = TcpListener::bind(&self.bind).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("subscription gateway listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("subscription gateway shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = self.registry.clone();
                            let config = self.config.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = connection::handle_connection(
                                    stream, peer_addr, registry, config, cancel,
                                )
                                .await
                                {
                                    tracing::debug!(%peer_addr, "gateway connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("gateway accept error: {e}");
                        }
                    }
                }
            }
        }
    }
}
