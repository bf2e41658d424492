//! Depot server: RPC front and subscription gateway.
//!
//! Thin transport wiring over the transfer service: unary calls for
//! session control and catalog operations, client-streaming chunk
//! ingest, server-streaming downloads and progress, plus the duplex
//! WebSocket gateway. No business logic lives here.

pub mod error;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use gateway::GatewayServer;
pub use routes::create_router;
pub use state::AppState;
