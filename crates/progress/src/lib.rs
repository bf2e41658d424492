//! Progress registry and subscriber fan-out.
//!
//! A process-wide map of operation id to live progress state. Writers
//! hold a [`ProgressHandle`] and publish through it; readers attach
//! subscriber streams that observe snapshots in order, with bounded
//! buffering and latest-wins coalescing so a slow subscriber can never
//! stall the ingest path.

mod handle;
mod registry;
mod subscriber;

pub use handle::ProgressHandle;
pub use registry::{ProgressRegistry, RegistryOptions, SubscribeError};
pub use subscriber::ProgressStream;
