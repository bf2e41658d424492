//! Core domain types for the depot artifact distribution server.
//!
//! This crate defines the shared vocabulary of the system: artifact
//! coordinates, upload sessions, chunk messages, progress snapshots,
//! configuration, and the error taxonomy. It has no I/O of its own.

pub mod chunk;
pub mod config;
pub mod coordinate;
pub mod digest;
pub mod error;
pub mod progress;
pub mod session;

pub use chunk::ChunkMessage;
pub use coordinate::ArtifactCoordinate;
pub use digest::{ContentDigest, Digester};
pub use error::{Error, ErrorKind, Result};
pub use progress::{OperationId, ProgressSnapshot, ProgressStatus};
pub use session::{SessionId, SessionState, UploadMode};

/// Default multipart selection threshold (5 MiB).
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Default recommended chunk size returned from Initiate (256 KiB).
pub const DEFAULT_RECOMMENDED_CHUNK_SIZE: u64 = 256 * 1024;

/// Absolute maximum inbound chunk size (32 MiB).
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Smallest chunk size a client may be told to use (16 KiB).
pub const MIN_CHUNK_SIZE: u64 = 16 * 1024;
