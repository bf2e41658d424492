//! Transfer orchestration for depot.
//!
//! Implements the chunked upload and range-capable download state
//! machines on top of the object store adapter, with short-lived
//! session state and progress fan-out. Dependencies point one way:
//! storage ← service → progress; nothing here references the RPC front.

pub mod download;
pub mod error;
pub mod sessions;
pub mod transfer;

pub use download::{Download, DownloadFrame};
pub use error::{ServiceError, ServiceResult};
pub use sessions::SessionStore;
pub use transfer::TransferService;
