//! HTTP handlers.

pub mod artifacts;
pub mod common;
pub mod progress;
pub mod uploads;

pub use artifacts::{delete_artifact, download_artifact, get_artifact_meta, get_signed_url, list_artifacts};
pub use common::{get_capabilities, health_check};
pub use progress::{get_progress, stream_progress};
pub use uploads::{abort_session, commit_session, create_session, upload_chunks};
