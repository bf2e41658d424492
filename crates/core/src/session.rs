//! Upload session types and lifecycle.

use crate::coordinate::ArtifactCoordinate;
use crate::digest::ContentDigest;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(format!("invalid session ID: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<SessionId> for crate::progress::OperationId {
    fn from(id: SessionId) -> Self {
        crate::progress::OperationId::from_uuid(id.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How artifact bytes reach the object store.
///
/// The mode is fixed at initiation: multipart iff the declared size
/// exceeds the configured threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// Accumulate in memory, single put at commit.
    Direct,
    /// Stream parts to the adapter as they fill.
    Multipart,
}

impl UploadMode {
    /// Pick the mode from a declared size and a threshold.
    ///
    /// An absent or zero declared size selects direct mode; the direct
    /// buffer cap still bounds what such a session may accumulate.
    pub fn select(declared_size: Option<u64>, threshold: u64) -> Self {
        match declared_size {
            Some(size) if size > threshold => Self::Multipart,
            _ => Self::Direct,
        }
    }
}

/// Upload session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Accepting chunks.
    Open,
    /// Commit in flight; chunks are rejected.
    Committing,
    /// Object durably stored.
    Committed,
    /// Explicitly cancelled or idle-timed-out.
    Aborted,
    /// Commit or ingest failed.
    Failed,
}

impl SessionState {
    /// Whether the session can still receive chunks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted | Self::Failed)
    }
}

/// A recorded multipart part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartRecord {
    /// 1-based part index, strictly ascending with no gaps at commit.
    pub part_index: u32,
    /// Adapter-assigned etag for the part.
    pub etag: String,
    /// Bytes in the part.
    pub byte_count: u64,
}

/// Request to initiate an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitiateRequest {
    pub coordinate: ArtifactCoordinate,
    /// Declared total byte count; may be absent or zero when unknown.
    #[serde(default)]
    pub declared_size: Option<u64>,
    /// Optional MIME hint stored with the object.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Optional expected SHA-256 hex digest, checked at commit.
    #[serde(default)]
    pub expected_digest: Option<String>,
}

/// Response from initiating an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitiateResponse {
    pub session_id: String,
    /// Hint only; the ingest path accepts any positive chunk length up
    /// to the configured maximum.
    pub recommended_chunk_size: u64,
    pub multipart: bool,
}

/// Request to commit an upload session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Expected SHA-256 hex digest of the full artifact. Must match the
    /// digest computed during ingest when present.
    #[serde(default)]
    pub expected_digest: Option<String>,
}

impl CommitRequest {
    /// Parse the expected digest field, if present.
    pub fn parsed_digest(&self) -> crate::Result<Option<ContentDigest>> {
        self.expected_digest
            .as_deref()
            .map(ContentDigest::from_hex)
            .transpose()
    }
}

/// Response from a successful commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitResponse {
    /// Backend-reported location of the stored object.
    pub location: String,
    /// Backend-reported etag.
    pub etag: String,
}

/// Request to abort an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbortRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Summary returned after a chunk stream completes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSummary {
    pub session_id: String,
    pub chunks_accepted: u64,
    pub bytes_received: u64,
}
