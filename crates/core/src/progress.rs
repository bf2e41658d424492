//! Progress records shared between uploads and downloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Opaque identifier for either an upload session or a download
/// operation, used as the progress key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generate a new random operation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (used when a session id doubles as the
    /// progress key).
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(format!("invalid operation ID: {e}")))
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationId({})", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse status of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    InProgress,
    Completed,
    Failed,
}

impl ProgressStatus {
    /// Whether this status ends the stream of snapshots.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Immutable view of an operation at a point in time.
///
/// Snapshots for one operation are observed by each subscriber in
/// non-decreasing `bytes_processed` order; a terminal snapshot is
/// always the last one delivered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub operation_id: OperationId,
    pub status: ProgressStatus,
    pub bytes_processed: u64,
    /// Zero when the total is unknown.
    pub bytes_total: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    /// Last human-readable event label.
    #[serde(default)]
    pub message: Option<String>,
    /// Last error description when failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl ProgressSnapshot {
    /// Average throughput in bytes per second since the operation
    /// started, or zero when no time has elapsed.
    pub fn speed_bps(&self) -> f64 {
        let elapsed = (self.updated_at - self.started_at).as_seconds_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.bytes_processed as f64 / elapsed
    }

    /// Estimated seconds remaining, when both a total and a positive
    /// speed are known.
    pub fn eta_seconds(&self) -> Option<f64> {
        let speed = self.speed_bps();
        if speed <= 0.0 || self.bytes_total == 0 {
            return None;
        }
        let remaining = self.bytes_total.saturating_sub(self.bytes_processed);
        Some(remaining as f64 / speed)
    }
}
