//! Writer-side handle for one progress record.

use crate::registry::{Operation, ProgressRegistry};
use depot_core::{OperationId, ProgressStatus};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

/// Exclusive writer handle for one operation's progress record.
///
/// All mutation goes through this handle; publishing is synchronous and
/// non-blocking, so the ingest path never waits on subscribers.
pub struct ProgressHandle {
    registry: Arc<ProgressRegistry>,
    operation: Arc<Operation>,
}

impl ProgressHandle {
    pub(crate) fn new(registry: Arc<ProgressRegistry>, operation: Arc<Operation>) -> Self {
        Self {
            registry,
            operation,
        }
    }

    /// The operation this handle writes to.
    pub fn operation_id(&self) -> OperationId {
        self.operation.id
    }

    /// Atomically add processed bytes and publish, subject to
    /// coalescing: non-terminal publishes are suppressed while the last
    /// one is younger than the configured interval. The byte counter is
    /// monotonic regardless of publishing.
    pub fn advance(&self, delta: u64, label: Option<&str>) {
        let coalesce = self.registry.options().coalesce_interval;
        let mut state = self.operation.state.lock().unwrap();
        if state.status.is_terminal() {
            return;
        }

        state.bytes_processed += delta;
        state.updated_at = OffsetDateTime::now_utc();
        if let Some(label) = label {
            state.message = Some(label.to_string());
        }

        let due = match state.last_publish {
            Some(last) => last.elapsed() >= coalesce,
            None => true,
        };
        if due {
            state.last_publish = Some(Instant::now());
            let snapshot = self.operation.snapshot_locked(&state);
            self.operation.publish_locked(&mut state, &snapshot);
        }
    }

    /// Mark the operation completed and publish the terminal snapshot.
    /// Idempotent: a record already terminal is left untouched.
    pub fn complete(&self, label: Option<&str>) {
        self.finish(ProgressStatus::Completed, label, None);
    }

    /// Mark the operation failed with a short stable error label and
    /// publish the terminal snapshot.
    pub fn fail(&self, error: impl Into<String>) {
        self.finish(ProgressStatus::Failed, None, Some(error.into()));
    }

    fn finish(&self, status: ProgressStatus, label: Option<&str>, error: Option<String>) {
        {
            let mut state = self.operation.state.lock().unwrap();
            if state.status.is_terminal() {
                return;
            }

            let now = OffsetDateTime::now_utc();
            state.status = status;
            state.updated_at = now;
            state.finished_at = Some(now);
            if let Some(label) = label {
                state.message = Some(label.to_string());
            }
            if let Some(error) = &error {
                state.error = Some(error.clone());
            }
            state.last_publish = Some(Instant::now());

            let snapshot = self.operation.snapshot_locked(&state);
            self.operation.publish_locked(&mut state, &snapshot);
            // Terminal subscribers are done; drop the registrations.
            state.subscribers.clear();
        }

        tracing::debug!(
            operation_id = %self.operation.id,
            status = ?status,
            error = error.as_deref().unwrap_or(""),
            "progress record terminal"
        );
        self.registry.schedule_removal(self.operation.id);
    }
}
