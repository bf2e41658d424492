//! Process-wide progress registry.

use crate::handle::ProgressHandle;
use crate::subscriber::{ProgressStream, SubscriberSlot};
use depot_core::config::ProgressConfig;
use depot_core::{OperationId, ProgressSnapshot, ProgressStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use time::OffsetDateTime;

/// Subscription failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    /// The operation id is unknown (never existed, or already past its
    /// retention window). Transports surface this as a synthetic
    /// `not_found` terminator.
    #[error("operation not found: {0}")]
    NotFound(OperationId),
}

/// Tuning knobs for the registry, derived from [`ProgressConfig`].
#[derive(Clone, Debug)]
pub struct RegistryOptions {
    /// Minimum gap between non-terminal publishes.
    pub coalesce_interval: Duration,
    /// Grace period before terminal records are deleted.
    pub retention_after_terminal: Duration,
    /// Per-subscriber snapshot buffer capacity.
    pub subscriber_buffer_capacity: usize,
}

impl From<&ProgressConfig> for RegistryOptions {
    fn from(config: &ProgressConfig) -> Self {
        Self {
            coalesce_interval: config.coalesce_interval(),
            retention_after_terminal: config.retention_after_terminal(),
            subscriber_buffer_capacity: config.buffer_capacity(),
        }
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::from(&ProgressConfig::default())
    }
}

/// Mutable state of one tracked operation. Guarded by the operation's
/// mutex; critical sections stay short and never await.
pub(crate) struct OperationState {
    pub(crate) status: ProgressStatus,
    pub(crate) bytes_processed: u64,
    pub(crate) bytes_total: u64,
    pub(crate) started_at: OffsetDateTime,
    pub(crate) updated_at: OffsetDateTime,
    pub(crate) finished_at: Option<OffsetDateTime>,
    pub(crate) message: Option<String>,
    pub(crate) error: Option<String>,
    pub(crate) last_publish: Option<Instant>,
    pub(crate) subscribers: Vec<Weak<SubscriberSlot>>,
}

pub(crate) struct Operation {
    pub(crate) id: OperationId,
    pub(crate) state: Mutex<OperationState>,
}

impl Operation {
    pub(crate) fn snapshot_locked(&self, state: &OperationState) -> ProgressSnapshot {
        ProgressSnapshot {
            operation_id: self.id,
            status: state.status,
            bytes_processed: state.bytes_processed,
            bytes_total: state.bytes_total,
            started_at: state.started_at,
            updated_at: state.updated_at,
            finished_at: state.finished_at,
            message: state.message.clone(),
            error: state.error.clone(),
        }
    }

    /// Fan a snapshot out to all live subscribers, pruning dead ones.
    pub(crate) fn publish_locked(&self, state: &mut OperationState, snapshot: &ProgressSnapshot) {
        state.subscribers.retain(|weak| match weak.upgrade() {
            Some(slot) => {
                slot.push(snapshot.clone());
                true
            }
            None => false,
        });
    }
}

/// Process-wide map of operation id to live progress state.
///
/// The registry owns progress records exclusively; sessions and
/// downloads mutate them only through the [`ProgressHandle`] handed out
/// by [`open`](Self::open).
pub struct ProgressRegistry {
    options: RegistryOptions,
    operations: RwLock<HashMap<OperationId, Arc<Operation>>>,
}

impl ProgressRegistry {
    /// Create a registry with the given options.
    pub fn new(options: RegistryOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            operations: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Create a record in `in_progress` and publish the initial
    /// snapshot. `bytes_total` of zero means the total is unknown.
    pub fn open(self: &Arc<Self>, id: OperationId, bytes_total: u64) -> ProgressHandle {
        let now = OffsetDateTime::now_utc();
        let operation = Arc::new(Operation {
            id,
            state: Mutex::new(OperationState {
                status: ProgressStatus::InProgress,
                bytes_processed: 0,
                bytes_total,
                started_at: now,
                updated_at: now,
                finished_at: None,
                message: None,
                error: None,
                last_publish: None,
                subscribers: Vec::new(),
            }),
        });

        self.operations
            .write()
            .unwrap()
            .insert(id, operation.clone());

        tracing::debug!(operation_id = %id, bytes_total, "progress record opened");
        ProgressHandle::new(self.clone(), operation)
    }

    /// Current snapshot of an operation, including terminal records
    /// still inside their grace window.
    pub fn snapshot(&self, id: &OperationId) -> Option<ProgressSnapshot> {
        let operations = self.operations.read().unwrap();
        let operation = operations.get(id)?;
        let state = operation.state.lock().unwrap();
        Some(operation.snapshot_locked(&state))
    }

    /// Attach a subscriber stream.
    ///
    /// The stream immediately yields the current snapshot, then every
    /// subsequent publish up to and including the terminal snapshot,
    /// after which it closes cleanly.
    pub fn subscribe(&self, id: &OperationId) -> Result<ProgressStream, SubscribeError> {
        let operations = self.operations.read().unwrap();
        let operation = operations.get(id).ok_or(SubscribeError::NotFound(*id))?;

        let slot = SubscriberSlot::new(self.options.subscriber_buffer_capacity);
        let mut state = operation.state.lock().unwrap();
        slot.push(operation.snapshot_locked(&state));
        if !state.status.is_terminal() {
            state.subscribers.push(Arc::downgrade(&slot));
        }
        Ok(ProgressStream::new(slot))
    }

    /// Number of live records (terminal ones inside the grace window
    /// included).
    pub fn len(&self) -> usize {
        self.operations.read().unwrap().len()
    }

    /// Whether no records are tracked.
    pub fn is_empty(&self) -> bool {
        self.operations.read().unwrap().is_empty()
    }

    /// Schedule deletion of a terminal record after the grace window so
    /// slow subscribers still observe completion.
    pub(crate) fn schedule_removal(self: &Arc<Self>, id: OperationId) {
        let retention = self.options.retention_after_terminal;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(retention).await;
                    registry.operations.write().unwrap().remove(&id);
                    tracing::debug!(operation_id = %id, "progress record expired");
                });
            }
            // No runtime left (process teardown): drop the record now.
            Err(_) => {
                self.operations.write().unwrap().remove(&id);
            }
        }
    }
}
