//! In-memory store for in-flight upload sessions.

use crate::error::ServiceError;
use depot_core::digest::Digester;
use depot_core::session::PartRecord;
use depot_core::{ArtifactCoordinate, ContentDigest, SessionId, SessionState, UploadMode};
use depot_progress::ProgressHandle;
use depot_storage::MultipartUpload;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use time::OffsetDateTime;

/// Mutable state of one upload session.
///
/// Single-writer discipline: the task handling a session's chunk stream
/// is the sole writer; the slot mutex makes any other access (sweeper,
/// abort) see consistent state.
pub struct UploadSessionState {
    pub id: SessionId,
    pub coordinate: ArtifactCoordinate,
    pub declared_size: Option<u64>,
    pub content_type: Option<String>,
    /// Digest pinned at initiation, checked at commit alongside any
    /// digest supplied with the commit call.
    pub expected_digest: Option<ContentDigest>,
    pub mode: UploadMode,
    pub state: SessionState,
    /// Next acceptable sequence number (starts at 1).
    pub next_sequence: u64,
    pub bytes_received: u64,
    pub chunks_accepted: u64,
    /// Whether a chunk with `is_final` has been seen.
    pub final_seen: bool,
    /// Accumulated bytes: the whole artifact in direct mode, the
    /// pending part in multipart mode.
    pub buffer: Vec<u8>,
    /// Rolling digest over all accepted payload bytes. Taken at commit
    /// time.
    pub digester: Option<Digester>,
    /// Adapter-side multipart upload handle, owned by this session.
    pub multipart: Option<Box<dyn MultipartUpload>>,
    pub parts: Vec<PartRecord>,
    pub started_at: OffsetDateTime,
    pub last_activity_at: OffsetDateTime,
    pub progress: ProgressHandle,
}

impl UploadSessionState {
    /// Bytes currently held in memory for this session.
    pub fn buffered_bytes(&self) -> u64 {
        self.buffer.len() as u64
    }
}

impl std::fmt::Debug for UploadSessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSessionState")
            .field("id", &self.id)
            .field("coordinate", &self.coordinate)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("bytes_received", &self.bytes_received)
            .field("chunks_accepted", &self.chunks_accepted)
            .finish_non_exhaustive()
    }
}

/// One session slot; the mutex serializes the single writer against
/// abort and sweeper access.
pub struct SessionSlot {
    pub state: tokio::sync::Mutex<UploadSessionState>,
}

impl std::fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSlot").finish_non_exhaustive()
    }
}

/// Thread-safe map of in-flight upload sessions with aggregate byte
/// accounting.
pub struct SessionStore {
    slots: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    /// Aggregate buffered bytes across all sessions.
    total_buffered: AtomicU64,
    max_sessions: usize,
    max_total_buffer_bytes: u64,
}

impl SessionStore {
    pub fn new(max_sessions: usize, max_total_buffer_bytes: u64) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            total_buffered: AtomicU64::new(0),
            max_sessions,
            max_total_buffer_bytes,
        }
    }

    /// Register a new session. Rejects with ResourceExhausted when the
    /// session count or the aggregate byte budget is spent, so existing
    /// sessions never degrade. The rejected state is handed back so the
    /// caller can close its progress record and adapter handles.
    #[allow(clippy::result_large_err)]
    pub fn insert(
        &self,
        state: UploadSessionState,
    ) -> Result<Arc<SessionSlot>, (ServiceError, UploadSessionState)> {
        let mut slots = self.slots.write().unwrap();
        if slots.len() >= self.max_sessions {
            return Err((
                ServiceError::ResourceExhausted(format!(
                    "too many open upload sessions ({})",
                    self.max_sessions
                )),
                state,
            ));
        }
        if self.total_buffered.load(Ordering::Relaxed) >= self.max_total_buffer_bytes {
            return Err((
                ServiceError::ResourceExhausted(
                    "aggregate upload buffer budget exhausted".to_string(),
                ),
                state,
            ));
        }

        let id = state.id;
        let slot = Arc::new(SessionSlot {
            state: tokio::sync::Mutex::new(state),
        });
        slots.insert(id, slot.clone());
        Ok(slot)
    }

    /// Look up a session slot.
    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionSlot>> {
        self.slots.read().unwrap().get(id).cloned()
    }

    /// Remove a session slot.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<SessionSlot>> {
        self.slots.write().unwrap().remove(id)
    }

    /// Number of tracked sessions (terminal ones pending removal
    /// included).
    pub fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.read().unwrap().is_empty()
    }

    /// Account buffered bytes added to a session.
    pub fn add_buffered(&self, bytes: u64) {
        self.total_buffered.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account buffered bytes released by a session.
    pub fn release_buffered(&self, bytes: u64) {
        self.total_buffered.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Current aggregate buffered byte count.
    pub fn buffered_total(&self) -> u64 {
        self.total_buffered.load(Ordering::Relaxed)
    }

    /// Sessions whose last activity is older than `idle_cutoff` and
    /// that are still open. Candidates for the idle sweeper.
    pub fn idle_candidates(&self, idle_cutoff: OffsetDateTime) -> Vec<(SessionId, Arc<SessionSlot>)> {
        let slots = self.slots.read().unwrap();
        let mut candidates = Vec::new();
        for (id, slot) in slots.iter() {
            // Skip slots currently held by a writer; they are active by
            // definition and will be rechecked next sweep.
            if let Ok(state) = slot.state.try_lock()
                && state.state == SessionState::Open
                && state.last_activity_at < idle_cutoff
            {
                candidates.push((*id, slot.clone()));
            }
        }
        candidates
    }
}
