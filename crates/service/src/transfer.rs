//! Upload state machine and catalog pass-through.

use crate::error::{ServiceError, ServiceResult};
use crate::sessions::{SessionStore, UploadSessionState};
use depot_core::config::ServerConfig;
use depot_core::session::{
    CommitRequest, CommitResponse, InitiateRequest, InitiateResponse, PartRecord, UploadSummary,
};
use depot_core::{
    ArtifactCoordinate, ChunkMessage, ContentDigest, Digester, SessionId, SessionState, UploadMode,
};
use depot_progress::ProgressRegistry;
use depot_storage::{ListPage, ObjectMeta, ObjectStore, PutResult, SignedUrl, UserMetadata, key};
use futures::stream;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Tolerance above a declared size before chunks are rejected.
const DECLARED_SIZE_SLACK: u64 = 64 * 1024;

/// Implements the upload and download state machines on top of the
/// object store adapter, the session store, and the progress registry.
pub struct TransferService {
    pub(crate) storage: Arc<dyn ObjectStore>,
    pub(crate) progress: Arc<ProgressRegistry>,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) config: ServerConfig,
    /// How long terminal sessions linger before removal, so late calls
    /// get a precise state error instead of NotFound.
    session_linger: Duration,
}

impl TransferService {
    /// Create a new transfer service.
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        progress: Arc<ProgressRegistry>,
        config: ServerConfig,
        session_linger: Duration,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionStore::new(
            config.max_sessions,
            config.max_total_buffer_bytes,
        ));
        Arc::new(Self {
            storage,
            progress,
            sessions,
            config,
            session_linger,
        })
    }

    /// The progress registry this service publishes to.
    pub fn progress(&self) -> &Arc<ProgressRegistry> {
        &self.progress
    }

    /// Number of tracked upload sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Initiate an upload session.
    #[tracing::instrument(skip(self, request), fields(coordinate = %request.coordinate))]
    pub async fn initiate(&self, request: InitiateRequest) -> ServiceResult<InitiateResponse> {
        request.coordinate.validate()?;
        let expected_digest = request
            .expected_digest
            .as_deref()
            .map(ContentDigest::from_hex)
            .transpose()?;

        let mode = UploadMode::select(
            request.declared_size,
            self.config.multipart_threshold_bytes,
        );
        let id = SessionId::new();
        let object_key = key::object_key(&request.coordinate);

        let multipart = match mode {
            UploadMode::Multipart => Some(
                self.storage
                    .begin_multipart(&object_key, request.content_type.as_deref())
                    .await?,
            ),
            UploadMode::Direct => None,
        };

        let progress = self
            .progress
            .open(id.into(), request.declared_size.unwrap_or(0));

        let now = OffsetDateTime::now_utc();
        let state = UploadSessionState {
            id,
            coordinate: request.coordinate,
            declared_size: request.declared_size,
            content_type: request.content_type,
            expected_digest,
            mode,
            state: SessionState::Open,
            next_sequence: 1,
            bytes_received: 0,
            chunks_accepted: 0,
            final_seen: false,
            buffer: Vec::new(),
            digester: Some(Digester::new()),
            multipart: None,
            parts: Vec::new(),
            started_at: now,
            last_activity_at: now,
            progress,
        };

        let slot = match self.sessions.insert(state) {
            Ok(slot) => slot,
            Err((err, rejected)) => {
                // Release adapter-side state and close the progress
                // record before surfacing the reject.
                rejected.progress.fail(err.label());
                if let Some(mp) = multipart
                    && let Err(abort_err) = mp.abort().await
                {
                    tracing::warn!(session_id = %id, error = %abort_err,
                        "failed to abort multipart upload for rejected session");
                }
                return Err(err);
            }
        };

        // Attach the adapter handle under the slot lock so the ingest
        // path owns it from the first chunk on.
        slot.state.lock().await.multipart = multipart;

        tracing::info!(
            session_id = %id,
            mode = ?mode,
            declared_size = request.declared_size.unwrap_or(0),
            "upload session created"
        );

        Ok(InitiateResponse {
            session_id: id.to_string(),
            recommended_chunk_size: self.config.recommended_chunk_bytes,
            multipart: mode == UploadMode::Multipart,
        })
    }

    /// Ingest one chunk.
    ///
    /// A rejected chunk leaves the session state untouched; the client
    /// may continue with the correct sequence number or abort. Adapter
    /// failures during part flushing terminate the session.
    #[tracing::instrument(skip(self, message), fields(session_id = %message.session_id, sequence = message.sequence))]
    pub async fn ingest_chunk(&self, message: ChunkMessage) -> ServiceResult<()> {
        let slot = self
            .sessions
            .get(&message.session_id)
            .ok_or_else(|| ServiceError::NotFound(format!("session {}", message.session_id)))?;
        let mut state = slot.state.lock().await;

        match state.state {
            SessionState::Open => {}
            SessionState::Committing => {
                return Err(ServiceError::Conflict(
                    "chunk received after commit began".to_string(),
                ));
            }
            other => {
                return Err(ServiceError::Conflict(format!(
                    "session is {other:?}, not open"
                )));
            }
        }

        if message.sequence != state.next_sequence {
            return Err(ServiceError::Invalid(format!(
                "sequence {} out of order, expected {}",
                message.sequence, state.next_sequence
            )));
        }
        if state.final_seen {
            return Err(ServiceError::Invalid(
                "chunk received after final chunk".to_string(),
            ));
        }
        if message.payload.is_empty() && !message.is_final {
            return Err(ServiceError::Invalid(
                "chunk payload must not be empty".to_string(),
            ));
        }
        if message.payload.len() as u64 > self.config.max_chunk_bytes {
            return Err(ServiceError::Invalid(format!(
                "chunk of {} bytes exceeds maximum {}",
                message.payload.len(),
                self.config.max_chunk_bytes
            )));
        }
        // A per-chunk checksum mismatch is a malformed chunk, not a
        // commit-time integrity failure.
        message
            .verify_checksum()
            .map_err(|e| ServiceError::Invalid(e.to_string()))?;

        let incoming = message.payload.len() as u64;
        if let Some(declared) = state.declared_size
            && state.bytes_received + incoming > declared + DECLARED_SIZE_SLACK
        {
            return Err(ServiceError::Invalid(format!(
                "received {} bytes exceeds declared size {declared}",
                state.bytes_received + incoming
            )));
        }
        if state.buffered_bytes() + incoming > self.config.max_session_buffer_bytes {
            return Err(ServiceError::ResourceExhausted(format!(
                "session buffer cap of {} bytes exceeded",
                self.config.max_session_buffer_bytes
            )));
        }

        // Chunk accepted: fold it into the session.
        if let Some(digester) = state.digester.as_mut() {
            digester.absorb(&message.payload);
        }
        state.buffer.extend_from_slice(&message.payload);
        self.sessions.add_buffered(incoming);

        state.bytes_received += incoming;
        state.chunks_accepted += 1;
        state.next_sequence += 1;
        state.final_seen = message.is_final;
        state.last_activity_at = OffsetDateTime::now_utc();

        // Multipart: flush full parts as the buffer fills.
        if state.mode == UploadMode::Multipart
            && let Err(err) = self.flush_full_parts(&mut state).await
        {
            let label = err.label();
            self.finish_failed(&mut state, SessionState::Failed, label)
                .await;
            return Err(err);
        }

        state.progress.advance(incoming, None);
        Ok(())
    }

    /// Flush buffered bytes to the adapter while a full minimum-size
    /// part is available.
    async fn flush_full_parts(&self, state: &mut UploadSessionState) -> ServiceResult<()> {
        let min_part = match state.multipart.as_ref() {
            Some(mp) => mp.min_part_size(),
            None => {
                return Err(ServiceError::Internal(
                    "multipart session without adapter handle".to_string(),
                ));
            }
        };

        while state.buffer.len() >= min_part {
            let part_data: Vec<u8> = state.buffer.drain(..min_part).collect();
            let part_len = part_data.len() as u64;
            // The bytes left the buffer either way; settle the
            // aggregate account before the adapter call can fail.
            self.sessions.release_buffered(part_len);
            let mp = state.multipart.as_mut().expect("checked above");
            let etag = mp.upload_part(part_data.into()).await?;
            state.parts.push(PartRecord {
                part_index: etag.part_index,
                etag: etag.etag,
                byte_count: part_len,
            });
            tracing::debug!(
                session_id = %state.id,
                part_index = state.parts.last().map(|p| p.part_index).unwrap_or(0),
                part_len,
                "multipart part flushed"
            );
        }
        Ok(())
    }

    /// Summary of a session's accepted chunks, for the end of a chunk
    /// stream.
    pub async fn summary(&self, session_id: &SessionId) -> ServiceResult<UploadSummary> {
        let slot = self
            .sessions
            .get(session_id)
            .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))?;
        let state = slot.state.lock().await;
        Ok(UploadSummary {
            session_id: session_id.to_string(),
            chunks_accepted: state.chunks_accepted,
            bytes_received: state.bytes_received,
        })
    }

    /// Commit an upload session: verify the digest, make the object
    /// durable, publish terminal progress.
    #[tracing::instrument(skip(self, request), fields(session_id = %session_id))]
    pub async fn commit(
        &self,
        session_id: SessionId,
        request: CommitRequest,
    ) -> ServiceResult<CommitResponse> {
        // Parse before any state transition so a malformed digest
        // cannot wedge the session in Committing.
        let commit_digest = request.parsed_digest()?;

        let slot = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))?;
        let mut state = slot.state.lock().await;

        match state.state {
            SessionState::Open => {}
            SessionState::Committing => {
                return Err(ServiceError::Conflict("commit already in progress".to_string()));
            }
            other => {
                return Err(ServiceError::Conflict(format!(
                    "session is {other:?}, not open"
                )));
            }
        }
        state.state = SessionState::Committing;

        let actual = match state.digester.take() {
            Some(digester) => digester.finish(),
            None => {
                let err = ServiceError::Internal("session digest already consumed".to_string());
                self.finish_failed(&mut state, SessionState::Failed, err.label())
                    .await;
                return Err(err);
            }
        };

        // Integrity gate before anything becomes observable.
        for expected in [commit_digest, state.expected_digest].into_iter().flatten() {
            if let Err(mismatch) = actual.check(&expected) {
                let err: ServiceError = mismatch.into();
                tracing::warn!(session_id = %session_id, "commit digest mismatch");
                self.finish_failed(&mut state, SessionState::Failed, err.label())
                    .await;
                return Err(err);
            }
        }

        let result = self.store_object(&mut state, &actual).await;
        match result {
            Ok(put) => {
                state.state = SessionState::Committed;
                state.progress.complete(Some("committed"));
                self.schedule_removal(session_id);
                tracing::info!(
                    session_id = %session_id,
                    bytes = state.bytes_received,
                    etag = %put.etag,
                    "upload committed"
                );
                Ok(CommitResponse {
                    location: put.location,
                    etag: put.etag,
                })
            }
            Err(err) => {
                let label = err.label();
                self.finish_failed(&mut state, SessionState::Failed, label)
                    .await;
                Err(err)
            }
        }
    }

    /// Ship the session's bytes to the adapter.
    async fn store_object(
        &self,
        state: &mut UploadSessionState,
        digest: &ContentDigest,
    ) -> ServiceResult<PutResult> {
        match state.mode {
            UploadMode::Direct => {
                let buffered = std::mem::take(&mut state.buffer);
                let released = buffered.len() as u64;
                let mut metadata = UserMetadata::new();
                metadata.insert("sha256".to_string(), digest.to_hex());

                let object_key = key::object_key(&state.coordinate);
                let body: depot_storage::ByteStream = Box::pin(stream::once(async move {
                    Ok(bytes::Bytes::from(buffered))
                }));

                let result = self
                    .storage
                    .put_stream(
                        &object_key,
                        body,
                        state.content_type.as_deref(),
                        &metadata,
                    )
                    .await;
                self.sessions.release_buffered(released);
                result.map_err(Into::into)
            }
            UploadMode::Multipart => {
                // Residual bytes become the final (undersized) part.
                if !state.buffer.is_empty() {
                    let residual: Vec<u8> = std::mem::take(&mut state.buffer);
                    let residual_len = residual.len() as u64;
                    self.sessions.release_buffered(residual_len);
                    let mp = state.multipart.as_mut().ok_or_else(|| {
                        ServiceError::Internal("multipart session without adapter handle".into())
                    })?;
                    let etag = mp.upload_part(residual.into()).await?;
                    state.parts.push(PartRecord {
                        part_index: etag.part_index,
                        etag: etag.etag,
                        byte_count: residual_len,
                    });
                }

                let mp = state.multipart.take().ok_or_else(|| {
                    ServiceError::Internal("multipart session without adapter handle".into())
                })?;
                mp.complete().await.map_err(Into::into)
            }
        }
    }

    /// Abort an upload session from `Open` or `Committing`.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn abort(&self, session_id: SessionId, reason: Option<String>) -> ServiceResult<()> {
        let slot = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))?;
        let mut state = slot.state.lock().await;

        if state.state.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "session is already {:?}",
                state.state
            )));
        }

        let label = reason.unwrap_or_else(|| "aborted".to_string());
        tracing::info!(session_id = %session_id, reason = %label, "upload session aborted");
        self.finish_failed_with_label(&mut state, SessionState::Aborted, &label)
            .await;
        Ok(())
    }

    /// Terminate a session as failed/aborted: release buffers, abort
    /// adapter multipart state best-effort, publish failure progress,
    /// and schedule removal.
    pub(crate) async fn finish_failed(
        &self,
        state: &mut UploadSessionState,
        final_state: SessionState,
        label: &str,
    ) {
        self.finish_failed_with_label(state, final_state, label).await;
    }

    async fn finish_failed_with_label(
        &self,
        state: &mut UploadSessionState,
        final_state: SessionState,
        label: &str,
    ) {
        let buffered = state.buffered_bytes();
        state.buffer = Vec::new();
        self.sessions.release_buffered(buffered);

        if let Some(mp) = state.multipart.take()
            && let Err(err) = mp.abort().await
        {
            tracing::warn!(
                session_id = %state.id,
                error = %err,
                "failed to abort adapter multipart upload"
            );
        }

        state.state = final_state;
        state.progress.fail(label);
        self.schedule_removal(state.id);
    }

    /// Remove a terminal session after the linger window.
    fn schedule_removal(&self, session_id: SessionId) {
        let sessions = self.sessions.clone();
        let linger = self.session_linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            sessions.remove(&session_id);
        });
    }

    /// Spawn the idle-session sweeper. Cancelled via the token.
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let idle_timeout = service.config.session_idle_timeout();
            let tick = idle_timeout
                .min(Duration::from_secs(60))
                .max(Duration::from_millis(50));
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => service.sweep_idle().await,
                }
            }
        })
    }

    /// Abort sessions with no chunk activity past the idle timeout.
    pub async fn sweep_idle(&self) {
        let idle_timeout = self.config.session_idle_timeout();
        let cutoff = OffsetDateTime::now_utc()
            - time::Duration::try_from(idle_timeout).unwrap_or(time::Duration::minutes(30));

        for (id, slot) in self.sessions.idle_candidates(cutoff) {
            let mut state = slot.state.lock().await;
            // Recheck under the lock: the session may have progressed.
            if state.state != SessionState::Open || state.last_activity_at >= cutoff {
                continue;
            }
            tracing::warn!(session_id = %id, "aborting idle upload session");
            self.finish_failed_with_label(&mut state, SessionState::Aborted, "idle_timeout")
                .await;
        }
    }

    // ----- Catalog pass-through -------------------------------------

    /// Object metadata for a coordinate.
    pub async fn head(&self, coordinate: &ArtifactCoordinate) -> ServiceResult<ObjectMeta> {
        coordinate.validate()?;
        let object_key = key::object_key(coordinate);
        Ok(self.storage.head(&object_key).await?)
    }

    /// Presigned download URL for a coordinate. The bytes bypass the
    /// core, so no progress record is created.
    pub async fn signed_url(
        &self,
        coordinate: &ArtifactCoordinate,
        ttl: Duration,
    ) -> ServiceResult<SignedUrl> {
        coordinate.validate()?;
        let object_key = key::object_key(coordinate);
        Ok(self.storage.signed_url(&object_key, ttl).await?)
    }

    /// List stored artifacts under a prefix.
    pub async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> ServiceResult<ListPage> {
        let full_prefix = key::listing_prefix(prefix);
        Ok(self.storage.list(&full_prefix, cursor, limit).await?)
    }

    /// Delete a stored artifact. Returns false when absent.
    pub async fn delete(&self, coordinate: &ArtifactCoordinate) -> ServiceResult<bool> {
        coordinate.validate()?;
        let object_key = key::object_key(coordinate);
        Ok(self.storage.delete(&object_key).await?)
    }

    /// Storage backend health.
    pub async fn storage_health(&self) -> ServiceResult<()> {
        Ok(self.storage.health().await?)
    }
}
