//! Download state machine.

use crate::error::{ServiceError, ServiceResult};
use crate::transfer::TransferService;
use bytes::Bytes;
use depot_core::{ArtifactCoordinate, OperationId};
use depot_progress::ProgressHandle;
use depot_storage::{ByteRange, key};
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// One frame of a download stream. Frames are strictly ordered by
/// sequence number; the last frame has an empty payload and
/// `is_final: true`.
#[derive(Debug, Clone)]
pub struct DownloadFrame {
    pub sequence: u64,
    pub payload: Bytes,
    /// Total bytes the stream carries (range length for ranged
    /// downloads).
    pub total_size: u64,
    pub is_final: bool,
}

/// An open download: stream metadata plus the ordered frame stream.
pub struct Download {
    pub operation_id: OperationId,
    pub total_size: u64,
    pub content_type: Option<String>,
    pub frames: Pin<Box<dyn Stream<Item = ServiceResult<DownloadFrame>> + Send>>,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("operation_id", &self.operation_id)
            .field("total_size", &self.total_size)
            .field("content_type", &self.content_type)
            .field("frames", &"<stream>")
            .finish()
    }
}

/// Marks the download failed as `cancelled` if the consumer drops the
/// stream before it finishes. A no-op once the record is terminal.
struct CancelGuard {
    handle: ProgressHandle,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.handle.fail("cancelled");
    }
}

impl TransferService {
    /// Open a streaming download, optionally for a byte range.
    ///
    /// The returned frames cover exactly the requested bytes; dropping
    /// the stream releases the adapter read promptly and marks the
    /// progress record failed with `cancelled`.
    #[tracing::instrument(skip(self), fields(coordinate = %coordinate))]
    pub async fn stream_download(
        &self,
        coordinate: &ArtifactCoordinate,
        range: Option<ByteRange>,
    ) -> ServiceResult<Download> {
        coordinate.validate()?;
        let object_key = key::object_key(coordinate);

        let meta = self.storage.head(&object_key).await?;
        if let Some(range) = range {
            range
                .check_within(meta.size)
                .map_err(|e| ServiceError::Invalid(e.to_string()))?;
        }
        let total_size = range.map(|r| r.len()).unwrap_or(meta.size);

        let operation_id = OperationId::new();
        let handle = self.progress.open(operation_id, total_size);

        let reader = match self.storage.get_stream(&object_key, range).await {
            Ok(reader) => reader,
            Err(err) => {
                let err: ServiceError = err.into();
                handle.fail(err.label());
                return Err(err);
            }
        };
        let content_type = reader.content_type.clone().or(meta.content_type);

        tracing::info!(
            operation_id = %operation_id,
            total_size,
            ranged = range.is_some(),
            "download opened"
        );

        let max_frame = (self.config.download_read_chunk_bytes as usize).max(1);
        let mut source = reader.stream;

        let frames = async_stream::stream! {
            let guard = CancelGuard { handle };
            let mut sequence: u64 = 0;

            loop {
                match source.next().await {
                    Some(Ok(chunk)) => {
                        let mut offset = 0;
                        while offset < chunk.len() {
                            let end = (offset + max_frame).min(chunk.len());
                            let payload = chunk.slice(offset..end);
                            offset = end;
                            sequence += 1;
                            guard.handle.advance(payload.len() as u64, None);
                            yield Ok(DownloadFrame {
                                sequence,
                                payload,
                                total_size,
                                is_final: false,
                            });
                        }
                    }
                    Some(Err(err)) => {
                        let err: ServiceError = err.into();
                        guard.handle.fail(err.label());
                        yield Err(err);
                        break;
                    }
                    None => {
                        // Complete before handing out the final frame so
                        // a consumer that stops right after it cannot be
                        // misread as cancelled.
                        sequence += 1;
                        guard.handle.complete(Some("downloaded"));
                        yield Ok(DownloadFrame {
                            sequence,
                            payload: Bytes::new(),
                            total_size,
                            is_final: true,
                        });
                        break;
                    }
                }
            }
        };

        Ok(Download {
            operation_id,
            total_size,
            content_type,
            frames: Box::pin(frames),
        })
    }
}
