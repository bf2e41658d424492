//! Object store trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

/// A boxed stream of bytes for streaming reads and writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// User-supplied metadata stored alongside an object.
pub type UserMetadata = HashMap<String, String>;

/// Maximum presigned URL lifetime (7 days).
pub const MAX_SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A half-open byte interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Build a range, rejecting inverted bounds.
    pub fn new(start: u64, end: u64) -> StorageResult<Self> {
        if end < start {
            return Err(StorageError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Validate the range against an object's size.
    pub fn check_within(&self, object_size: u64) -> StorageResult<()> {
        if self.end > object_size {
            return Err(StorageError::InvalidRange(format!(
                "range [{}, {}) outside object of {} bytes",
                self.start, self.end, object_size
            )));
        }
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Content type, if recorded.
    pub content_type: Option<String>,
    /// Last modification time, if available.
    pub updated_at: Option<time::OffsetDateTime>,
    /// Backend etag, if available.
    pub etag: Option<String>,
}

/// Result of storing an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutResult {
    /// Backend-reported location (URL or path) of the stored object.
    pub location: String,
    /// Backend etag of the stored object.
    pub etag: String,
}

/// An open readable object.
pub struct ObjectReader {
    /// The byte stream; covers only the requested range when one was
    /// given.
    pub stream: ByteStream,
    /// Bytes the stream will yield (range length for ranged reads).
    pub size: u64,
    /// Content type, if recorded.
    pub content_type: Option<String>,
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("stream", &"<stream>")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// One entry in a listing page.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<time::OffsetDateTime>,
}

/// A page of listing results, lexicographic by key.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    /// Opaque cursor for the next page; absent on the last page.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// A presigned read URL.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SignedUrl {
    pub url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: time::OffsetDateTime,
}

/// An etag recorded for one uploaded part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartEtag {
    /// 1-based part index assigned by the upload.
    pub part_index: u32,
    pub etag: String,
}

/// Uniform interface over a remote blob store.
///
/// Implementations classify every failure into the stable error
/// taxonomy via [`StorageError::kind`]; callers must not assume which
/// backend they talk to.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Consume a byte stream and store it atomically. On any error the
    /// partial object must not be observable.
    async fn put_stream(
        &self,
        key: &str,
        reader: ByteStream,
        content_type: Option<&str>,
        metadata: &UserMetadata,
    ) -> StorageResult<PutResult>;

    /// Open a readable byte stream, optionally restricted to a
    /// half-open byte range.
    async fn get_stream(&self, key: &str, range: Option<ByteRange>)
    -> StorageResult<ObjectReader>;

    /// Fetch object metadata. Fails with NotFound if absent.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Produce a presigned read URL. The TTL is clamped to
    /// [`MAX_SIGNED_URL_TTL`].
    async fn signed_url(&self, key: &str, ttl: Duration) -> StorageResult<SignedUrl>;

    /// List objects under a prefix, lexicographic by key.
    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StorageResult<ListPage>;

    /// Delete an object. Returns false when the object was absent;
    /// other failures are errors.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Idempotently create the backing container if missing.
    async fn ensure_container(&self) -> StorageResult<()>;

    /// Verify backend connectivity.
    async fn health(&self) -> StorageResult<()>;

    /// Begin a multipart upload for streaming part flushing.
    async fn begin_multipart(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<Box<dyn MultipartUpload>>;

    /// Static identifier for the backend type, used in logs and metrics.
    fn backend_name(&self) -> &'static str;
}

/// A multipart upload in flight.
///
/// Owned by the upload session that began it; released (completed or
/// aborted) when the session terminates.
#[async_trait]
pub trait MultipartUpload: Send {
    /// Minimum size for all parts except the last.
    fn min_part_size(&self) -> usize;

    /// Upload the next part. Parts are numbered 1-based in call order.
    async fn upload_part(&mut self, data: Bytes) -> StorageResult<PartEtag>;

    /// Complete the upload, making the object observable.
    async fn complete(self: Box<Self>) -> StorageResult<PutResult>;

    /// Abort the upload, releasing server-side state.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Clamp a caller-supplied TTL to the signed URL maximum.
pub(crate) fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_SIGNED_URL_TTL)
}
