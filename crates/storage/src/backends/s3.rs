//! S3-compatible storage backend using the AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteRange, ByteStream, ListPage, MultipartUpload, ObjectEntry, ObjectMeta, ObjectReader,
    ObjectStore, PartEtag, PutResult, SignedUrl, UserMetadata, clamp_ttl,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Minimum part size for S3 multipart uploads (5 MiB). S3 requires all
/// parts except the last to be at least this large.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Marker included in lazy-credentials initialization errors so they map
/// to actionable config errors instead of generic transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "depot-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "depot-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed
/// request, avoiding constructor-time side effects in environments
/// without trust roots.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn build_chain(
        &self,
    ) -> Result<aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        let region = aws_config::Region::new(self.region.clone());

        tokio::task::spawn(async move {
            aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await
        })
        .await
        .map_err(|join_err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
            ))
        })
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_try_init(|| async { self.build_chain().await })
            .await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

/// Classify an SDK error into the stable taxonomy: 404 is NotFound,
/// 401/403 PermissionDenied, 429 and 5xx Transient, credential
/// bootstrap problems Config.
fn classify_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure credentials explicitly or ensure ambient AWS credentials are available."
                .to_string(),
        );
    }

    match &err {
        aws_sdk_s3::error::SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            match status {
                404 => StorageError::NotFound(key.to_string()),
                401 | 403 => StorageError::PermissionDenied(format!("{key}: {err_text}")),
                429 | 500 | 502 | 503 | 504 => StorageError::Transient(err_text),
                _ => StorageError::Backend(Box::new(err)),
            }
        }
        aws_sdk_s3::error::SdkError::TimeoutError(_)
        | aws_sdk_s3::error::SdkError::DispatchFailure(_) => StorageError::Transient(err_text),
        _ => StorageError::Backend(Box::new(err)),
    }
}

/// S3-compatible object store.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: String,
    region: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// `force_path_style` selects path-style URLs (`endpoint/bucket/key`),
    /// required for MinIO and some S3-compatible services; AWS S3 itself
    /// wants virtual-hosted style (false).
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "depot-config");
            config_builder = config_builder.credentials_provider(credentials);
        } else {
            config_builder = config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region.clone()));
        }

        // Handle bare host:port endpoints (e.g. "minio:9000").
        let normalized_endpoint = endpoint.as_ref().map(|endpoint_url| {
            let lower = endpoint_url.to_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint_url.clone()
            } else {
                format!("http://{}", endpoint_url)
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);

            // Explicit HTTP endpoints (local MinIO) get an HTTP-only
            // client so SDK init does not depend on native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                config_builder =
                    config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            config_builder = config_builder.force_path_style(true);
        }

        let client = Client::from_conf(config_builder.build());

        let stored_endpoint = match &normalized_endpoint {
            Some(url) => url.clone(),
            None => format!("s3.{}.amazonaws.com", resolved_region),
        };
        let normalized_prefix = prefix.map(|p| p.trim_end_matches('/').to_string());

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalized_prefix,
            endpoint: stored_endpoint,
            region: resolved_region,
        })
    }

    /// Full object key with the configured prefix applied.
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Strip the configured prefix from a listed key.
    fn strip_prefix(&self, full_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => {
                let prefix_with_slash = format!("{}/", prefix);
                full_key
                    .strip_prefix(&prefix_with_slash)
                    .unwrap_or(full_key)
                    .to_string()
            }
            None => full_key.to_string(),
        }
    }

    fn location(&self, full_key: &str) -> String {
        format!("s3://{}/{}", self.bucket, full_key)
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self, reader, metadata), fields(backend = "s3"))]
    async fn put_stream(
        &self,
        key: &str,
        mut reader: ByteStream,
        content_type: Option<&str>,
        metadata: &UserMetadata,
    ) -> StorageResult<PutResult> {
        // S3 PutObject needs a known length, so a single-shot put
        // buffers the stream. Large artifacts go through multipart and
        // never take this path.
        let mut buf = Vec::new();
        while let Some(chunk) = reader.next().await {
            buf.extend_from_slice(&chunk?);
        }

        let full_key = self.full_key(key);
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(Bytes::from(buf).into());

        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }
        for (name, value) in metadata {
            request = request.metadata(name, value);
        }

        let output = request
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        Ok(PutResult {
            location: self.location(&full_key),
            etag: output.e_tag().unwrap_or_default().trim_matches('"').to_string(),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_stream(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> StorageResult<ObjectReader> {
        let full_key = self.full_key(key);
        let mut request = self.client.get_object().bucket(&self.bucket).key(&full_key);

        if let Some(range) = range {
            if range.is_empty() {
                return Ok(ObjectReader {
                    stream: Box::pin(futures::stream::empty()),
                    size: 0,
                    content_type: None,
                });
            }
            // S3 Range headers use inclusive ends.
            request = request.range(format!("bytes={}-{}", range.start, range.end - 1));
        }

        let output = request
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        let size = output.content_length().unwrap_or(0) as u64;
        let content_type = output.content_type().map(|s| s.to_string());

        let async_read = output.body.into_async_read();
        let stream = ReaderStream::new(async_read).map(|result| result.map_err(StorageError::Io));

        Ok(ObjectReader {
            stream: Box::pin(stream),
            size,
            content_type,
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        let updated_at = output.last_modified().and_then(|dt| {
            time::OffsetDateTime::from_unix_timestamp(dt.secs())
                .inspect_err(|e| {
                    tracing::warn!(key = %key, timestamp = dt.secs(), error = %e,
                        "failed to convert S3 timestamp");
                })
                .ok()
        });

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0) as u64,
            content_type: output.content_type().map(|s| s.to_string()),
            updated_at,
            etag: output
                .e_tag()
                .map(|s| s.trim_matches('"').to_string()),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn signed_url(&self, key: &str, ttl: Duration) -> StorageResult<SignedUrl> {
        let ttl = clamp_ttl(ttl);
        let full_key = self.full_key(key);

        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Config(format!("invalid presign TTL: {e}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .presigned(presigning)
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        Ok(SignedUrl {
            url: presigned.uri().to_string(),
            expires_at: time::OffsetDateTime::now_utc() + ttl,
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StorageResult<ListPage> {
        let full_prefix = self.full_key(prefix);
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .max_keys(limit.max(1) as i32);

        if let Some(cursor) = cursor {
            request = request.start_after(self.full_key(cursor));
        }

        let output = request
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, prefix))?;

        let mut entries = Vec::new();
        for obj in output.contents() {
            if let Some(obj_key) = obj.key() {
                entries.push(ObjectEntry {
                    key: self.strip_prefix(obj_key),
                    size: obj.size().unwrap_or(0) as u64,
                    updated_at: obj.last_modified().and_then(|dt| {
                        time::OffsetDateTime::from_unix_timestamp(dt.secs()).ok()
                    }),
                });
            }
        }

        let next_cursor = if output.is_truncated() == Some(true) {
            entries.last().map(|entry| entry.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            entries,
            next_cursor,
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<bool> {
        // S3 delete_object does not fail on missing keys, so probe first
        // to report presence accurately.
        let full_key = self.full_key(key);
        let existed = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => true,
            Err(err) => match classify_sdk_error(err, key) {
                StorageError::NotFound(_) => false,
                other => return Err(other),
            },
        };

        if !existed {
            return Ok(false);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        Ok(true)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn ensure_container(&self) -> StorageResult<()> {
        match self
            .client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                // Owning the bucket already satisfies the contract.
                if let aws_sdk_s3::error::SdkError::ServiceError(service_err) = &err {
                    let inner = service_err.err();
                    if inner.is_bucket_already_owned_by_you() || inner.is_bucket_already_exists() {
                        return Ok(());
                    }
                }
                Err(classify_sdk_error(err, &self.bucket))
            }
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let marker_key = self.full_key(".depot-health-check");
        let probe = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(|e| classify_sdk_error(e, ".depot-health-check"))?;

            if let Err(err) = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .send()
                .await
            {
                match classify_sdk_error(err, ".depot-health-check") {
                    StorageError::NotFound(_) => {}
                    other => return Err(other),
                }
            }
            Ok(())
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe)
            .await
            .map_err(|_| StorageError::Transient("S3 health check timed out".to_string()))?
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn begin_multipart(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<Box<dyn MultipartUpload>> {
        let full_key = self.full_key(key);
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key);

        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }

        let output = request
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        Ok(Box::new(S3Multipart {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            location: self.location(&full_key),
            key: full_key,
            upload_id,
            parts: Vec::new(),
            next_part: 1,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

/// Native S3 multipart upload.
struct S3Multipart {
    client: Client,
    bucket: String,
    key: String,
    location: String,
    upload_id: String,
    parts: Vec<aws_sdk_s3::types::CompletedPart>,
    next_part: i32,
}

#[async_trait]
impl MultipartUpload for S3Multipart {
    fn min_part_size(&self) -> usize {
        MIN_PART_SIZE
    }

    async fn upload_part(&mut self, data: Bytes) -> StorageResult<PartEtag> {
        let part_number = self.next_part;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, &self.key))?;

        let etag = output.e_tag().unwrap_or_default().trim_matches('"').to_string();
        self.parts.push(
            aws_sdk_s3::types::CompletedPart::builder()
                .e_tag(&etag)
                .part_number(part_number)
                .build(),
        );
        self.next_part += 1;

        Ok(PartEtag {
            part_index: part_number as u32,
            etag,
        })
    }

    async fn complete(self: Box<Self>) -> StorageResult<PutResult> {
        // S3 multipart requires at least one part; an empty upload
        // becomes an abort plus a plain zero-byte put.
        if self.parts.is_empty() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&self.upload_id)
                .send()
                .await
            {
                tracing::warn!(key = %self.key, error = %e,
                    "failed to abort empty multipart upload, orphaned parts may remain");
            }

            let output = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(Bytes::new().into())
                .send()
                .await
                .map_err(|e| classify_sdk_error(e, &self.key))?;

            return Ok(PutResult {
                location: self.location,
                etag: output.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            });
        }

        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(self.parts.clone()))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, &self.key))?;

        Ok(PutResult {
            location: self.location,
            etag: output
                .e_tag()
                .unwrap_or_default()
                .trim_matches('"')
                .to_string(),
        })
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, &self.key))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_backend(prefix: Option<String>) -> S3Backend {
        S3Backend::new(
            "test-bucket",
            Some("s3.test".to_string()),
            Some("us-east-1".to_string()),
            prefix,
            Some("access".to_string()),
            Some("secret".to_string()),
            true,
        )
        .await
        .expect("backend should construct for unit tests")
    }

    #[tokio::test]
    async fn full_key_and_strip_prefix() {
        let backend = make_backend(Some("prefix".to_string())).await;
        assert_eq!(backend.full_key("path/file"), "prefix/path/file");
        assert_eq!(backend.strip_prefix("prefix/path/file"), "path/file");
        assert_eq!(backend.strip_prefix("other/path"), "other/path");

        let backend = make_backend(None).await;
        assert_eq!(backend.full_key("path/file"), "path/file");
        assert_eq!(backend.strip_prefix("path/file"), "path/file");
    }

    #[tokio::test]
    async fn new_requires_complete_credentials() {
        let err = S3Backend::new(
            "bucket",
            None,
            Some("us-east-1".to_string()),
            None,
            Some("access".to_string()),
            None,
            false,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn new_normalizes_endpoint() {
        let backend = S3Backend::new(
            "bucket",
            Some("minio:9000".to_string()),
            Some("us-east-1".to_string()),
            Some("prefix/".to_string()),
            None,
            None,
            true,
        )
        .await
        .unwrap();

        assert_eq!(backend.endpoint, "http://minio:9000");
        assert_eq!(backend.prefix.as_deref(), Some("prefix"));
    }

    #[tokio::test]
    async fn location_is_bucket_scoped() {
        let backend = make_backend(None).await;
        assert_eq!(backend.location("a/b"), "s3://test-bucket/a/b");
    }
}
