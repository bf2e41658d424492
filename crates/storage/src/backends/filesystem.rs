//! Local filesystem storage backend.
//!
//! Object bytes live under `<root>/objects/<key>`; a JSON sidecar under
//! `<root>/meta/<key>` records content type, etag, and user metadata.
//! Writes go through a temp file and a rename so a partially written
//! object is never observable.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteRange, ByteStream, ListPage, MultipartUpload, ObjectEntry, ObjectMeta, ObjectReader,
    ObjectStore, PartEtag, PutResult, SignedUrl, UserMetadata,
};
use async_trait::async_trait;
use bytes::Bytes;
use depot_core::digest::{ContentDigest, Digester};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Minimum part size for filesystem multipart uploads (4 MiB). The
/// filesystem has no hard requirement; this keeps part flushing behavior
/// comparable to remote backends.
const MIN_PART_SIZE: usize = 4 * 1024 * 1024;

/// Sidecar metadata stored next to each object.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    etag: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    user: HashMap<String, String>,
}

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let backend = Self { root };
        backend.ensure_container().await?;
        Ok(backend)
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Validate a key and resolve it under a subroot.
    ///
    /// Rejects absolute keys, traversal sequences, and any non-normal
    /// path component so a key can never escape the storage root.
    fn resolve(&self, base: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "contains unsafe path component: {key}"
                    )));
                }
            }
        }
        Ok(base.join(key))
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        self.resolve(&self.objects_dir(), key)
    }

    fn meta_path(&self, key: &str) -> StorageResult<PathBuf> {
        self.resolve(&self.meta_dir(), key)
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn read_sidecar(&self, key: &str) -> StorageResult<Option<Sidecar>> {
        let path = self.meta_path(key)?;
        match fs::read(&path).await {
            Ok(data) => {
                let sidecar = serde_json::from_slice(&data).map_err(|e| {
                    StorageError::Backend(Box::new(std::io::Error::other(format!(
                        "corrupt sidecar for {key}: {e}"
                    ))))
                })?;
                Ok(Some(sidecar))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn write_sidecar(&self, key: &str, sidecar: &Sidecar) -> StorageResult<()> {
        let path = self.meta_path(key)?;
        Self::ensure_parent(&path).await?;
        let data = serde_json::to_vec(sidecar)
            .map_err(|e| StorageError::Backend(Box::new(e)))?;
        fs::write(&path, data).await?;
        Ok(())
    }

    /// Move a fully written temp file into place and record its sidecar.
    async fn promote(
        &self,
        temp: &Path,
        key: &str,
        etag: String,
        content_type: Option<&str>,
        user: HashMap<String, String>,
    ) -> StorageResult<PutResult> {
        let final_path = self.object_path(key)?;
        Self::ensure_parent(&final_path).await?;
        fs::rename(temp, &final_path).await?;

        let sidecar = Sidecar {
            etag: etag.clone(),
            content_type: content_type.map(|s| s.to_string()),
            user,
        };
        if let Err(e) = self.write_sidecar(key, &sidecar).await {
            // Keep the invariant that a stored object always has its
            // sidecar: roll the object back on sidecar failure.
            let _ = fs::remove_file(&final_path).await;
            return Err(e);
        }

        Ok(PutResult {
            location: format!("file://{}", final_path.display()),
            etag,
        })
    }

    /// Collect all object keys, sorted lexicographically.
    async fn collect_keys(&self) -> StorageResult<Vec<String>> {
        let objects_root = self.objects_dir();
        let mut keys = Vec::new();
        let mut stack = vec![objects_root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    let relative = path
                        .strip_prefix(&objects_root)
                        .map_err(|e| StorageError::Backend(Box::new(e)))?;
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self, reader, metadata), fields(backend = "filesystem"))]
    async fn put_stream(
        &self,
        key: &str,
        mut reader: ByteStream,
        content_type: Option<&str>,
        metadata: &UserMetadata,
    ) -> StorageResult<PutResult> {
        // Validate the key before any I/O.
        self.object_path(key)?;

        let temp = self.tmp_dir().join(Uuid::new_v4().to_string());
        Self::ensure_parent(&temp).await?;
        let mut file = fs::File::create(&temp).await?;
        let mut digester = Digester::new();

        while let Some(chunk) = reader.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&temp).await;
                    return Err(e);
                }
            };
            digester.absorb(&chunk);
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = fs::remove_file(&temp).await;
                return Err(StorageError::Io(e));
            }
        }
        file.flush().await?;
        drop(file);

        let etag = digester.finish().to_hex();
        self.promote(&temp, key, etag, content_type, metadata.clone())
            .await
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> StorageResult<ObjectReader> {
        let path = self.object_path(key)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let object_size = file.metadata().await?.len();
        let (read_len, start) = match range {
            Some(range) => {
                range.check_within(object_size)?;
                (range.len(), range.start)
            }
            None => (object_size, 0),
        };

        if start > 0 {
            file.seek(std::io::SeekFrom::Start(start)).await?;
        }

        let content_type = self
            .read_sidecar(key)
            .await?
            .and_then(|sidecar| sidecar.content_type);

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut remaining = read_len;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            while remaining > 0 {
                let want = remaining.min(STREAM_CHUNK_SIZE as u64) as usize;
                let n = file.read(&mut buf[..want]).await?;
                if n == 0 {
                    break;
                }
                remaining -= n as u64;
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(ObjectReader {
            stream: Box::pin(stream),
            size: read_len,
            content_type,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.object_path(key)?;
        let metadata = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;

        let sidecar = self.read_sidecar(key).await?;
        Ok(ObjectMeta {
            size: metadata.len(),
            content_type: sidecar.as_ref().and_then(|s| s.content_type.clone()),
            updated_at: metadata.modified().ok().map(|t| t.into()),
            etag: sidecar.map(|s| s.etag),
        })
    }

    async fn signed_url(&self, _key: &str, _ttl: Duration) -> StorageResult<SignedUrl> {
        Err(StorageError::Unsupported(
            "filesystem backend cannot produce presigned URLs",
        ))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> StorageResult<ListPage> {
        let limit = limit.max(1);
        let keys = self.collect_keys().await?;

        let mut entries: Vec<ObjectEntry> = Vec::new();
        let mut next_cursor = None;
        for key in keys
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| cursor.is_none_or(|c| k.as_str() > c))
        {
            if entries.len() == limit {
                next_cursor = entries.last().map(|entry| entry.key.clone());
                break;
            }
            let meta = self.head(&key).await?;
            entries.push(ObjectEntry {
                key,
                size: meta.size,
                updated_at: meta.updated_at,
            });
        }

        Ok(ListPage {
            entries,
            next_cursor,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                if let Ok(meta_path) = self.meta_path(key) {
                    let _ = fs::remove_file(&meta_path).await;
                }
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn ensure_container(&self) -> StorageResult<()> {
        fs::create_dir_all(self.objects_dir()).await?;
        fs::create_dir_all(self.meta_dir()).await?;
        fs::create_dir_all(self.tmp_dir()).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health(&self) -> StorageResult<()> {
        let marker = self.tmp_dir().join(".depot-health");
        fs::write(&marker, b"health").await?;
        fs::remove_file(&marker).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn begin_multipart(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<Box<dyn MultipartUpload>> {
        // Validate the key up front so abort paths never race a bad key.
        self.object_path(key)?;

        let staging = self.tmp_dir().join(format!("mp-{}", Uuid::new_v4()));
        fs::create_dir_all(&staging).await?;

        Ok(Box::new(FilesystemMultipart {
            backend_root: self.root.clone(),
            key: key.to_string(),
            content_type: content_type.map(|s| s.to_string()),
            staging,
            parts: Vec::new(),
            next_part: 1,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

/// Multipart upload staged as numbered part files, concatenated on
/// completion.
struct FilesystemMultipart {
    backend_root: PathBuf,
    key: String,
    content_type: Option<String>,
    staging: PathBuf,
    parts: Vec<(u32, PathBuf, u64)>,
    next_part: u32,
}

#[async_trait]
impl MultipartUpload for FilesystemMultipart {
    fn min_part_size(&self) -> usize {
        MIN_PART_SIZE
    }

    async fn upload_part(&mut self, data: Bytes) -> StorageResult<PartEtag> {
        let part_index = self.next_part;
        let path = self.staging.join(format!("part-{part_index:06}"));
        fs::write(&path, &data).await?;

        let etag = ContentDigest::of(&data).to_hex();
        self.parts.push((part_index, path, data.len() as u64));
        self.next_part += 1;

        Ok(PartEtag { part_index, etag })
    }

    async fn complete(self: Box<Self>) -> StorageResult<PutResult> {
        let backend = FilesystemBackend {
            root: self.backend_root.clone(),
        };

        let temp = backend.tmp_dir().join(Uuid::new_v4().to_string());
        let mut out = fs::File::create(&temp).await?;
        let mut digester = Digester::new();

        for (_, path, _) in &self.parts {
            let data = fs::read(path).await?;
            digester.absorb(&data);
            out.write_all(&data).await?;
        }
        out.flush().await?;
        drop(out);

        let etag = digester.finish().to_hex();
        let result = backend
            .promote(
                &temp,
                &self.key,
                etag,
                self.content_type.as_deref(),
                HashMap::new(),
            )
            .await;

        let _ = fs::remove_dir_all(&self.staging).await;
        result
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        fs::remove_dir_all(&self.staging).await?;
        Ok(())
    }
}
