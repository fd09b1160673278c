//! Media storage collaborators.
//!
//! The engine only ever sees `MediaRef`s; a store resolves them to bytes and
//! turns new bytes into refs. Keys are content-addressed (`sha256` of the
//! payload plus an extension derived from the content type), so uploading the
//! same media twice yields the same ref. Stage outputs are written through a
//! [`ScopedWriter`], which prefixes keys with the owning job so discarding one
//! job's blob can never touch another job's.

use async_trait::async_trait;
use parking_lot::RwLock;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use sha2::{Digest, Sha256};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::media::MediaRef;

#[async_trait]
pub trait MediaStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolve a reference to its bytes.
    async fn get(&self, media: &MediaRef) -> Result<Vec<u8>, StorageError>;

    /// Store bytes under an explicit key.
    async fn put_at(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<MediaRef, StorageError>;

    /// Store bytes under their content-addressed key.
    async fn put(&self, data: &[u8], content_type: &str) -> Result<MediaRef, StorageError> {
        self.put_at(&content_key(data, content_type), data, content_type)
            .await
    }

    async fn exists(&self, media: &MediaRef) -> Result<bool, StorageError>;

    async fn delete(&self, media: &MediaRef) -> Result<(), StorageError>;
}

/// Content-addressed key for a payload.
pub fn content_key(data: &[u8], content_type: &str) -> String {
    format!("{:x}.{}", Sha256::digest(data), extension_for(content_type))
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "application/json" => "json",
        _ => "bin",
    }
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }
}

#[async_trait]
impl MediaStore for R2Client {
    fn name(&self) -> &'static str {
        "r2"
    }

    async fn get(&self, media: &MediaRef) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(media.as_str()).await?;
        match response.status_code() {
            200..=299 => Ok(response.to_vec()),
            404 => Err(StorageError::NotFound(media.clone())),
            code => Err(StorageError::Unexpected(format!(
                "GET {} returned status {}",
                media, code
            ))),
        }
    }

    async fn put_at(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<MediaRef, StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        if !(200..300).contains(&response.status_code()) {
            return Err(StorageError::Unexpected(format!(
                "PUT {} returned status {}",
                key,
                response.status_code()
            )));
        }
        Ok(MediaRef::new(key))
    }

    async fn exists(&self, media: &MediaRef) -> Result<bool, StorageError> {
        match self.bucket.head_object(media.as_str()).await {
            Ok((_, code)) => Ok((200..300).contains(&code)),
            Err(s3::error::S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, media: &MediaRef) -> Result<(), StorageError> {
        self.bucket.delete_object(media.as_str()).await?;
        Ok(())
    }
}

/// Content-addressed store rooted in a local directory.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Map a ref to a path under the root, refusing anything that escapes it.
    fn path_for(&self, media: &MediaRef) -> Result<PathBuf, StorageError> {
        let relative = Path::new(media.as_str());
        let safe = !media.as_str().is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidRef(media.clone()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl MediaStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, media: &MediaRef) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(media)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(media.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put_at(
        &self,
        key: &str,
        data: &[u8],
        _content_type: &str,
    ) -> Result<MediaRef, StorageError> {
        let media = MediaRef::new(key);
        let path = self.path_for(&media)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never observe a partial blob.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(media)
    }

    async fn exists(&self, media: &MediaRef) -> Result<bool, StorageError> {
        let path = self.path_for(media)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, media: &MediaRef) -> Result<(), StorageError> {
        let path = self.path_for(media)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store, used by the one-shot runner and tests.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob under an explicit key.
    pub fn insert(&self, key: impl Into<String>, data: Vec<u8>) -> MediaRef {
        let key = key.into();
        self.blobs.write().insert(key.clone(), data);
        MediaRef::new(key)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Number of blobs whose key starts with `prefix`.
    pub fn count_prefixed(&self, prefix: &str) -> usize {
        self.blobs
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl MediaStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, media: &MediaRef) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .read()
            .get(media.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound(media.clone()))
    }

    async fn put_at(
        &self,
        key: &str,
        data: &[u8],
        _content_type: &str,
    ) -> Result<MediaRef, StorageError> {
        Ok(self.insert(key, data.to_vec()))
    }

    async fn exists(&self, media: &MediaRef) -> Result<bool, StorageError> {
        Ok(self.blobs.read().contains_key(media.as_str()))
    }

    async fn delete(&self, media: &MediaRef) -> Result<(), StorageError> {
        self.blobs.write().remove(media.as_str());
        Ok(())
    }
}

/// Writes one job's stage outputs under `jobs/{job_id}/` and remembers every
/// key it handed to the store, so an abandoned attempt can be rolled back.
pub struct ScopedWriter {
    store: Arc<dyn MediaStore>,
    scope: String,
    written: Mutex<Vec<MediaRef>>,
}

impl ScopedWriter {
    pub fn new(store: Arc<dyn MediaStore>, scope: impl Into<String>) -> Self {
        Self {
            store,
            scope: scope.into(),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn for_job(store: Arc<dyn MediaStore>, job_id: Uuid) -> Self {
        Self::new(store, job_prefix(job_id))
    }

    pub async fn put(&self, data: &[u8], content_type: &str) -> Result<MediaRef, StorageError> {
        let key = format!("{}{}", self.scope, content_key(data, content_type));
        // Recorded before the write so an interrupted put is still discarded.
        self.written.lock().push(MediaRef::new(key.as_str()));
        self.store.put_at(&key, data, content_type).await
    }

    pub fn written(&self) -> Vec<MediaRef> {
        self.written.lock().clone()
    }

    /// Delete everything this writer stored. Missing blobs are ignored.
    pub async fn discard(&self) {
        let written = std::mem::take(&mut *self.written.lock());
        for media in written {
            if let Err(e) = self.store.delete(&media).await {
                tracing::warn!(media = %media, error = %e, "Failed to discard uncommitted blob");
            }
        }
    }
}

/// Key prefix under which a job's outputs are stored.
pub fn job_prefix(job_id: Uuid) -> String {
    format!("jobs/{}/", job_id)
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Media not found: {0}")]
    NotFound(MediaRef),

    #[error("Invalid media reference: {0}")]
    InvalidRef(MediaRef),

    #[error("Unexpected storage response: {0}")]
    Unexpected(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
