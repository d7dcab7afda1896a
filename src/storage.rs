//! Object storage for uploaded files such as item images.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {0} not found")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => ServiceError::NotFound(format!("object {} not found", key)),
            StorageError::InvalidKey(msg) => ServiceError::ValidationError(msg),
            StorageError::Unavailable(msg) => ServiceError::BackendUnavailable(msg),
            StorageError::Io(e) => ServiceError::InternalError(format!("storage I/O error: {}", e)),
        }
    }
}

/// Stores opaque byte blobs and hands back a public URL for each one.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    fn name(&self) -> &str;

    /// Stores `bytes` under `key` and returns the URL clients fetch it from.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StorageError>;

    /// Accepts either a URL returned by [`ObjectStorage::put`] or a bare key.
    async fn delete(&self, url_or_key: &str) -> Result<(), StorageError>;
}

/// Object key for an upload: `{prefix}/{uuid}{.ext}`.
pub fn object_key(prefix: &str, file_name: &str) -> String {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    format!("{}/{}{}", prefix.trim_matches('/'), Uuid::new_v4(), extension)
}

fn check_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Files under a root directory, served at `/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
    url_prefix: String,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, bucket: &str) -> Self {
        Self {
            root: root.into(),
            url_prefix: format!("/{}/", bucket.trim_matches('/')),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_of<'a>(&self, url_or_key: &'a str) -> &'a str {
        url_or_key.strip_prefix(self.url_prefix.as_str()).unwrap_or(url_or_key)
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    fn name(&self) -> &str {
        "local"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StorageError> {
        check_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        debug!(key, content_type, size = bytes.len(), "Stored object");
        Ok(format!("{}{}", self.url_prefix, key))
    }

    async fn delete(&self, url_or_key: &str) -> Result<(), StorageError> {
        let key = self.key_of(url_or_key);
        check_key(key)?;
        match tokio::fs::remove_file(self.root.join(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process storage for development and tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    objects: DashMap<String, (String, Vec<u8>)>,
    fail_deletes: AtomicBool,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, url_or_key: &str) -> bool {
        self.objects.contains_key(Self::key_of(url_or_key))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Makes every subsequent delete fail with `Unavailable`.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn key_of(url_or_key: &str) -> &str {
        url_or_key.strip_prefix("memory://").unwrap_or(url_or_key)
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StorageError> {
        check_key(key)?;
        self.objects
            .insert(key.to_string(), (content_type.to_string(), bytes));
        Ok(format!("memory://{}", key))
    }

    async fn delete(&self, url_or_key: &str) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("deletes disabled".into()));
        }
        let key = Self::key_of(url_or_key);
        self.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}
