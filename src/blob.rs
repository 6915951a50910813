use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid object path: {0:?}")]
    InvalidPath(String),
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("blob call timed out")]
    Timeout,
}

/// HTTP-style metadata stored alongside an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub content_type: String,
    pub cache_control: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub metadata: ObjectMetadata,
}

/// Object storage collaborator used by the snapshot builder.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `bytes` at `path`, replacing any previous object there.
    async fn put(&self, path: &str, bytes: Vec<u8>, metadata: ObjectMetadata) -> Result<(), BlobError>;

    async fn get(&self, path: &str) -> Result<Option<StoredObject>, BlobError>;
}

/// Object paths are relative, `/`-separated, and never climb out of the root.
fn validate_path(path: &str) -> Result<(), BlobError> {
    let invalid = || BlobError::InvalidPath(path.to_string());
    if path.is_empty() || path.ends_with('/') {
        return Err(invalid());
    }
    for component in Path::new(path).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Blob store rooted at a directory. Metadata lives in a `<object>.meta.json` sidecar.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, path: &str) -> Result<PathBuf, BlobError> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }
}

fn sidecar(object: &Path) -> PathBuf {
    let mut name = object.as_os_str().to_os_string();
    name.push(".meta.json");
    PathBuf::from(name)
}

async fn write_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = target.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, target).await
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, metadata: ObjectMetadata) -> Result<(), BlobError> {
        let target = self.object_path(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Metadata first: a reader that finds the object always finds its metadata.
        write_atomic(&sidecar(&target), &serde_json::to_vec(&metadata)?).await?;
        write_atomic(&target, &bytes).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<StoredObject>, BlobError> {
        let target = self.object_path(path)?;
        let bytes = match tokio::fs::read(&target).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata = serde_json::from_slice(&tokio::fs::read(sidecar(&target)).await?)?;
        Ok(Some(StoredObject { bytes, metadata }))
    }
}

/// In-process blob store that counts writes.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, StoredObject>,
    writes: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total successful `put` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, metadata: ObjectMetadata) -> Result<(), BlobError> {
        validate_path(path)?;
        self.objects.insert(path.to_string(), StoredObject { bytes, metadata });
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<StoredObject>, BlobError> {
        validate_path(path)?;
        Ok(self.objects.get(path).map(|e| e.value().clone()))
    }
}
