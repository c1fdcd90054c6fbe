use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Failure fetching raw statement bytes.
///
/// The pipeline never retries on its own; `is_retriable` only tells the
/// operator whether a manual requeue is worth attempting.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    #[error("Transient storage failure: {0}")]
    Transient(String),
}

impl StorageError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn store_bytes(&self, path: &str, data: Vec<u8>) -> Result<(), StorageError>;
    async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError>;
}

/// Filesystem-backed object storage rooted at a base directory.
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub async fn new(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        if !base_path.exists() {
            fs::create_dir_all(&base_path)
                .await
                .map_err(|e| StorageError::Transient(e.to_string()))?;
        }
        Ok(Self { base_path })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if key.is_empty() || escapes {
            return Err(StorageError::InvalidPath(key.to_string()));
        }
        Ok(self.base_path.join(relative))
    }
}

fn classify_io(key: &str, err: std::io::Error) -> StorageError {
    match err.kind() {
        ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
            StorageError::InvalidPath(format!("{}: {}", key, err))
        }
        _ => StorageError::Transient(format!("{}: {}", key, err)),
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn store_bytes(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| classify_io(key, e))?;
        }
        fs::write(path, data).await.map_err(|e| classify_io(key, e))
    }

    async fn fetch_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        fs::read(path).await.map_err(|e| classify_io(key, e))
    }
}
