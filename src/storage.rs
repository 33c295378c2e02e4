use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::api::AppError;

const LOCAL_SCHEME: &str = "local://";

/// Blob storage for uploaded documents and run reports.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `bucket/key` and returns a URI for it.
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<String, AppError>;

    fn resolve(&self, uri: &str) -> Result<PathBuf, AppError>;

    async fn get(&self, uri: &str) -> Result<Vec<u8>, AppError> {
        let path = self.resolve(uri)?;
        tokio::fs::read(&path)
            .await
            .map_err(|err| AppError::Internal(format!("could not read {}: {err}", path.display())))
    }
}

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .unwrap_or(root)
        };
        LocalStorage { root }
    }
}

#[async_trait]
impl ObjectStore for LocalStorage {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<String, AppError> {
        let relative = format!("{bucket}/{key}");
        let path = self.root.join(checked_relative(&relative)?);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| AppError::Internal(format!("could not create {}: {err}", parent.display())))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| AppError::Internal(format!("could not write {}: {err}", path.display())))?;
        debug!(path = %path.display(), "stored object");
        Ok(format!("{LOCAL_SCHEME}{relative}"))
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf, AppError> {
        let relative = uri
            .strip_prefix(LOCAL_SCHEME)
            .ok_or_else(|| AppError::Validation(format!("unsupported URI: {uri}")))?;
        Ok(self.root.join(checked_relative(relative)?))
    }
}

fn checked_relative(relative: &str) -> Result<&Path, AppError> {
    let path = Path::new(relative);
    let escapes = path
        .components()
        .any(|component| !matches!(component, Component::Normal(_)));
    if relative.is_empty() || escapes {
        return Err(AppError::Validation(format!("invalid object key: {relative}")));
    }
    Ok(path)
}
