//! Key-value store with one file per key.

use super::kv::KvStore;
use super::CacheError;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct FsKvStore {
    root: PathBuf,
}

impl FsKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| CacheError::io(&root, e))?;
        Ok(Self { root })
    }

    fn path(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.is_empty() || key.contains('/') || key.starts_with('.') {
            return Err(CacheError::backend(key, "key is not a valid file name"));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait::async_trait]
impl KvStore for FsKvStore {
    async fn get(&self, key: &str) -> Result<String, CacheError> {
        let path = self.path(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let path = self.path(key)?;
        tokio::fs::write(&path, value).await.map_err(|e| CacheError::io(&path, e))
    }

    async fn cleanup(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
