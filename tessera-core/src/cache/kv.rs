//! Key-value backends for cache ID mappings.

use super::CacheError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Minimal key-value contract. A missing key reads as an empty string.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, CacheError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), CacheError>;
    async fn cleanup(&self) -> Result<(), CacheError>;
}

/// In-process store, shared across builds of one process.
#[derive(Debug, Default)]
pub struct MemKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl KvStore for MemKvStore {
    async fn get(&self, key: &str) -> Result<String, CacheError> {
        let entries = self.entries.lock().map_err(|e| CacheError::backend(key, e))?;
        Ok(entries.get(key).cloned().unwrap_or_default())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|e| CacheError::backend(key, e))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
