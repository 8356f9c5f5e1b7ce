//! Distributed layer cache.
//!
//! Each build step has a deterministic cache ID. The [`CacheManager`] maps
//! that ID to the digests of the layer the step produced, so an identical
//! step in a later build can fetch the layer instead of executing.

mod fs_store;
mod http_store;
mod kv;
mod manager;
mod redis_store;

pub use fs_store::FsKvStore;
pub use http_store::HttpKvStore;
pub use kv::{KvStore, MemKvStore};
pub use manager::RegistryCacheManager;
pub use redis_store::RedisKvStore;

use crate::config::{CacheBackendConfig, Config};
use crate::error::MultiError;
use crate::image::{Digest, DigestPair};
use crate::registry::{RegistryClient, RegistryError};
use crate::storage::{ImageStore, StoreError};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Prefix of every key written to the key-value backend.
pub const CACHE_PREFIX: &str = "tessera_builder_cache_";

/// Value stored for a step that produced no layer.
pub const CACHE_EMPTY_ENTRY: &str = "TESSERA_CACHE_EMPTY";

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("layer not found in cache for {cache_id}")]
    NotFound { cache_id: String },

    #[error("cache backend error for {key}: {reason}")]
    Backend { key: String, reason: String },

    #[error("malformed cache entry {entry:?}")]
    InvalidEntry { entry: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("registry client not configured for cache")]
    NoRegistry,

    #[error("timeout after {secs}s waiting for cache push")]
    PushTimeout { secs: u64 },

    #[error("cache push: {0}")]
    Push(#[from] MultiError),
}

impl CacheError {
    pub(crate) fn backend(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Backend { key: key.into(), reason: reason.to_string() }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Maps cache IDs to committed layers.
#[async_trait::async_trait]
pub trait CacheManager: Send + Sync {
    /// Look up `cache_id`. `Ok(None)` means the step is cached and produced
    /// no layer; a miss is [`CacheError::NotFound`].
    async fn pull_cache(&self, cache_id: &str) -> Result<Option<DigestPair>, CacheError>;

    /// Queue a push of `pair` under `cache_id`. Never blocks on the backend.
    fn push_cache(&self, cache_id: &str, pair: Option<DigestPair>) -> Result<(), CacheError>;

    /// Wait for queued pushes, returning every failure collected so far.
    async fn wait_for_push(&self) -> Result<(), CacheError>;
}

/// Cache manager that never hits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCacheManager;

#[async_trait::async_trait]
impl CacheManager for NoopCacheManager {
    async fn pull_cache(&self, cache_id: &str) -> Result<Option<DigestPair>, CacheError> {
        Err(CacheError::NotFound { cache_id: cache_id.to_string() })
    }

    fn push_cache(&self, _cache_id: &str, _pair: Option<DigestPair>) -> Result<(), CacheError> {
        Ok(())
    }

    async fn wait_for_push(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Serializes a cache entry as `<tar hex>,<gzip hex>`.
pub fn create_entry(pair: Option<&DigestPair>) -> String {
    match pair {
        Some(pair) => format!("{},{}", pair.tar_digest.hex(), pair.gzip_descriptor.digest.hex()),
        None => CACHE_EMPTY_ENTRY.to_string(),
    }
}

/// Parses `<tar hex>,<gzip hex>` into `(tar digest, gzip digest)`.
pub fn parse_entry(entry: &str) -> Result<(Digest, Digest), CacheError> {
    let invalid = || CacheError::InvalidEntry { entry: entry.to_string() };
    let (tar, gzip) = entry.split_once(',').ok_or_else(invalid)?;
    let tar = Digest::from_hex(tar.trim()).map_err(|_| invalid())?;
    let gzip = Digest::from_hex(gzip.trim()).map_err(|_| invalid())?;
    Ok((tar, gzip))
}

/// Builds the cache manager selected by `config`.
///
/// Must be called from within a tokio runtime when a backend is configured.
pub fn from_config(
    config: &Config,
    store: Arc<ImageStore>,
    registry: Option<Arc<dyn RegistryClient>>,
) -> Result<Arc<dyn CacheManager>, CacheError> {
    let kv: Arc<dyn KvStore> = match &config.cache {
        CacheBackendConfig::None => {
            info!("No cache backend configured, using noop cache manager");
            return Ok(Arc::new(NoopCacheManager));
        }
        CacheBackendConfig::Local { dir } => Arc::new(FsKvStore::new(dir)?),
        CacheBackendConfig::Http { address, headers } => {
            Arc::new(HttpKvStore::new(address, headers.clone())?)
        }
        CacheBackendConfig::Redis { address, ttl_secs } => {
            info!("Using redis at {} for cache ID storage", address);
            Arc::new(RedisKvStore::new(address, *ttl_secs)?)
        }
    };
    Ok(Arc::new(RegistryCacheManager::new(store, kv, registry, config.push_timeout())))
}
