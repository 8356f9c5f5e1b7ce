use super::{create_entry, parse_entry, CacheError, CacheManager, KvStore, CACHE_EMPTY_ENTRY, CACHE_PREFIX};
use crate::error::MultiError;
use crate::image::{Descriptor, DigestPair, MEDIA_TYPE_LAYER};
use crate::registry::RegistryClient;
use crate::storage::{ImageStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, instrument, warn};

const PULL_RETRIES: usize = 2;
const PULL_BACKOFF: Duration = Duration::from_secs(1);

enum PushRequest {
    Push { cache_id: String, pair: Option<DigestPair> },
    Flush(oneshot::Sender<MultiError>),
}

/// Cache manager storing blobs in a registry and ID mappings in a
/// key-value backend.
///
/// Pushes are handed to one background task, which uploads them in order
/// and collects failures until the next [`CacheManager::wait_for_push`].
pub struct RegistryCacheManager {
    store: Arc<ImageStore>,
    kv: Arc<dyn KvStore>,
    registry: Option<Arc<dyn RegistryClient>>,
    pushes: mpsc::UnboundedSender<PushRequest>,
    push_timeout: Duration,
    pull_lock: Mutex<()>,
}

impl RegistryCacheManager {
    /// Spawns the push task on the current tokio runtime.
    pub fn new(
        store: Arc<ImageStore>,
        kv: Arc<dyn KvStore>,
        registry: Option<Arc<dyn RegistryClient>>,
        push_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(push_loop(rx, kv.clone(), registry.clone()));
        Self { store, kv, registry, pushes: tx, push_timeout, pull_lock: Mutex::new(()) }
    }

    async fn get_with_retry(&self, key: &str) -> Result<String, CacheError> {
        let mut attempt = 0;
        loop {
            match self.kv.get(key).await {
                Ok(entry) => return Ok(entry),
                Err(e) if attempt < PULL_RETRIES => {
                    attempt += 1;
                    warn!(key, attempt, error = %e, "Retrying cache query");
                    tokio::time::sleep(PULL_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait::async_trait]
impl CacheManager for RegistryCacheManager {
    #[instrument(skip(self))]
    async fn pull_cache(&self, cache_id: &str) -> Result<Option<DigestPair>, CacheError> {
        let _guard = self.pull_lock.lock().await;

        let entry = self.get_with_retry(&format!("{}{}", CACHE_PREFIX, cache_id)).await?;
        if entry.is_empty() {
            return Err(CacheError::NotFound { cache_id: cache_id.to_string() });
        }
        info!(cache_id, entry = %entry, "Found cache mapping");
        if entry == CACHE_EMPTY_ENTRY {
            return Ok(None);
        }

        let (tar_digest, gzip_digest) = parse_entry(&entry)?;
        let size = match self.store.layers.stat_of(&gzip_digest) {
            Ok(md) => md.len(),
            Err(StoreError::NotFound { .. }) => {
                let registry = self.registry.as_ref().ok_or(CacheError::NoRegistry)?;
                registry.pull_layer(&gzip_digest).await?.size
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some(DigestPair {
            tar_digest,
            gzip_descriptor: Descriptor {
                media_type: MEDIA_TYPE_LAYER.to_string(),
                size,
                digest: gzip_digest,
            },
        }))
    }

    fn push_cache(&self, cache_id: &str, pair: Option<DigestPair>) -> Result<(), CacheError> {
        self.pushes
            .send(PushRequest::Push { cache_id: cache_id.to_string(), pair })
            .map_err(|_| CacheError::backend(cache_id, "push task stopped"))
    }

    async fn wait_for_push(&self) -> Result<(), CacheError> {
        let (tx, rx) = oneshot::channel();
        self.pushes
            .send(PushRequest::Flush(tx))
            .map_err(|_| CacheError::backend("flush", "push task stopped"))?;

        match tokio::time::timeout(self.push_timeout, rx).await {
            Ok(Ok(errors)) => Ok(errors.into_result()?),
            Ok(Err(_)) => Err(CacheError::backend("flush", "push task stopped")),
            Err(_) => Err(CacheError::PushTimeout { secs: self.push_timeout.as_secs() }),
        }
    }
}

async fn push_loop(
    mut rx: mpsc::UnboundedReceiver<PushRequest>,
    kv: Arc<dyn KvStore>,
    registry: Option<Arc<dyn RegistryClient>>,
) {
    let mut errors = MultiError::new();
    while let Some(request) = rx.recv().await {
        match request {
            PushRequest::Push { cache_id, pair } => {
                if let Err(e) = push_one(&cache_id, pair.as_ref(), kv.as_ref(), registry.as_deref()).await {
                    error!(cache_id = %cache_id, error = %e, "Cache push failed");
                    errors.push(e);
                }
            }
            PushRequest::Flush(reply) => {
                let _ = reply.send(std::mem::take(&mut errors));
            }
        }
    }
    debug!("Cache push task stopped");
}

async fn push_one(
    cache_id: &str,
    pair: Option<&DigestPair>,
    kv: &dyn KvStore,
    registry: Option<&dyn RegistryClient>,
) -> Result<(), String> {
    let registry = registry.ok_or_else(|| CacheError::NoRegistry.to_string())?;
    if let Some(pair) = pair {
        let digest = &pair.gzip_descriptor.digest;
        registry.push_layer(digest).await.map_err(|e| format!("push layer {}: {}", digest, e))?;
    }

    let entry = create_entry(pair);
    kv.put(&format!("{}{}", CACHE_PREFIX, cache_id), &entry)
        .await
        .map_err(|e| format!("store mapping ({},{}): {}", cache_id, entry, e))?;
    info!(cache_id, entry = %entry, "Stored cache mapping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemKvStore;
    use crate::image::{Digest, DistributionManifest};
    use crate::registry::{NoopRegistry, RegistryConnector, RegistryError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn stored_pair(store: &ImageStore, dir: &TempDir, data: &[u8]) -> DigestPair {
        let digest = Digest::of_bytes(data);
        let src = dir.path().join("blob");
        std::fs::write(&src, data).unwrap();
        store.layers.link_digest_from(&digest, &src).unwrap();
        DigestPair {
            tar_digest: Digest::of_bytes(b"uncompressed"),
            gzip_descriptor: Descriptor {
                media_type: MEDIA_TYPE_LAYER.into(),
                size: data.len() as u64,
                digest,
            },
        }
    }

    fn setup(dir: &TempDir) -> (Arc<ImageStore>, Arc<MemKvStore>, RegistryCacheManager) {
        let store = Arc::new(ImageStore::new(&dir.path().join("store"), 8, 4).unwrap());
        let kv = Arc::new(MemKvStore::new());
        let registry = NoopRegistry::new(store.clone()).connect("", "cache");
        let manager = RegistryCacheManager::new(
            store.clone(),
            kv.clone(),
            Some(registry),
            Duration::from_secs(5),
        );
        (store, kv, manager)
    }

    #[tokio::test]
    async fn test_push_then_pull() {
        let dir = TempDir::new().unwrap();
        let (store, kv, manager) = setup(&dir);
        let pair = stored_pair(&store, &dir, b"layer bytes");

        assert!(manager.pull_cache("step").await.unwrap_err().is_not_found());

        manager.push_cache("step", Some(pair.clone())).unwrap();
        manager.push_cache("empty", None).unwrap();
        manager.wait_for_push().await.unwrap();
        assert_eq!(kv.len(), 2);

        assert_eq!(manager.pull_cache("step").await.unwrap(), Some(pair));
        assert_eq!(manager.pull_cache("empty").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_errors_surface_on_wait() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(&dir.path().join("store"), 8, 4).unwrap());
        let manager = RegistryCacheManager::new(
            store,
            Arc::new(MemKvStore::new()),
            None,
            Duration::from_secs(5),
        );

        manager.push_cache("a", None).unwrap();
        manager.push_cache("b", None).unwrap();
        match manager.wait_for_push().await {
            Err(CacheError::Push(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected result: {:?}", other),
        }
        manager.wait_for_push().await.unwrap();
    }

    struct FlakyKv {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl KvStore for FlakyKv {
        async fn get(&self, key: &str) -> Result<String, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(CacheError::backend(key, "connection reset"));
            }
            Ok(String::new())
        }

        async fn put(&self, _key: &str, _value: &str) -> Result<(), CacheError> {
            Ok(())
        }

        async fn cleanup(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_retries_transient_errors() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(&dir.path().join("store"), 8, 4).unwrap());

        let kv = Arc::new(FlakyKv { failures: AtomicUsize::new(2), calls: AtomicUsize::new(0) });
        let manager = RegistryCacheManager::new(store.clone(), kv.clone(), None, Duration::from_secs(5));
        assert!(manager.pull_cache("id").await.unwrap_err().is_not_found());
        assert_eq!(kv.calls.load(Ordering::SeqCst), 3);

        let kv = Arc::new(FlakyKv { failures: AtomicUsize::new(5), calls: AtomicUsize::new(0) });
        let manager = RegistryCacheManager::new(store, kv.clone(), None, Duration::from_secs(5));
        assert!(matches!(manager.pull_cache("id").await, Err(CacheError::Backend { .. })));
        assert_eq!(kv.calls.load(Ordering::SeqCst), 3);
    }

    struct HangingRegistry;

    #[async_trait::async_trait]
    impl RegistryClient for HangingRegistry {
        async fn pull(&self, _tag: &str) -> Result<DistributionManifest, RegistryError> {
            std::future::pending().await
        }
        async fn push(&self, _tag: &str) -> Result<(), RegistryError> {
            std::future::pending().await
        }
        async fn pull_layer(&self, _digest: &Digest) -> Result<Descriptor, RegistryError> {
            std::future::pending().await
        }
        async fn push_layer(&self, _digest: &Digest) -> Result<(), RegistryError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_push_times_out() {
        let dir = TempDir::new().unwrap();
        let (store, _, _) = setup(&dir);
        let pair = stored_pair(&store, &dir, b"slow");
        let manager = RegistryCacheManager::new(
            store,
            Arc::new(MemKvStore::new()),
            Some(Arc::new(HangingRegistry)),
            Duration::from_secs(600),
        );

        manager.push_cache("slow", Some(pair)).unwrap();
        assert!(matches!(manager.wait_for_push().await, Err(CacheError::PushTimeout { secs: 600 })));
    }
}
