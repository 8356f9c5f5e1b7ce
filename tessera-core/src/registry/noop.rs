use super::{RegistryClient, RegistryConnector, RegistryError};
use crate::image::{Descriptor, Digest, DistributionManifest, ImageName, MEDIA_TYPE_LAYER};
use crate::storage::{ImageStore, StoreError};
use std::sync::Arc;
use tracing::debug;

/// Offline registry backed only by the local store.
///
/// Pulls succeed for content that is already stored; pushes succeed
/// without effect.
pub struct NoopRegistry {
    store: Arc<ImageStore>,
    repository: String,
}

impl NoopRegistry {
    pub fn new(store: Arc<ImageStore>) -> Self {
        Self { store, repository: String::new() }
    }
}

#[async_trait::async_trait]
impl RegistryClient for NoopRegistry {
    async fn pull(&self, tag: &str) -> Result<DistributionManifest, RegistryError> {
        let name = ImageName::new("", &self.repository, tag);
        self.store.manifests.load(&name).map_err(|e| match e {
            StoreError::NotFound { .. } => RegistryError::Unavailable { image: name.to_string() },
            other => other.into(),
        })
    }

    async fn push(&self, tag: &str) -> Result<(), RegistryError> {
        debug!(repository = %self.repository, tag, "Skipping push");
        Ok(())
    }

    async fn pull_layer(&self, digest: &Digest) -> Result<Descriptor, RegistryError> {
        let size = self.store.layers.stat_of(digest)?.len();
        Ok(Descriptor { media_type: MEDIA_TYPE_LAYER.to_string(), size, digest: digest.clone() })
    }

    async fn push_layer(&self, digest: &Digest) -> Result<(), RegistryError> {
        debug!(digest = %digest, "Skipping layer push");
        Ok(())
    }
}

impl RegistryConnector for NoopRegistry {
    fn connect(&self, _registry: &str, repository: &str) -> Arc<dyn RegistryClient> {
        Arc::new(NoopRegistry { store: self.store.clone(), repository: repository.to_string() })
    }
}
