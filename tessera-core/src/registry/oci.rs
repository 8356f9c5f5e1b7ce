use super::{RegistryClient, RegistryConnector, RegistryError};
use crate::image::{Descriptor, Digest, DistributionManifest, ImageName, MEDIA_TYPE_LAYER};
use crate::storage::{ImageStore, StoreError};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Registry client over `oci-distribution`.
pub struct OciRegistryClient {
    client: Client,
    auth: RegistryAuth,
    registry: String,
    repository: String,
    store: Arc<ImageStore>,
}

impl OciRegistryClient {
    pub fn new(store: Arc<ImageStore>, registry: &str, repository: &str) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::HttpsExcept(vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
            ]),
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth: auth_from_env(),
            registry: registry.to_string(),
            repository: repository.to_string(),
            store,
        }
    }

    fn name(&self, tag: &str) -> ImageName {
        ImageName::new(&self.registry, &self.repository, tag)
    }

    fn reference(&self, tag: &str) -> Result<Reference, RegistryError> {
        let raw = format!("{}/{}:{}", self.registry, self.repository, tag);
        raw.parse::<Reference>()
            .map_err(|e| RegistryError::InvalidReference { reference: raw, reason: e.to_string() })
    }

    fn remote(&self, operation: &'static str, what: &str, e: impl std::fmt::Display) -> RegistryError {
        RegistryError::Remote {
            operation,
            reference: format!("{}/{}{}", self.registry, self.repository, what),
            reason: e.to_string(),
        }
    }

    async fn download_blob(&self, reference: &Reference, desc: &Descriptor) -> Result<(), RegistryError> {
        let digest = &desc.digest;
        if self.store.layers.contains_digest(digest) {
            debug!(digest = %digest, "Blob already in store");
            return Ok(());
        }

        let name = digest.hex();
        let path = self.store.layers.download_path(name);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        drop(self.store.layers.create_download_file(name)?);

        let oci_desc = OciDescriptor {
            media_type: desc.media_type.clone(),
            digest: digest.to_string(),
            size: desc.size as i64,
            ..Default::default()
        };
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        self.client
            .pull_blob(reference, &oci_desc, &mut file)
            .await
            .map_err(|e| self.remote("pull blob", &format!("@{}", digest), e))?;
        file.sync_all().await.map_err(|e| StoreError::io(&path, e))?;
        drop(file);

        let mut reader = std::fs::File::open(&path).map_err(|e| StoreError::io(&path, e))?;
        let actual = Digest::of_reader(&mut reader).map_err(|e| StoreError::io(&path, e))?;
        if &actual != digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        match self.store.layers.move_download_file_to_store(name) {
            Err(StoreError::AlreadyExists { .. }) => Ok(()),
            other => Ok(other?),
        }
    }

    async fn upload_blob(&self, reference: &Reference, digest: &Digest) -> Result<(), RegistryError> {
        let path = self.store.layers.path_of(digest);
        let data = tokio::fs::read(&path).await.map_err(|e| StoreError::io(&path, e))?;
        self.client
            .push_blob(reference, &data, digest.as_str())
            .await
            .map_err(|e| self.remote("push blob", &format!("@{}", digest), e))?;
        debug!(digest = %digest, size = data.len(), "Pushed blob");
        Ok(())
    }

    async fn authenticate(&self, reference: &Reference, operation: RegistryOperation) -> Result<(), RegistryError> {
        self.client
            .auth(reference, &self.auth, operation)
            .await
            .map_err(|e| self.remote("authenticate", "", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RegistryClient for OciRegistryClient {
    #[instrument(skip(self), fields(registry = %self.registry, repository = %self.repository))]
    async fn pull(&self, tag: &str) -> Result<DistributionManifest, RegistryError> {
        let reference = self.reference(tag)?;
        info!("Pulling manifest");
        let (oci_manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&reference, &self.auth)
            .await
            .map_err(|e| self.remote("pull manifest", &format!(":{}", tag), e))?;
        let manifest: DistributionManifest = serde_json::from_value(serde_json::to_value(&oci_manifest)?)?;

        self.download_blob(&reference, &manifest.config).await?;
        for layer in &manifest.layers {
            self.download_blob(&reference, layer).await?;
        }
        self.store.manifests.save(&self.name(tag), &manifest)?;

        info!(digest = %manifest_digest, layers = manifest.layers.len(), "Pulled image");
        Ok(manifest)
    }

    #[instrument(skip(self), fields(registry = %self.registry, repository = %self.repository))]
    async fn push(&self, tag: &str) -> Result<(), RegistryError> {
        let reference = self.reference(tag)?;
        let manifest = self.store.manifests.load(&self.name(tag))?;
        self.authenticate(&reference, RegistryOperation::Push).await?;

        self.upload_blob(&reference, manifest.config_digest()).await?;
        for layer in &manifest.layers {
            self.upload_blob(&reference, &layer.digest).await?;
        }

        let oci_manifest: OciImageManifest = serde_json::from_slice(&serde_json::to_vec(&manifest)?)?;
        let url = self
            .client
            .push_manifest(&reference, &OciManifest::Image(oci_manifest))
            .await
            .map_err(|e| self.remote("push manifest", &format!(":{}", tag), e))?;
        info!(url = %url, "Pushed image");
        Ok(())
    }

    #[instrument(skip(self), fields(registry = %self.registry, repository = %self.repository))]
    async fn pull_layer(&self, digest: &Digest) -> Result<Descriptor, RegistryError> {
        let reference = self.reference("latest")?;
        let desc = Descriptor { media_type: MEDIA_TYPE_LAYER.to_string(), size: 0, digest: digest.clone() };
        self.download_blob(&reference, &desc).await?;
        let size = self.store.layers.stat_of(digest)?.len();
        Ok(Descriptor { size, ..desc })
    }

    #[instrument(skip(self), fields(registry = %self.registry, repository = %self.repository))]
    async fn push_layer(&self, digest: &Digest) -> Result<(), RegistryError> {
        let reference = self.reference("latest")?;
        self.authenticate(&reference, RegistryOperation::Push).await?;
        self.upload_blob(&reference, digest).await
    }
}

/// Connects [`OciRegistryClient`]s sharing one store.
pub struct OciConnector {
    store: Arc<ImageStore>,
}

impl OciConnector {
    pub fn new(store: Arc<ImageStore>) -> Self {
        Self { store }
    }
}

impl RegistryConnector for OciConnector {
    fn connect(&self, registry: &str, repository: &str) -> Arc<dyn RegistryClient> {
        Arc::new(OciRegistryClient::new(self.store.clone(), registry, repository))
    }
}

/// Credentials from `TESSERA_REGISTRY_USERNAME` and
/// `TESSERA_REGISTRY_PASSWORD`, anonymous otherwise.
fn auth_from_env() -> RegistryAuth {
    match (
        std::env::var("TESSERA_REGISTRY_USERNAME"),
        std::env::var("TESSERA_REGISTRY_PASSWORD"),
    ) {
        (Ok(user), Ok(password)) => RegistryAuth::Basic(user, password),
        _ => RegistryAuth::Anonymous,
    }
}

/// Picks the linux image for the host architecture from an index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|platform| platform.os == "linux" && platform.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
