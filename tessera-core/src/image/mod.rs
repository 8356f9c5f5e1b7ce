//! Docker image model: digests, image configs, distribution manifests and
//! image names.

mod config;
mod digest;
mod export;
mod manifest;
mod name;

pub use config::{ContainerConfig, EmptyObject, Healthcheck, History, ImageConfig, RootFs};
pub use digest::{
    Descriptor, Digest, DigestPair, DigestPairMap, Digester, DigestingWriter, DIGEST_EMPTY_TAR,
};
pub use export::{write_image_tar, ExportManifest};
pub use manifest::{
    DistributionManifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER, MEDIA_TYPE_MANIFEST,
};
pub use name::{ImageName, DOCKER_HUB_NAMESPACE, DOCKER_HUB_REGISTRY, SCRATCH};
