//! Registry clients.
//!
//! The build core only asks a registry for four things: pull a tagged
//! manifest (with its blobs), push one, pull a single blob, push a single
//! blob. All bytes move through the [`ImageStore`](crate::storage::ImageStore);
//! clients never hand blob contents to callers directly.

mod noop;
mod oci;

pub use noop::NoopRegistry;
pub use oci::{OciConnector, OciRegistryClient};

use crate::image::{Descriptor, Digest, DistributionManifest};
use crate::storage::StoreError;
use std::sync::Arc;

/// Error type for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("{operation} {reference} failed: {reason}")]
    Remote { operation: &'static str, reference: String, reason: String },

    #[error("blob digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("image {image} is not available without a registry")]
    Unavailable { image: String },

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// A client bound to one `(registry, repository)` pair.
#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    /// Pull the manifest for `tag` and every blob it references into the
    /// store. The manifest is saved under `repository:tag`.
    async fn pull(&self, tag: &str) -> Result<DistributionManifest, RegistryError>;

    /// Push the stored manifest for `tag` along with its blobs.
    async fn push(&self, tag: &str) -> Result<(), RegistryError>;

    /// Ensure the blob `digest` is in the layer store, downloading it if
    /// needed.
    async fn pull_layer(&self, digest: &Digest) -> Result<Descriptor, RegistryError>;

    /// Upload the stored blob `digest`.
    async fn push_layer(&self, digest: &Digest) -> Result<(), RegistryError>;
}

/// Produces clients per image.
pub trait RegistryConnector: Send + Sync {
    fn connect(&self, registry: &str, repository: &str) -> Arc<dyn RegistryClient>;
}
