//! Local content store for layer blobs and manifests.
//!
//! Every artifact kind keeps a transient `download/` area and a persistent
//! `cache/` area. Writers fill a download file and move it into the cache
//! only when complete, so readers never observe a partial blob.

mod file_store;
mod layer_store;
mod manifest_store;

pub use file_store::FileStore;
pub use layer_store::LayerTarStore;
pub use manifest_store::ManifestStore;

use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Error type for content store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{name} not found in store")]
    NotFound { name: String },

    #[error("{name} already exists in store")]
    AlreadyExists { name: String },

    #[error("invalid store file name {name:?}")]
    InvalidName { name: String },

    #[error("corrupt store file {name}: {reason}")]
    Corrupt { name: String, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Layer tars, manifests, and a per-process sandbox under one root.
#[derive(Debug)]
pub struct ImageStore {
    root_dir: PathBuf,
    sandbox: TempDir,
    pub layers: LayerTarStore,
    pub manifests: ManifestStore,
}

impl ImageStore {
    pub fn new(root: &Path, layer_capacity: usize, manifest_capacity: usize) -> Result<Self, StoreError> {
        let sandbox_root = root.join("sandbox");
        std::fs::create_dir_all(&sandbox_root).map_err(|e| StoreError::io(&sandbox_root, e))?;
        let sandbox = tempfile::Builder::new()
            .prefix("sandbox")
            .tempdir_in(&sandbox_root)
            .map_err(|e| StoreError::io(&sandbox_root, e))?;

        let store = Self {
            root_dir: root.to_path_buf(),
            sandbox,
            layers: LayerTarStore::new(root, layer_capacity)?,
            manifests: ManifestStore::new(root, manifest_capacity)?,
        };
        info!(root = %root.display(), sandbox = %store.sandbox_dir().display(), "Opened image store");
        Ok(store)
    }

    pub fn from_config(config: &crate::config::Config) -> Result<Self, StoreError> {
        Self::new(&config.storage_dir, config.layer_cache_size, config.manifest_cache_size)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Scratch space for this process; removed when the store is dropped.
    pub fn sandbox_dir(&self) -> &Path {
        self.sandbox.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let dir = TempDir::new().unwrap();
        let sandbox;
        {
            let store = ImageStore::new(dir.path(), 8, 4).unwrap();
            sandbox = store.sandbox_dir().to_path_buf();
            assert!(sandbox.starts_with(dir.path().join("sandbox")));
            assert!(dir.path().join("layer_tar/cache").is_dir());
            assert!(dir.path().join("manifest/download").is_dir());
        }
        assert!(!sandbox.exists());
    }
}
