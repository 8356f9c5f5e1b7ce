//! Distribution manifests keyed by image name.

use super::{FileStore, StoreError};
use crate::image::{DistributionManifest, ImageName};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::io::Write;
use std::ops::Deref;
use std::path::Path;

const MANIFEST_DIR: &str = "manifest";

/// Manifests stored as `base64url(repository:tag)`.
#[derive(Debug)]
pub struct ManifestStore {
    files: FileStore,
}

impl ManifestStore {
    pub fn new(root: &Path, capacity: usize) -> Result<Self, StoreError> {
        Ok(Self { files: FileStore::new(&root.join(MANIFEST_DIR), capacity)? })
    }

    /// File name for the manifest of `name`. The registry is not part of
    /// the key.
    pub fn key(name: &ImageName) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", name.repository(), name.tag()))
    }

    /// Write `manifest` for `name`, replacing any previous one.
    pub fn save(&self, name: &ImageName, manifest: &DistributionManifest) -> Result<(), StoreError> {
        let key = Self::key(name);
        let data = serde_json::to_vec(manifest).map_err(|e| StoreError::Corrupt {
            name: key.clone(),
            reason: e.to_string(),
        })?;

        let path = self.files.download_path(&key);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        let mut f = self.files.create_download_file(&key)?;
        f.write_all(&data).map_err(|e| StoreError::io(&path, e))?;
        f.sync_all().map_err(|e| StoreError::io(&path, e))?;
        drop(f);

        if self.files.contains(&key) || self.files.store_file_path(&key).exists() {
            self.files.remove_store_file(&key).or_else(|e| match e {
                StoreError::NotFound { .. } => Ok(()),
                other => Err(other),
            })?;
        }
        self.files.move_download_file_to_store(&key)
    }

    pub fn load(&self, name: &ImageName) -> Result<DistributionManifest, StoreError> {
        let key = Self::key(name);
        let reader = self.files.store_file_reader(&key)?;
        serde_json::from_reader(reader)
            .map_err(|e| StoreError::Corrupt { name: key, reason: e.to_string() })
    }

    pub fn contains_image(&self, name: &ImageName) -> bool {
        self.files.store_file_stat(&Self::key(name)).is_ok()
    }
}

impl Deref for ManifestStore {
    type Target = FileStore;

    fn deref(&self) -> &FileStore {
        &self.files
    }
}
