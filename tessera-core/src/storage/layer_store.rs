//! Layer blobs keyed by digest hex.

use super::{FileStore, StoreError};
use crate::image::Digest;
use std::fs::{File, Metadata};
use std::ops::Deref;
use std::path::{Path, PathBuf};

const LAYER_DIR: &str = "layer_tar";

/// Gzipped layer tars and config blobs, named by the hex of their digest.
#[derive(Debug)]
pub struct LayerTarStore {
    files: FileStore,
}

impl LayerTarStore {
    pub fn new(root: &Path, capacity: usize) -> Result<Self, StoreError> {
        Ok(Self { files: FileStore::new(&root.join(LAYER_DIR), capacity)? })
    }

    pub fn contains_digest(&self, digest: &Digest) -> bool {
        self.files.store_file_stat(digest.hex()).is_ok()
    }

    pub fn path_of(&self, digest: &Digest) -> PathBuf {
        self.files.store_file_path(digest.hex())
    }

    pub fn reader_of(&self, digest: &Digest) -> Result<File, StoreError> {
        self.files.store_file_reader(digest.hex())
    }

    pub fn stat_of(&self, digest: &Digest) -> Result<Metadata, StoreError> {
        self.files.store_file_stat(digest.hex())
    }

    /// Move `src` into the store under `digest`. An existing blob with the
    /// same digest wins and `src` is removed.
    pub fn link_digest_from(&self, digest: &Digest, src: &Path) -> Result<(), StoreError> {
        match self.files.link_store_file_from(digest.hex(), src) {
            Err(StoreError::AlreadyExists { .. }) => {
                std::fs::remove_file(src).map_err(|e| StoreError::io(src, e))
            }
            other => other,
        }
    }
}

impl Deref for LayerTarStore {
    type Target = FileStore;

    fn deref(&self) -> &FileStore {
        &self.files
    }
}
