//! Per-stage build state.

use super::runner::CommandRunner;
use crate::error::{Result, TesseraError};
use crate::fsutil::Blacklist;
use crate::registry::RegistryConnector;
use crate::snapshot::{CopyOperation, MemFs, DEFAULT_SCAN_DELAY};
use crate::storage::ImageStore;
use crate::tario::CompressionLevel;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Everything a step needs while it builds: the root it modifies, the
/// in-memory view of that root, and the services it calls out to.
///
/// One context exists per stage. Stages share the root directory, the
/// store and the services, but each starts from an empty view.
pub struct BuildContext {
    pub root_dir: PathBuf,
    pub context_dir: PathBuf,
    /// ARG and ENV values, exported to RUN commands.
    pub stage_vars: BTreeMap<String, String>,
    pub memfs: MemFs,
    pub image_store: Arc<ImageStore>,
    /// Copies queued since the last commit.
    pub copy_ops: Vec<CopyOperation>,
    /// Set by steps that changed the root in ways only a scan can find.
    pub must_scan: bool,
    /// Checkpoints of earlier stages, one directory per alias.
    pub stages_dir: PathBuf,
    pub registry: Arc<dyn RegistryConnector>,
    pub runner: Arc<dyn CommandRunner>,
    pub compression: CompressionLevel,
    base_blacklist: Blacklist,
    scan_delay: Duration,
}

impl BuildContext {
    pub fn new(
        root_dir: &Path,
        context_dir: &Path,
        image_store: Arc<ImageStore>,
        registry: Arc<dyn RegistryConnector>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let stages_dir = image_store.sandbox_dir().join("stages");
        std::fs::create_dir_all(&stages_dir).map_err(|e| TesseraError::io(&stages_dir, e))?;

        let base_blacklist = Blacklist::new(Vec::<String>::new());
        let memfs = new_memfs(root_dir, context_dir, &image_store, &base_blacklist, DEFAULT_SCAN_DELAY)?;
        Ok(Self {
            root_dir: root_dir.to_path_buf(),
            context_dir: context_dir.to_path_buf(),
            stage_vars: BTreeMap::new(),
            memfs,
            image_store,
            copy_ops: Vec::new(),
            must_scan: false,
            stages_dir,
            registry,
            runner,
            compression: CompressionLevel::Default,
            base_blacklist,
            scan_delay: DEFAULT_SCAN_DELAY,
        })
    }

    /// Extra paths excluded from scans and copies.
    pub fn with_blacklist(mut self, extra: &[String]) -> Result<Self> {
        self.base_blacklist = self.base_blacklist.extend(extra.iter().cloned());
        self.rebuild_memfs()?;
        Ok(self)
    }

    pub fn with_scan_delay(mut self, delay: Duration) -> Result<Self> {
        self.scan_delay = delay;
        self.rebuild_memfs()?;
        Ok(self)
    }

    pub fn with_compression(mut self, compression: CompressionLevel) -> Self {
        self.compression = compression;
        self
    }

    /// A fresh context for the next stage: same root and services, empty
    /// view and variables.
    pub fn new_stage(&self) -> Result<Self> {
        Ok(Self {
            root_dir: self.root_dir.clone(),
            context_dir: self.context_dir.clone(),
            stage_vars: BTreeMap::new(),
            memfs: new_memfs(
                &self.root_dir,
                &self.context_dir,
                &self.image_store,
                &self.base_blacklist,
                self.scan_delay,
            )?,
            image_store: self.image_store.clone(),
            copy_ops: Vec::new(),
            must_scan: false,
            stages_dir: self.stages_dir.clone(),
            registry: self.registry.clone(),
            runner: self.runner.clone(),
            compression: self.compression,
            base_blacklist: self.base_blacklist.clone(),
            scan_delay: self.scan_delay,
        })
    }

    /// Waits out the scan delay ahead of a commit that diffs the root or
    /// replays copies.
    pub async fn prepare_commit(&mut self) {
        if self.must_scan || !self.copy_ops.is_empty() {
            self.memfs.settle().await;
        }
    }

    /// Where the checkpoint of stage `alias` lives.
    pub fn copy_from_root(&self, alias: &str) -> PathBuf {
        self.stages_dir.join(URL_SAFE_NO_PAD.encode(alias))
    }

    /// Blacklist for copies out of the build context. Unlike scans, copies
    /// may read from the context directory.
    pub fn copy_blacklist(&self) -> Blacklist {
        self.base_blacklist.clone().with_path(self.image_store.root_dir())
    }

    fn rebuild_memfs(&mut self) -> Result<()> {
        self.memfs = new_memfs(
            &self.root_dir,
            &self.context_dir,
            &self.image_store,
            &self.base_blacklist,
            self.scan_delay,
        )?;
        Ok(())
    }
}

fn new_memfs(
    root_dir: &Path,
    context_dir: &Path,
    store: &ImageStore,
    base: &Blacklist,
    scan_delay: Duration,
) -> Result<MemFs> {
    let blacklist = base.clone().with_path(context_dir).with_path(store.root_dir());
    Ok(MemFs::new(root_dir, blacklist)?.with_scan_delay(scan_delay))
}
