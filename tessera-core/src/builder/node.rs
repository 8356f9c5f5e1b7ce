//! One step of a stage, with its cache state.

use super::context::BuildContext;
use super::step::Step;
use crate::cache::CacheManager;
use crate::error::Result;
use crate::image::{DigestPair, ImageConfig};
use std::fmt;
use std::time::Instant;
use tracing::{info, warn};

/// How a node takes part in its stage's build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeOptions {
    /// A later step of the stage was fetched from cache, which already
    /// captures this step's effect.
    pub skip_build: bool,
    /// Commit even without a `#!COMMIT` annotation.
    pub force_commit: bool,
    /// The root directory may be written to.
    pub modify_fs: bool,
}

impl fmt::Display for NodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let flags: Vec<&str> = [
            (self.skip_build, "skip"),
            (self.force_commit, "commit"),
            (self.modify_fs, "modifyfs"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| *name)
        .collect();
        f.write_str(&flags.join(","))
    }
}

/// A build step plus the layers pulled for it from cache.
#[derive(Debug)]
pub struct BuildNode {
    step: Step,
    cached_pairs: Option<Vec<DigestPair>>,
    digest_pairs: Vec<DigestPair>,
}

impl BuildNode {
    pub fn new(step: Step) -> Self {
        Self { step, cached_pairs: None, digest_pairs: Vec::new() }
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn cache_id(&self) -> &str {
        self.step.cache_id()
    }

    pub fn has_commit(&self) -> bool {
        self.step.has_commit()
    }

    /// True once [`BuildNode::pull_cache_layers`] found an entry.
    pub fn is_cached(&self) -> bool {
        self.cached_pairs.is_some()
    }

    /// Marks the node cached with layers an earlier stage produced under
    /// the same cache ID.
    pub fn reuse_pairs(&mut self, pairs: Vec<DigestPair>) {
        self.cached_pairs = Some(pairs);
    }

    /// Cached, or already committed layers in this build.
    pub fn is_fetched(&self) -> bool {
        self.is_cached() || !self.digest_pairs.is_empty()
    }

    /// Layers this node produced, or reused from cache, in its last build.
    pub fn digest_pairs(&self) -> &[DigestPair] {
        &self.digest_pairs
    }

    /// Looks up this node's cache ID. Any failure counts as a miss.
    pub async fn pull_cache_layers(&mut self, cache: &dyn CacheManager) -> bool {
        match cache.pull_cache(self.cache_id()).await {
            Ok(pair) => {
                self.cached_pairs = Some(pair.into_iter().collect());
                true
            }
            Err(e) if e.is_not_found() => {
                info!("* Cache miss for {}", self.step);
                false
            }
            Err(e) => {
                warn!(step = %self.step, error = %e, "Cache pull failed, building instead");
                false
            }
        }
    }

    /// Builds the node on top of `config` and returns the config for the
    /// next node.
    pub async fn build(
        &mut self,
        ctx: &mut BuildContext,
        cache: &dyn CacheManager,
        config: &ImageConfig,
        opts: NodeOptions,
    ) -> Result<ImageConfig> {
        info!("* Step: {}", self.step);
        self.step.apply_config(ctx, config)?;

        if let Some(pairs) = &self.cached_pairs {
            for pair in pairs {
                let path = ctx.image_store.layers.path_of(&pair.gzip_descriptor.digest);
                info!("* Applying cache layer {} (unpack={})", pair.gzip_descriptor.digest.hex(), opts.modify_fs);
                ctx.memfs.update_from_tar_path(&path, opts.modify_fs)?;
            }
            self.digest_pairs = pairs.clone();
        }

        if opts.skip_build {
            info!("* Skipping execution; a later step was cached");
        } else if self.is_cached() {
            info!("* Skipping execution; cache was applied");
        } else {
            let start = Instant::now();
            self.step.execute(ctx, opts.modify_fs).await?;
            info!("* Execute {} took {:?}", self.step, start.elapsed());

            if !self.has_commit() && !opts.force_commit {
                info!("* Not committing step");
            } else {
                ctx.prepare_commit().await;
                self.digest_pairs = self.step.commit(ctx)?;
                self.push_cache(cache);
            }
        }

        self.step.generate_config(ctx, config)
    }

    // A step mapping to more than one layer cannot be cached under one ID.
    // Push failures only surface when the plan waits for pushes.
    fn push_cache(&self, cache: &dyn CacheManager) {
        let pushed = match self.digest_pairs.as_slice() {
            [] => cache.push_cache(self.cache_id(), None),
            [pair] => {
                info!(
                    "* Committed gzipped layer {} ({} bytes), pushing with cache ID {}",
                    pair.gzip_descriptor.digest,
                    pair.gzip_descriptor.size,
                    self.cache_id()
                );
                cache.push_cache(self.cache_id(), Some(pair.clone()))
            }
            pairs => {
                info!("* Not caching {}: it produced {} layers", self.step, pairs.len());
                Ok(())
            }
        };
        if let Err(e) = pushed {
            warn!(cache_id = %self.cache_id(), error = %e, "Failed to queue cache push");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::directive::{Directive, DirectiveKind};
    use crate::builder::runner::ShellRunner;
    use crate::cache::{CacheError, NoopCacheManager};
    use crate::registry::NoopRegistry;
    use crate::storage::ImageStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    // Every lookup hits with an empty entry.
    struct EmptyHitCache;

    #[async_trait::async_trait]
    impl CacheManager for EmptyHitCache {
        async fn pull_cache(&self, _cache_id: &str) -> std::result::Result<Option<DigestPair>, CacheError> {
            Ok(None)
        }

        fn push_cache(&self, _cache_id: &str, _pair: Option<DigestPair>) -> std::result::Result<(), CacheError> {
            Ok(())
        }

        async fn wait_for_push(&self) -> std::result::Result<(), CacheError> {
            Ok(())
        }
    }

    // Lookups miss and pushes fail, as when the push task has stopped.
    struct ClosedCache;

    #[async_trait::async_trait]
    impl CacheManager for ClosedCache {
        async fn pull_cache(&self, cache_id: &str) -> std::result::Result<Option<DigestPair>, CacheError> {
            Err(CacheError::NotFound { cache_id: cache_id.to_string() })
        }

        fn push_cache(&self, cache_id: &str, _pair: Option<DigestPair>) -> std::result::Result<(), CacheError> {
            Err(CacheError::Backend { key: cache_id.to_string(), reason: "push task stopped".into() })
        }

        async fn wait_for_push(&self) -> std::result::Result<(), CacheError> {
            Ok(())
        }
    }

    fn context(dir: &TempDir) -> BuildContext {
        let root = dir.path().join("root");
        let context = dir.path().join("context");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&context).unwrap();
        let store = Arc::new(ImageStore::new(&dir.path().join("store"), 4, 4).unwrap());
        BuildContext::new(&root, &context, store.clone(), Arc::new(NoopRegistry::new(store)), Arc::new(ShellRunner))
            .unwrap()
            .with_scan_delay(Duration::ZERO)
            .unwrap()
    }

    fn env_node(ctx: &BuildContext) -> BuildNode {
        let directive = Directive::new(DirectiveKind::Env { vars: vec![("MODE".into(), "test".into())] }, "MODE=test");
        BuildNode::new(Step::new(directive, "seed", ctx).unwrap())
    }

    #[test]
    fn test_options_display() {
        assert_eq!(NodeOptions::default().to_string(), "");
        let opts = NodeOptions { skip_build: true, force_commit: false, modify_fs: true };
        assert_eq!(opts.to_string(), "skip,modifyfs");
    }

    #[tokio::test]
    async fn test_miss_keeps_node_unfetched() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut node = env_node(&ctx);
        assert!(!node.pull_cache_layers(&NoopCacheManager).await);
        assert!(!node.is_cached());
        assert!(!node.is_fetched());
    }

    #[tokio::test]
    async fn test_config_applies_on_cache_hit() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        let mut node = env_node(&ctx);
        assert!(node.pull_cache_layers(&EmptyHitCache).await);
        assert!(node.is_fetched());

        let opts = NodeOptions { skip_build: true, ..Default::default() };
        let config = node.build(&mut ctx, &EmptyHitCache, &ImageConfig::default(), opts).await.unwrap();
        assert_eq!(config.config.get_env("MODE"), Some("test"));
        assert_eq!(ctx.stage_vars.get("MODE").map(String::as_str), Some("test"));
        assert!(node.digest_pairs().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_commit_produces_no_layer() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        let mut node = env_node(&ctx);
        let opts = NodeOptions { force_commit: true, ..Default::default() };
        node.build(&mut ctx, &NoopCacheManager, &ImageConfig::default(), opts).await.unwrap();
        assert!(node.digest_pairs().is_empty());
    }

    #[tokio::test]
    async fn test_push_failure_does_not_fail_build() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        let mut node = env_node(&ctx);
        let opts = NodeOptions { force_commit: true, ..Default::default() };
        let config = node.build(&mut ctx, &ClosedCache, &ImageConfig::default(), opts).await.unwrap();
        assert_eq!(config.config.get_env("MODE"), Some("test"));
        assert!(node.digest_pairs().is_empty());
    }
}
