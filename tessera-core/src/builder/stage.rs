//! A build stage: the nodes between one FROM and the next.

use super::context::BuildContext;
use super::directive::{Directive, DirectiveKind};
use super::node::{BuildNode, NodeOptions};
use super::parser::ParsedStage;
use super::step::Step;
use crate::cache::CacheManager;
use crate::error::{Result, TesseraError};
use crate::image::{
    Descriptor, DigestPairMap, DistributionManifest, History, ImageConfig, ImageName, MEDIA_TYPE_CONFIG,
};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use tracing::{info, instrument};

const HISTORY_AUTHOR: &str = "tessera";

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StageOptions {
    pub allow_modify_fs: bool,
    pub force_commit: bool,
}

/// A sequence of nodes producing either a final image or files for a
/// later stage to copy.
pub struct BuildStage {
    alias: String,
    ctx: BuildContext,
    nodes: Vec<BuildNode>,
    /// Paths that this stage copies out of other stages, by alias.
    copy_from_dirs: BTreeMap<String, Vec<String>>,
    last_config: ImageConfig,
    require_on_disk: bool,
    opts: StageOptions,
}

impl BuildStage {
    /// Converts a parsed stage into nodes. `seed` is the cache ID the
    /// first node chains from.
    pub(crate) fn new(
        base: &BuildContext,
        alias: &str,
        parsed: &ParsedStage,
        seed: &str,
        opts: StageOptions,
    ) -> Result<Self> {
        let directives = std::iter::once(parsed.from.clone()).chain(parsed.directives.iter().cloned());
        Self::from_directives(base, alias, directives, seed, opts)
    }

    /// A stage that only pulls `image`, for `COPY --from=<image>`.
    pub(crate) fn remote_image(base: &BuildContext, image: &str, seed: &str, opts: StageOptions) -> Result<Self> {
        let from = Directive::new(
            DirectiveKind::From { image: image.to_string(), alias: Some(image.to_string()) },
            format!("{} AS {}", image, image),
        );
        let opts = StageOptions { force_commit: false, ..opts };
        Self::from_directives(base, image, std::iter::once(from), seed, opts)
    }

    fn from_directives(
        base: &BuildContext,
        alias: &str,
        directives: impl Iterator<Item = Directive>,
        seed: &str,
        opts: StageOptions,
    ) -> Result<Self> {
        let ctx = base.new_stage()?;
        let mut nodes = Vec::new();
        let mut copy_from_dirs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut require_on_disk = false;
        let mut seed = seed.to_string();

        for directive in directives {
            let step = Step::new(directive, &seed, &ctx)?;
            seed = step.cache_id().to_string();
            if let Some((from, dirs)) = step.context_dirs() {
                copy_from_dirs.entry(from.to_string()).or_default().extend(dirs.iter().cloned());
            }
            require_on_disk |= step.require_on_disk();
            nodes.push(BuildNode::new(step));
        }

        Ok(Self {
            alias: alias.to_string(),
            ctx,
            nodes,
            copy_from_dirs,
            last_config: ImageConfig::default(),
            require_on_disk,
            opts,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn nodes(&self) -> &[BuildNode] {
        &self.nodes
    }

    pub(crate) fn copy_from_dirs(&self) -> &BTreeMap<String, Vec<String>> {
        &self.copy_from_dirs
    }

    /// The config produced by the last build.
    pub fn image_config(&self) -> &ImageConfig {
        &self.last_config
    }

    /// Cache ID of the last node, which seeds the next stage.
    pub(crate) fn last_cache_id(&self) -> &str {
        self.nodes.last().map(BuildNode::cache_id).unwrap_or_default()
    }

    /// Pulls cached layers for committing nodes, stopping at the first
    /// miss. The FROM node is skipped; it pulls its own layers.
    pub async fn pull_cache_layers(&mut self, cache: &dyn CacheManager) {
        let force_commit = self.opts.force_commit;
        for node in self.nodes.iter_mut().skip(1) {
            if (node.has_commit() || force_commit) && !node.pull_cache_layers(cache).await {
                return;
            }
        }
    }

    /// Index of the last node of the unbroken chain of fetched committing
    /// nodes, or -1.
    pub fn latest_fetched(&self) -> isize {
        let mut latest = -1;
        for (i, node) in self.nodes.iter().enumerate().skip(1) {
            if node.has_commit() {
                if node.is_fetched() {
                    latest = i as isize;
                } else {
                    return latest;
                }
            }
        }
        latest
    }

    /// Builds every node in order. `shared` maps cache IDs to layers
    /// produced by earlier stages of the same plan.
    #[instrument(skip_all, fields(alias = %self.alias))]
    pub async fn build(
        &mut self,
        cache: &dyn CacheManager,
        shared: &mut DigestPairMap,
        last_stage: bool,
        copied_from: bool,
    ) -> Result<()> {
        for node in &mut self.nodes {
            if let Some(pairs) = shared.get(node.cache_id()) {
                info!("* Reusing digest pairs computed from earlier step {}", node.cache_id());
                node.reuse_pairs(pairs.clone());
            }
        }

        let modify_fs = self.require_on_disk || copied_from;
        if modify_fs && !self.opts.allow_modify_fs {
            return Err(TesseraError::ModifyFsNotAllowed { alias: self.alias.clone() });
        }

        let total = self.nodes.len();
        let mut config = ImageConfig::default();
        let mut diff_ids = Vec::new();
        let mut history = Vec::new();
        for i in 0..total {
            let opts = NodeOptions {
                skip_build: i > 0 && (i as isize) < self.latest_fetched(),
                force_commit: i == 0 || (last_stage && i == total - 1) || self.opts.force_commit,
                modify_fs,
            };

            let node = &mut self.nodes[i];
            info!("* Step {}/{} ({}) : {}", i + 1, total, opts, node.step());
            let built = node.build(&mut self.ctx, cache, &config, opts).await;
            config = built.map_err(|e| e.in_step(node.step()))?;

            for pair in node.digest_pairs() {
                diff_ids.push(pair.tar_digest.clone());
                history.push(History {
                    created: Some(chrono::Utc::now()),
                    created_by: format!("{}: {}", HISTORY_AUTHOR, node.step()),
                    author: HISTORY_AUTHOR.to_string(),
                    ..Default::default()
                });
            }
            if !node.digest_pairs().is_empty() {
                shared.insert(node.cache_id().to_string(), node.digest_pairs().to_vec());
            }
        }

        config.created = Some(chrono::Utc::now());
        config.history = history;
        config.rootfs.diff_ids = diff_ids;
        config.container_config = None;
        self.last_config = config;
        Ok(())
    }

    /// Stores the config blob and returns the manifest of the stage's
    /// image.
    pub fn distribution_manifest(&self) -> Result<DistributionManifest> {
        let data = self.last_config.to_json()?;
        let digest = crate::image::Digest::of_bytes(&data);

        let store = &self.ctx.image_store;
        let sandbox = store.sandbox_dir();
        let mut tmp = tempfile::Builder::new()
            .prefix("config")
            .tempfile_in(sandbox)
            .map_err(|e| TesseraError::io(sandbox, e))?;
        tmp.write_all(&data).map_err(|e| TesseraError::io(tmp.path(), e))?;
        let (_, path) = tmp.keep().map_err(|e| TesseraError::io(sandbox, e.error))?;
        store.layers.link_digest_from(&digest, &path)?;

        let config = Descriptor { media_type: MEDIA_TYPE_CONFIG.to_string(), size: data.len() as u64, digest };
        let layers = self
            .nodes
            .iter()
            .flat_map(|node| node.digest_pairs().iter().map(|pair| pair.gzip_descriptor.clone()))
            .collect();
        Ok(DistributionManifest::new(config, layers))
    }

    /// Saves the stage's image in the manifest store under `name`.
    pub fn save_manifest(&self, name: &ImageName) -> Result<DistributionManifest> {
        let manifest = self.distribution_manifest()?;
        self.ctx.image_store.manifests.save(name, &manifest)?;
        info!("* Saved manifest for {}", name);
        Ok(manifest)
    }

    /// Copies `dirs` out of the root into this stage's checkpoint
    /// directory, where later stages copy from.
    pub fn checkpoint(&self, dirs: &[String]) -> Result<()> {
        let target = self.ctx.copy_from_root(&self.alias);
        self.ctx.memfs.checkpoint(&target, dirs)?;
        Ok(())
    }

    /// Clears the root for the next stage. Paths that could not be removed
    /// are logged and skipped.
    pub fn cleanup(&self) {
        let skipped = self.ctx.memfs.remove();
        if !skipped.is_empty() {
            info!("* Left {} paths in place while cleaning up stage {}", skipped.len(), self.alias);
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(alias={},latestfetched={})", self.alias, self.latest_fetched())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::directive::RunCommand;
    use crate::builder::parser::parse_dockerfile;
    use crate::builder::runner::{CommandRunner, RunOptions};
    use crate::cache::CacheError;
    use crate::image::DigestPair;
    use crate::registry::NoopRegistry;
    use crate::storage::ImageStore;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    // Nodes: 0 FROM, 1 RUN (commit), 2 ENV, 3 RUN (commit).
    const DOCKERFILE: &str = "FROM scratch\nRUN make #!COMMIT\nENV X=1\nRUN install #!COMMIT\n";

    /// Hits, with an empty entry, only for the listed cache IDs.
    struct SelectiveCache {
        hits: HashSet<String>,
    }

    #[async_trait::async_trait]
    impl CacheManager for SelectiveCache {
        async fn pull_cache(&self, cache_id: &str) -> std::result::Result<Option<DigestPair>, CacheError> {
            if self.hits.contains(cache_id) {
                Ok(None)
            } else {
                Err(CacheError::NotFound { cache_id: cache_id.to_string() })
            }
        }

        fn push_cache(&self, _cache_id: &str, _pair: Option<DigestPair>) -> std::result::Result<(), CacheError> {
            Ok(())
        }

        async fn wait_for_push(&self) -> std::result::Result<(), CacheError> {
            Ok(())
        }
    }

    struct RefusingRunner;

    #[async_trait::async_trait]
    impl CommandRunner for RefusingRunner {
        async fn run(&self, command: &RunCommand, _options: &RunOptions) -> Result<()> {
            Err(TesseraError::CommandFailed { command: command.to_string(), reason: "refused".into() })
        }
    }

    fn stage(dir: &TempDir) -> BuildStage {
        let root = dir.path().join("root");
        let context = dir.path().join("context");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&context).unwrap();
        let store = Arc::new(ImageStore::new(&dir.path().join("store"), 4, 4).unwrap());
        let ctx = BuildContext::new(&root, &context, store.clone(), Arc::new(NoopRegistry::new(store)), Arc::new(RefusingRunner))
            .unwrap()
            .with_scan_delay(Duration::ZERO)
            .unwrap();
        let parsed = parse_dockerfile(DOCKERFILE, &HashMap::new()).unwrap();
        let opts = StageOptions { allow_modify_fs: true, force_commit: false };
        BuildStage::new(&ctx, "0", &parsed[0], "seed", opts).unwrap()
    }

    fn cache_for(stage: &BuildStage, nodes: &[usize]) -> SelectiveCache {
        SelectiveCache { hits: nodes.iter().map(|&i| stage.nodes[i].cache_id().to_string()).collect() }
    }

    #[tokio::test]
    async fn test_miss_breaks_chain_for_later_hits() {
        let dir = TempDir::new().unwrap();
        let mut stage = stage(&dir);
        let cache = cache_for(&stage, &[3]);

        stage.pull_cache_layers(&cache).await;
        assert!(!stage.nodes[1].is_cached());
        assert!(!stage.nodes[3].is_cached());
        assert_eq!(stage.latest_fetched(), -1);

        // Even when a later node is cached through another stage's layers,
        // the missing node 1 keeps it out of the chain.
        stage.nodes[3].reuse_pairs(Vec::new());
        assert_eq!(stage.latest_fetched(), -1);
    }

    #[tokio::test]
    async fn test_unbroken_chain_reaches_last_hit() {
        let dir = TempDir::new().unwrap();
        let mut stage = stage(&dir);
        let cache = cache_for(&stage, &[0, 1, 3]);

        stage.pull_cache_layers(&cache).await;
        assert!(!stage.nodes[0].is_cached());
        assert!(!stage.nodes[2].is_cached());
        assert_eq!(stage.latest_fetched(), 3);
    }

    #[tokio::test]
    async fn test_cached_chain_skips_execution() {
        let dir = TempDir::new().unwrap();
        let mut stage = stage(&dir);
        let cache = cache_for(&stage, &[1, 3]);
        stage.pull_cache_layers(&cache).await;

        let mut shared = DigestPairMap::new();
        stage.build(&cache, &mut shared, true, false).await.unwrap();
        assert_eq!(stage.image_config().config.get_env("X"), Some("1"));
        assert!(stage.image_config().history.is_empty());
    }

    #[tokio::test]
    async fn test_broken_chain_executes() {
        let dir = TempDir::new().unwrap();
        let mut stage = stage(&dir);
        let cache = cache_for(&stage, &[3]);
        stage.pull_cache_layers(&cache).await;

        let mut shared = DigestPairMap::new();
        let err = stage.build(&cache, &mut shared, true, false).await.unwrap_err();
        assert!(matches!(err, TesseraError::StepFailed { .. }), "{}", err);
    }
}
