//! Build plan: the stages of a Dockerfile, executed in order.

use super::context::BuildContext;
use super::parser::ParsedStage;
use super::stage::{BuildStage, StageOptions};
use crate::cache::CacheManager;
use crate::error::{Result, TesseraError};
use crate::image::{DigestPairMap, Digester, DistributionManifest, ImageName};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Plan-wide build settings.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Commit a layer after every step instead of only at `#!COMMIT`.
    pub force_commit: bool,
    /// Allow steps to write to the root directory.
    pub allow_modify_fs: bool,
    /// Stop after the stage with this alias.
    pub target_stage: Option<String>,
}

impl PlanOptions {
    // Changing the commit or filesystem mode changes what every layer
    // contains, so both feed the first cache ID.
    fn seed(&self) -> String {
        let mut digester = Digester::new();
        digester.update(concat!("tessera ", env!("CARGO_PKG_VERSION")).as_bytes());
        digester.update(
            format!("force_commit={} allow_modify_fs={}", self.force_commit, self.allow_modify_fs).as_bytes(),
        );
        digester.finish().hex().to_string()
    }
}

/// Named stages that may copy files from one another.
pub struct BuildPlan {
    base: BuildContext,
    target: ImageName,
    replicas: Vec<ImageName>,
    cache: Arc<dyn CacheManager>,
    stages: Vec<BuildStage>,
    /// Paths later stages copy out of each alias.
    copy_from_dirs: BTreeMap<String, Vec<String>>,
    digest_pairs: DigestPairMap,
    opts: PlanOptions,
}

impl BuildPlan {
    /// Validates the stages and converts them into nodes. No step runs.
    pub fn new(
        base: BuildContext,
        target: ImageName,
        replicas: Vec<ImageName>,
        cache: Arc<dyn CacheManager>,
        parsed: &[ParsedStage],
        opts: PlanOptions,
    ) -> Result<Self> {
        if parsed.is_empty() {
            return Err(TesseraError::InvalidPlan { reason: "no stages to build".to_string() });
        }

        let mut plan = Self {
            base,
            target,
            replicas,
            cache,
            stages: Vec::new(),
            copy_from_dirs: BTreeMap::new(),
            digest_pairs: DigestPairMap::new(),
            opts,
        };
        plan.process_stages(parsed)?;
        Ok(plan)
    }

    pub fn stages(&self) -> &[BuildStage] {
        &self.stages
    }

    fn process_stages(&mut self, parsed: &[ParsedStage]) -> Result<()> {
        let stage_opts =
            StageOptions { allow_modify_fs: self.opts.allow_modify_fs, force_commit: self.opts.force_commit };
        let declared: HashSet<&str> = parsed.iter().filter_map(ParsedStage::alias).collect();
        let mut seed = self.opts.seed();
        let mut aliases = HashSet::new();

        for (i, parsed_stage) in parsed.iter().enumerate() {
            let alias = match parsed_stage.alias().filter(|a| !a.is_empty()) {
                Some(alias) if aliases.contains(alias) => {
                    return Err(TesseraError::InvalidPlan { reason: format!("duplicate stage alias: {}", alias) })
                }
                Some(alias) if alias.parse::<i64>().is_ok() => {
                    return Err(TesseraError::InvalidPlan {
                        reason: format!("stage alias cannot be a number: {}", alias),
                    })
                }
                Some(alias) => alias.to_string(),
                None => i.to_string(),
            };

            let stage = BuildStage::new(&self.base, &alias, parsed_stage, &seed, stage_opts)?;
            if !stage.copy_from_dirs().is_empty() && !self.opts.allow_modify_fs {
                return Err(TesseraError::InvalidPlan {
                    reason: "must allow modifyfs for multi-stage dockerfiles with COPY --from".to_string(),
                });
            }

            for (from, dirs) in stage.copy_from_dirs() {
                let merged = self.copy_from_dirs.entry(from.clone()).or_default();
                let unique: BTreeSet<String> = merged.drain(..).chain(dirs.iter().cloned()).collect();
                merged.extend(unique);

                if aliases.contains(from.as_str()) {
                    continue;
                }
                if *from == alias || declared.contains(from.as_str()) {
                    return Err(TesseraError::InvalidPlan {
                        reason: format!("stage {} copies from {}, which is not built before it", alias, from),
                    });
                }
                let is_image = ImageName::parse_for_pull(from).map(|n| n.is_valid()).unwrap_or(false);
                if !is_image {
                    return Err(TesseraError::InvalidPlan { reason: format!("copy from nonexistent stage {}", from) });
                }

                info!("* Adding stage to pull {} for COPY --from", from);
                let remote = BuildStage::remote_image(&self.base, from, &seed, stage_opts)?;
                seed = remote.last_cache_id().to_string();
                aliases.insert(from.clone());
                self.stages.push(remote);
            }

            seed = stage.last_cache_id().to_string();
            aliases.insert(alias);
            self.stages.push(stage);
        }

        if let Some(target) = &self.opts.target_stage {
            if !aliases.contains(target) {
                return Err(TesseraError::InvalidPlan {
                    reason: format!("target stage not found in dockerfile {}", target),
                });
            }
        }
        Ok(())
    }

    /// Builds every stage up to the target, then saves the image manifest
    /// under the target name and every replica.
    #[instrument(skip_all, fields(target = %self.target))]
    pub async fn execute(&mut self) -> Result<DistributionManifest> {
        let total = self.stages.len();
        for stage in &mut self.stages {
            stage.pull_cache_layers(self.cache.as_ref()).await;
        }

        let mut last = 0;
        for k in 0..total {
            last = k;
            let is_target = self.opts.target_stage.as_deref() == Some(self.stages[k].alias());
            let stage = &mut self.stages[k];
            info!("* Stage {}/{} : {}", k + 1, total, stage);

            let copied_from = self.copy_from_dirs.contains_key(stage.alias());
            let last_stage = k == total - 1 || is_target;
            let built = stage.build(self.cache.as_ref(), &mut self.digest_pairs, last_stage, copied_from).await;
            built.map_err(|e| e.in_stage(stage.alias()))?;

            if self.opts.allow_modify_fs {
                if let Some(dirs) = self.copy_from_dirs.get(stage.alias()) {
                    stage.checkpoint(dirs).map_err(|e| e.in_stage(stage.alias()))?;
                }
                stage.cleanup();
            }

            if is_target {
                info!("Finished building target stage");
                break;
            }
        }

        if let Err(e) = self.cache.wait_for_push().await {
            error!("Failed to push cache: {}", e);
        }

        let stage = &self.stages[last];
        let manifest = stage.save_manifest(&self.target)?;
        for replica in &self.replicas {
            stage.save_manifest(replica)?;
        }

        let size: u64 = manifest.layers.iter().map(|layer| layer.size).sum();
        info!(total_image_size = size, "Computed total image size {}", size);
        Ok(manifest)
    }
}
