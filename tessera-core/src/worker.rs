//! Build entry point shared by the CLI and long-lived worker processes.
//!
//! A [`BuildWorker`] owns the content store and services for the process
//! and runs one build at a time.

use crate::builder::{parse_dockerfile_file, BuildContext, BuildPlan, CommandRunner, PlanOptions, ShellRunner};
use crate::cache;
use crate::config::Config;
use crate::error::{Result, TesseraError};
use crate::fsutil::is_descendant;
use crate::image::{write_image_tar, DistributionManifest, ImageName};
use crate::paths::INTERNAL_DIR;
use crate::registry::{OciConnector, RegistryConnector};
use crate::storage::{ImageStore, ManifestStore};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument};

const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// When layers are committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommitMode {
    /// After every RUN, COPY and ADD.
    #[default]
    Implicit,
    /// Only at steps annotated with `#!COMMIT`.
    Explicit,
}

impl FromStr for CommitMode {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "implicit" => Ok(CommitMode::Implicit),
            "explicit" => Ok(CommitMode::Explicit),
            other => Err(TesseraError::InvalidConfig { reason: format!("invalid commit option: {}", other) }),
        }
    }
}

impl fmt::Display for CommitMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommitMode::Implicit => f.write_str("implicit"),
            CommitMode::Explicit => f.write_str("explicit"),
        }
    }
}

/// One build, as requested on the command line.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub context_dir: PathBuf,
    /// Relative to the context directory unless absolute.
    pub dockerfile: Option<PathBuf>,
    /// `[registry/]repository:tag` of the result.
    pub tag: String,
    pub build_args: HashMap<String, String>,
    pub commit: CommitMode,
    pub allow_modify_fs: bool,
    pub target_stage: Option<String>,
    /// Registries to push the result to. The first also receives cache
    /// layers.
    pub push_registries: Vec<String>,
    /// Extra names the result is saved under.
    pub replicas: Vec<String>,
    /// Write a `docker load` tar of the result here.
    pub destination: Option<PathBuf>,
    /// Filesystem root the build runs against.
    pub root_dir: PathBuf,
}

impl BuildRequest {
    pub fn new(context_dir: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self {
            context_dir: context_dir.into(),
            dockerfile: None,
            tag: tag.into(),
            build_args: HashMap::new(),
            commit: CommitMode::default(),
            allow_modify_fs: false,
            target_stage: None,
            push_registries: Vec::new(),
            replicas: Vec::new(),
            destination: None,
            root_dir: PathBuf::from("/"),
        }
    }

    /// The target name, moved to the first push registry if there is one.
    pub fn target_name(&self) -> Result<ImageName> {
        if self.tag.is_empty() {
            return Err(TesseraError::InvalidConfig {
                reason: "please specify a target image name: tessera build -t <repo>:<tag> <context>".to_string(),
            });
        }
        let name = ImageName::parse(&self.tag)?;
        Ok(match self.push_registries.first() {
            Some(registry) => name.with_registry(registry),
            None => name,
        })
    }
}

/// Runs builds against one content store, one at a time.
pub struct BuildWorker {
    config: Config,
    store: Arc<ImageStore>,
    registry: Arc<dyn RegistryConnector>,
    runner: Arc<dyn CommandRunner>,
    building: AtomicBool,
}

// Clears the busy flag when a build ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl BuildWorker {
    pub fn new(
        config: Config,
        store: Arc<ImageStore>,
        registry: Arc<dyn RegistryConnector>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self { config, store, registry, runner, building: AtomicBool::new(false) }
    }

    /// A worker with the store from `config`, real registries and a shell.
    pub fn from_config(config: Config) -> Result<Self> {
        let store_dir = config.storage_dir.to_string_lossy().into_owned();
        if is_descendant(&store_dir, INTERNAL_DIR) {
            return Err(TesseraError::InvalidConfig {
                reason: format!("storage dir cannot be under internal dir {}", INTERNAL_DIR),
            });
        }
        let store = Arc::new(ImageStore::from_config(&config)?);
        let registry = Arc::new(OciConnector::new(store.clone()));
        Ok(Self::new(config, store, registry, Arc::new(ShellRunner)))
    }

    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    pub fn is_building(&self) -> bool {
        self.building.load(Ordering::SeqCst)
    }

    /// Runs `request` unless another build is in progress, in which case
    /// it fails at once with [`TesseraError::WorkerBusy`].
    pub async fn try_build(&self, request: &BuildRequest) -> Result<DistributionManifest> {
        if self.building.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(TesseraError::WorkerBusy);
        }
        let _guard = BusyGuard(&self.building);
        self.build(request).await
    }

    #[instrument(skip_all, fields(tag = %request.tag))]
    async fn build(&self, request: &BuildRequest) -> Result<DistributionManifest> {
        info!("Starting tessera build (version={})", env!("CARGO_PKG_VERSION"));
        let target = request.target_name()?;
        self.clean_manifest(&target)?;

        let context_dir = std::fs::canonicalize(&request.context_dir)
            .map_err(|e| TesseraError::io(&request.context_dir, e))?;
        let dockerfile = context_dir.join(request.dockerfile.as_deref().unwrap_or(Path::new(DEFAULT_DOCKERFILE)));
        let stages = parse_dockerfile_file(&dockerfile, &request.build_args)?;

        let ctx = BuildContext::new(
            &request.root_dir,
            &context_dir,
            self.store.clone(),
            self.registry.clone(),
            self.runner.clone(),
        )?
        .with_blacklist(&self.config.blacklist)?
        .with_scan_delay(self.config.scan_delay())?
        .with_compression(self.config.compression);

        let cache_registry = if request.push_registries.is_empty() {
            None
        } else {
            Some(self.registry.connect(target.registry(), target.repository()))
        };
        let cache = cache::from_config(&self.config, self.store.clone(), cache_registry)?;

        let replicas = request
            .replicas
            .iter()
            .map(|r| ImageName::parse(r).map(|name| name.with_registry(target.registry())))
            .collect::<Result<Vec<_>>>()?;
        let opts = PlanOptions {
            force_commit: request.commit == CommitMode::Implicit,
            allow_modify_fs: request.allow_modify_fs,
            target_stage: request.target_stage.clone(),
        };
        let mut plan = BuildPlan::new(ctx, target.clone(), replicas, cache, &stages, opts)?;
        let manifest = plan.execute().await?;
        info!("Successfully built image {}", target.short_name());

        for registry in &request.push_registries {
            let name = target.clone().with_registry(registry);
            info!("Pushing {}", name);
            self.registry.connect(name.registry(), name.repository()).push(name.tag()).await?;
        }

        if let Some(dest) = &request.destination {
            let file = std::fs::File::create(dest).map_err(|e| TesseraError::io(dest, e))?;
            write_image_tar(&self.store, &target, std::io::BufWriter::new(file))?;
            info!("Saved image tar to {}", dest.display());
        }

        info!("Finished building {}", target.short_name());
        Ok(manifest)
    }

    // A failed build must not leave an older image under the same name.
    fn clean_manifest(&self, name: &ImageName) -> Result<()> {
        if self.store.manifests.contains_image(name) {
            self.store.manifests.remove_store_file(&ManifestStore::key(name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RunCommand;
    use crate::builder::RunOptions;
    use crate::registry::NoopRegistry;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    // Blocks every command until released.
    struct GateRunner {
        started: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl CommandRunner for GateRunner {
        async fn run(&self, _command: &RunCommand, _options: &RunOptions) -> Result<()> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    fn worker(dir: &TempDir, runner: Arc<dyn CommandRunner>) -> BuildWorker {
        let config = Config { storage_dir: dir.path().join("store"), scan_delay_ms: 0, ..Default::default() };
        let store = Arc::new(ImageStore::from_config(&config).unwrap());
        BuildWorker::new(config, store.clone(), Arc::new(NoopRegistry::new(store)), runner)
    }

    #[test]
    fn test_commit_mode_parsing() {
        assert_eq!("implicit".parse::<CommitMode>().unwrap(), CommitMode::Implicit);
        assert_eq!("explicit".parse::<CommitMode>().unwrap(), CommitMode::Explicit);
        assert!("sometimes".parse::<CommitMode>().is_err());
    }

    #[test]
    fn test_target_name_moves_to_push_registry() {
        let mut request = BuildRequest::new("/ctx", "team/app:1.0");
        assert_eq!(request.target_name().unwrap().registry(), "");
        request.push_registries = vec!["registry.example.com".into()];
        let name = request.target_name().unwrap();
        assert_eq!(name.registry(), "registry.example.com");
        assert_eq!(name.repository(), "team/app");

        request.tag.clear();
        assert!(request.target_name().is_err());
    }

    #[test]
    fn test_storage_under_internal_dir_rejected() {
        let config = Config { storage_dir: PathBuf::from(INTERNAL_DIR).join("store"), ..Default::default() };
        assert!(matches!(BuildWorker::from_config(config), Err(TesseraError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_build_is_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let context = dir.path().join("context");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&context).unwrap();
        std::fs::write(context.join("Dockerfile"), "FROM scratch\nRUN true\n").unwrap();

        let runner = Arc::new(GateRunner { started: Notify::new(), release: Notify::new() });
        let worker = Arc::new(worker(&dir, runner.clone()));
        let mut request = BuildRequest::new(&context, "app:latest");
        request.allow_modify_fs = true;
        request.root_dir = root;

        let first = {
            let worker = worker.clone();
            let request = request.clone();
            tokio::spawn(async move { worker.try_build(&request).await })
        };
        runner.started.notified().await;
        assert!(worker.is_building());
        assert!(matches!(worker.try_build(&request).await, Err(TesseraError::WorkerBusy)));

        runner.release.notify_one();
        let manifest = tokio::time::timeout(Duration::from_secs(30), first).await.unwrap().unwrap().unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert!(!worker.is_building());
        assert!(worker.store().manifests.contains_image(&ImageName::parse("app:latest").unwrap()));
    }
}
