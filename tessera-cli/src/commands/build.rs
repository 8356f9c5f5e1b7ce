//! Build command implementation for the tessera CLI.
//!
//! Folds the command-line flags into the configuration and runs one build.

use anyhow::{Context, Result};
use colored::Colorize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Instant;
use tessera_core::config::CacheBackendConfig;
use tessera_core::tario::CompressionLevel;
use tessera_core::{BuildRequest, BuildWorker, CommitMode, Config};

/// Flags of `tessera build`.
#[derive(Debug, Default)]
pub struct BuildArgs {
    pub context: String,
    pub tag: String,
    pub file: String,
    pub build_args: HashMap<String, String>,
    pub commit: String,
    pub modifyfs: bool,
    pub target: Option<String>,
    pub storage: Option<String>,
    pub blacklist: Option<String>,
    pub compression: Option<String>,
    pub local_cache_dir: Option<String>,
    pub http_cache_addr: Option<String>,
    pub redis_cache_addr: Option<String>,
    pub cache_ttl: u64,
    pub push: Option<String>,
    pub replicas: Vec<String>,
    pub dest: Option<String>,
}

/// Builds an image from a Dockerfile.
pub async fn build(config: Config, args: BuildArgs) -> Result<()> {
    let start_time = Instant::now();
    let config = apply_flags(config, &args)?;
    let request = build_request(&args)?;
    tracing::debug!(?request, "Build request");

    if !request.context_dir.exists() {
        anyhow::bail!("Build context not found: {}", request.context_dir.display());
    }

    println!(
        "{} Building {} from {}",
        "»".bold().blue(),
        args.tag.green(),
        request.context_dir.display().to_string().cyan()
    );

    let worker = BuildWorker::from_config(config).context("Failed to initialize builder")?;
    let manifest = worker.try_build(&request).await.context("Build failed")?;

    let size: u64 = manifest.layers.iter().map(|l| l.size).sum();
    println!();
    println!("{}", "Build completed successfully!".green().bold());
    println!();
    println!("  Name:        {}", args.tag.green());
    println!("  Config:      {}", manifest.config_digest().to_string().cyan());
    println!("  Layers:      {}", manifest.layers.len());
    println!("  Total size:  {:.1} MB", size as f64 / 1024.0 / 1024.0);
    println!("  Duration:    {}", format_duration(start_time.elapsed().as_secs_f64()).yellow());
    if let Some(dest) = &request.destination {
        println!("  Saved to:    {}", dest.display().to_string().yellow());
    }

    Ok(())
}

/// Flags override the configuration file.
fn apply_flags(mut config: Config, args: &BuildArgs) -> Result<Config> {
    if let Some(dir) = &args.storage {
        config.storage_dir = PathBuf::from(dir);
    }
    if let Some(list) = &args.blacklist {
        config.blacklist.extend(split_list(list));
    }
    if let Some(level) = &args.compression {
        config.compression = level.parse::<CompressionLevel>().map_err(|e| anyhow::anyhow!(e))?;
    }
    if let Some(dir) = &args.local_cache_dir {
        config.cache = CacheBackendConfig::Local { dir: PathBuf::from(dir) };
    } else if let Some(address) = &args.http_cache_addr {
        config.cache = CacheBackendConfig::Http { address: address.clone(), headers: BTreeMap::new() };
    } else if let Some(address) = &args.redis_cache_addr {
        config.cache = CacheBackendConfig::Redis { address: address.clone(), ttl_secs: args.cache_ttl };
    }
    Ok(config)
}

fn build_request(args: &BuildArgs) -> Result<BuildRequest> {
    let mut request = BuildRequest::new(&args.context, &args.tag);
    request.dockerfile = Some(PathBuf::from(&args.file));
    request.build_args = args.build_args.clone();
    request.commit = args.commit.parse::<CommitMode>()?;
    request.allow_modify_fs = args.modifyfs;
    request.target_stage = args.target.clone();
    request.push_registries = args.push.as_deref().map(split_list).unwrap_or_default();
    request.replicas = args.replicas.clone();
    request.destination = args.dest.as_ref().map(PathBuf::from);
    Ok(request)
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
}

/// Formats a duration in seconds to a human-readable string.
fn format_duration(secs: f64) -> String {
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let mins = (secs / 60.0).floor();
        let remaining_secs = secs - (mins * 60.0);
        format!("{:.0}m{:.0}s", mins, remaining_secs)
    }
}
