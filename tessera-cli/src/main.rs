use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Daemonless container image builder", long_about = None)]
struct Cli {
    /// Log level when RUST_LOG is unset (defaults to the configured level)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a Dockerfile
    Build {
        /// Build context directory
        context: String,

        /// Image name (e.g., "myapp:latest")
        #[arg(short, long)]
        tag: String,

        /// Dockerfile path, relative to the context
        #[arg(short, long, default_value = "Dockerfile")]
        file: String,

        /// Build arguments (KEY=VALUE)
        #[arg(long = "build-arg")]
        build_arg: Vec<String>,

        /// "implicit" commits after every RUN/COPY/ADD; "explicit" only at #!COMMIT
        #[arg(long, default_value = "implicit")]
        commit: String,

        /// Allow the build to modify the local filesystem
        #[arg(long)]
        modifyfs: bool,

        /// Stop after this stage
        #[arg(long)]
        target: Option<String>,

        /// Content store directory
        #[arg(long)]
        storage: Option<String>,

        /// Extra paths to leave out of layers (comma-separated)
        #[arg(long)]
        blacklist: Option<String>,

        /// Layer compression: no, speed, size or default
        #[arg(long)]
        compression: Option<String>,

        /// Keep the layer cache in this directory
        #[arg(long, conflicts_with_all = ["http_cache_addr", "redis_cache_addr"])]
        local_cache_dir: Option<String>,

        /// Keep the layer cache behind this HTTP address
        #[arg(long, conflicts_with = "redis_cache_addr")]
        http_cache_addr: Option<String>,

        /// Keep the layer cache in the Redis server at this address
        #[arg(long)]
        redis_cache_addr: Option<String>,

        /// Lifetime of Redis cache entries in seconds
        #[arg(long, default_value_t = tessera_core::config::DEFAULT_CACHE_TTL_SECS)]
        cache_ttl: u64,

        /// Push the image to these registries (comma-separated)
        #[arg(long)]
        push: Option<String>,

        /// Extra tags to save the image under
        #[arg(long)]
        replica: Vec<String>,

        /// Write the image as a `docker load` tar to this file
        #[arg(long)]
        dest: Option<String>,
    },

    /// Pull an image into the content store
    Pull {
        /// Image name (e.g., "alpine:3.19")
        image: String,

        /// Content store directory
        #[arg(long)]
        storage: Option<String>,
    },

    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = tessera_core::Config::load()?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    tessera_core::init_observability(&config.log_level);

    match cli.command {
        Commands::Build {
            context,
            tag,
            file,
            build_arg,
            commit,
            modifyfs,
            target,
            storage,
            blacklist,
            compression,
            local_cache_dir,
            http_cache_addr,
            redis_cache_addr,
            cache_ttl,
            push,
            replica,
            dest,
        } => {
            let build_args = build_arg
                .iter()
                .map(|arg| {
                    arg.split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .ok_or_else(|| anyhow::anyhow!("Invalid build arg format: {}", arg))
                })
                .collect::<Result<_>>()?;

            let args = commands::build::BuildArgs {
                context,
                tag,
                file,
                build_args,
                commit,
                modifyfs,
                target,
                storage,
                blacklist,
                compression,
                local_cache_dir,
                http_cache_addr,
                redis_cache_addr,
                cache_ttl,
                push,
                replicas: replica,
                dest,
            };
            commands::build(config, args).await?;
        }

        Commands::Pull { image, storage } => {
            if let Some(dir) = storage {
                config.storage_dir = dir.into();
            }
            commands::pull(config, &image).await?;
        }

        Commands::Version => commands::version(),
    }

    Ok(())
}
