//! `tessera pull` command - Pull an image into the content store

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;
use tessera_core::registry::{OciConnector, RegistryConnector};
use tessera_core::{Config, ImageName, ImageStore};

/// Pull an image and every blob it references.
pub async fn pull(config: Config, image: &str) -> Result<()> {
    let name = ImageName::parse_for_pull(image).with_context(|| format!("Invalid image name: {}", image))?;
    println!("Pulling image: {}", name.to_string().green());

    let store = Arc::new(
        ImageStore::from_config(&config)
            .with_context(|| format!("Failed to open store at {}", config.storage_dir.display()))?,
    );
    let client = OciConnector::new(store).connect(name.registry(), name.repository());
    let manifest = client.pull(name.tag()).await.with_context(|| format!("Failed to pull {}", name))?;

    let size: u64 = manifest.layers.iter().map(|l| l.size).sum();
    println!("Image pulled successfully:");
    println!("  Config: {}", manifest.config_digest().to_string().cyan());
    println!("  Layers: {}", manifest.layers.len());
    println!("  Size:   {:.2} MB", size as f64 / 1024.0 / 1024.0);

    Ok(())
}
