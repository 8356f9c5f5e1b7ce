use super::super::context::BuildContext;
use super::super::directive::{Directive, DirectiveKind};
use crate::error::{Result, TesseraError};
use crate::image::{DigestPair, DistributionManifest, ImageConfig, ImageName};
use std::io::Read;
use tracing::info;

/// FROM: the base image of a stage.
#[derive(Debug)]
pub struct FromStep {
    pub(super) directive: Directive,
    pub(super) cache_id: String,
    image: ImageName,
    manifest: Option<DistributionManifest>,
    config: Option<ImageConfig>,
}

impl FromStep {
    pub fn new(directive: Directive, seed: &str) -> Result<Self> {
        let raw = match &directive.kind {
            DirectiveKind::From { image, .. } => image.clone(),
            _ => return Err(TesseraError::Internal(format!("{} is not a FROM directive", directive))),
        };
        let image = ImageName::parse_for_pull(&raw)?;

        let mut digester = crate::image::Digester::new();
        digester.update(seed.as_bytes());
        digester.update(b"FROM");
        digester.update(raw.as_bytes());
        let cache_id = digester.finish().hex().to_string();

        Ok(Self { directive, cache_id, image, manifest: None, config: None })
    }

    pub fn image(&self) -> &ImageName {
        &self.image
    }

    /// Pulls the base image and merges its layers into the view, extracting
    /// them onto the root when `modify_fs` is set.
    pub async fn execute(&mut self, ctx: &mut BuildContext, modify_fs: bool) -> Result<()> {
        if self.image.is_scratch() {
            info!("* Building from scratch");
            self.config = Some(ImageConfig::default());
            return Ok(());
        }

        let client = ctx.registry.connect(self.image.registry(), self.image.repository());
        let manifest = client.pull(self.image.tag()).await?;

        let mut data = Vec::new();
        ctx.image_store
            .layers
            .reader_of(manifest.config_digest())?
            .read_to_end(&mut data)
            .map_err(|e| TesseraError::io(ctx.image_store.layers.path_of(manifest.config_digest()), e))?;
        let config = ImageConfig::from_json(&data)?;
        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(TesseraError::InvalidConfig {
                reason: format!(
                    "image {} has {} diff ids for {} layers",
                    self.image,
                    config.rootfs.diff_ids.len(),
                    manifest.layers.len()
                ),
            });
        }

        for layer in &manifest.layers {
            let path = ctx.image_store.layers.path_of(&layer.digest);
            ctx.memfs.update_from_tar_path(&path, modify_fs)?;
        }
        info!("* Applied {} layers of {}", manifest.layers.len(), self.image);

        self.manifest = Some(manifest);
        self.config = Some(config);
        Ok(())
    }

    /// The base image's own layers.
    pub fn commit(&self) -> Result<Vec<DigestPair>> {
        let (manifest, config) = match (&self.manifest, &self.config) {
            (Some(manifest), Some(config)) => (manifest, config),
            (None, Some(_)) => return Ok(Vec::new()),
            _ => {
                return Err(TesseraError::Internal(format!("{} committed before execution", self.directive)))
            }
        };
        Ok(config
            .rootfs
            .diff_ids
            .iter()
            .zip(&manifest.layers)
            .map(|(diff_id, layer)| DigestPair { tar_digest: diff_id.clone(), gzip_descriptor: layer.clone() })
            .collect())
    }

    /// The base image's config. Its environment seeds the stage variables.
    pub fn generate_config(&self, ctx: &mut BuildContext) -> Result<ImageConfig> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| TesseraError::Internal(format!("{} has no base config", self.directive)))?;
        ctx.stage_vars.extend(config.config.env_map());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from(image: &str) -> Directive {
        Directive::new(DirectiveKind::From { image: image.into(), alias: None }, image)
    }

    #[test]
    fn test_cache_id_depends_on_image() {
        let a = FromStep::new(from("alpine:3.19"), "seed").unwrap();
        let b = FromStep::new(from("alpine:3.18"), "seed").unwrap();
        assert_ne!(a.cache_id, b.cache_id);
        assert_eq!(a.image().registry(), crate::image::DOCKER_HUB_REGISTRY);
        assert_eq!(a.image().repository(), "library/alpine");
    }

    #[test]
    fn test_commit_requires_execution() {
        let step = FromStep::new(from("scratch"), "seed").unwrap();
        assert!(step.image().is_scratch());
        assert!(step.commit().is_err());
    }
}
