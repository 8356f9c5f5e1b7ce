//! Build steps: one per directive.
//!
//! A step moves through four calls during a build: `apply_config` with the
//! config produced so far, `execute` unless a cache hit made it
//! unnecessary, `commit` when it is a layer boundary, and
//! `generate_config` to produce the config for the next step.

mod copy;
mod from;
mod metadata;
mod run;

pub use copy::CopyStep;
pub use from::FromStep;
pub use metadata::MetadataStep;
pub use run::RunStep;

use super::context::BuildContext;
use super::directive::{Directive, DirectiveKind};
use crate::error::{Result, TesseraError};
use crate::image::{Descriptor, DigestPair, Digester, DigestingWriter, ImageConfig, MEDIA_TYPE_LAYER};
use crate::tario;
use std::fmt;
use std::io::Write;
use tracing::info;

const COMMIT_SUFFIX: &str = "#!COMMIT";

/// A directive bound to its cache ID and build behaviour.
#[derive(Debug)]
pub enum Step {
    From(FromStep),
    Run(RunStep),
    Copy(CopyStep),
    Metadata(MetadataStep),
}

impl Step {
    /// Builds the step for `directive`. `seed` is the cache ID of the
    /// previous step, which chains every ID to all steps before it.
    pub fn new(directive: Directive, seed: &str, ctx: &BuildContext) -> Result<Self> {
        let step = match &directive.kind {
            DirectiveKind::From { .. } => Step::From(FromStep::new(directive, seed)?),
            DirectiveKind::Run { .. } => Step::Run(RunStep::new(directive, seed)),
            DirectiveKind::Copy { .. } | DirectiveKind::Add { .. } => {
                Step::Copy(CopyStep::new(directive, seed, &ctx.context_dir)?)
            }
            _ => Step::Metadata(MetadataStep::new(directive, seed)),
        };
        Ok(step)
    }

    pub fn directive(&self) -> &Directive {
        match self {
            Step::From(s) => &s.directive,
            Step::Run(s) => &s.directive,
            Step::Copy(s) => &s.directive,
            Step::Metadata(s) => &s.directive,
        }
    }

    pub fn cache_id(&self) -> &str {
        match self {
            Step::From(s) => &s.cache_id,
            Step::Run(s) => &s.cache_id,
            Step::Copy(s) => &s.cache_id,
            Step::Metadata(s) => &s.cache_id,
        }
    }

    pub fn has_commit(&self) -> bool {
        self.directive().has_commit()
    }

    pub fn require_on_disk(&self) -> bool {
        self.directive().require_on_disk()
    }

    /// The stage alias and paths this step copies from, if any.
    pub fn context_dirs(&self) -> Option<(&str, &[String])> {
        self.directive().context_dirs()
    }

    /// Takes in the config built so far, before execution.
    pub fn apply_config(&mut self, ctx: &mut BuildContext, config: &ImageConfig) -> Result<()> {
        match self {
            Step::From(_) => Ok(()),
            Step::Run(s) => s.apply_config(config),
            Step::Copy(s) => s.apply_config(config),
            Step::Metadata(s) => s.apply_config(ctx),
        }
    }

    /// Performs the directive's side effect. With `modify_fs` false, the
    /// root directory must stay untouched.
    pub async fn execute(&mut self, ctx: &mut BuildContext, modify_fs: bool) -> Result<()> {
        match self {
            Step::From(s) => s.execute(ctx, modify_fs).await,
            Step::Run(s) => s.execute(ctx, modify_fs).await,
            Step::Copy(s) => s.execute(ctx, modify_fs),
            Step::Metadata(_) => Ok(()),
        }
    }

    /// Captures the changes since the last commit as layers.
    pub fn commit(&mut self, ctx: &mut BuildContext) -> Result<Vec<DigestPair>> {
        match self {
            Step::From(s) => s.commit(),
            _ => Ok(commit_layer(ctx)?.into_iter().collect()),
        }
    }

    /// The config after this step.
    pub fn generate_config(&self, ctx: &mut BuildContext, config: &ImageConfig) -> Result<ImageConfig> {
        match self {
            Step::From(s) => s.generate_config(ctx),
            Step::Metadata(s) => s.generate_config(config),
            Step::Run(_) | Step::Copy(_) => Ok(config.clone()),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.directive().fmt(f)
    }
}

/// Hashes the seed with the directive text.
pub(crate) fn directive_cache_id(seed: &str, directive: &Directive) -> String {
    let mut digester = cache_digester(seed, directive);
    digester.update(commit_str(directive).as_bytes());
    digester.finish().hex().to_string()
}

pub(crate) fn cache_digester(seed: &str, directive: &Directive) -> Digester {
    let mut digester = Digester::new();
    digester.update(seed.as_bytes());
    digester.update(directive.name().as_bytes());
    digester.update(directive.args.as_bytes());
    digester
}

pub(crate) fn commit_str(directive: &Directive) -> &'static str {
    if directive.commit {
        COMMIT_SUFFIX
    } else {
        ""
    }
}

/// Writes the pending changes as a gzipped layer into the layer store.
///
/// A step that ran a command is diffed by scanning the root; otherwise the
/// queued copies describe the layer. Both are reset afterwards. Returns
/// `None` when there is nothing to commit.
pub(crate) fn commit_layer(ctx: &mut BuildContext) -> Result<Option<DigestPair>> {
    let by_scan = ctx.must_scan;
    if !by_scan && ctx.copy_ops.is_empty() {
        return Ok(None);
    }

    let sandbox = ctx.image_store.sandbox_dir().to_path_buf();
    let tmp = tempfile::Builder::new()
        .prefix("layer")
        .tempfile_in(&sandbox)
        .map_err(|e| TesseraError::io(&sandbox, e))?;
    let io_err = |e| TesseraError::io(tmp.path(), e);

    // tar -> sha256(tar) -> gzip -> sha256(gzip) -> file
    let gzip_out = DigestingWriter::new(tmp.as_file());
    let tar_out = DigestingWriter::new(tario::gzip_writer(gzip_out, ctx.compression));
    let mut builder = tar::Builder::new(tar_out);
    if by_scan {
        ctx.memfs.add_layer_by_scan(&mut builder)?;
    } else {
        let ops = std::mem::take(&mut ctx.copy_ops);
        ctx.memfs.add_layer_by_copy_ops(&ops, &mut builder)?;
    }

    let (encoder, tar_digest) = builder.into_inner().map_err(io_err)?.into_parts();
    let mut gzip_out = encoder.finish().map_err(io_err)?;
    gzip_out.flush().map_err(io_err)?;
    let size = gzip_out.written();
    let (file, gzip_digest) = gzip_out.into_parts();
    file.sync_all().map_err(io_err)?;

    ctx.image_store.layers.link_digest_from(&gzip_digest, tmp.path())?;
    ctx.must_scan = false;
    ctx.copy_ops.clear();

    info!("* Committed gzipped layer {} ({} bytes)", gzip_digest, size);
    Ok(Some(DigestPair {
        tar_digest,
        gzip_descriptor: Descriptor { media_type: MEDIA_TYPE_LAYER.to_string(), size, digest: gzip_digest },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::directive::RunCommand;

    #[test]
    fn test_cache_ids_chain_and_see_commit() {
        let mut run = Directive::new(DirectiveKind::Run { command: RunCommand::Shell("make".into()) }, "make");
        let plain = directive_cache_id("seed", &run);
        assert_eq!(plain, directive_cache_id("seed", &run));
        assert_ne!(plain, directive_cache_id("other", &run));

        run.commit = true;
        assert_ne!(plain, directive_cache_id("seed", &run));
        assert_eq!(plain.len(), 64);
    }
}
