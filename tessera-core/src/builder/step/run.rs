use super::super::context::BuildContext;
use super::super::directive::{Directive, DirectiveKind};
use super::super::runner::RunOptions;
use super::directive_cache_id;
use crate::error::{Result, TesseraError};
use crate::fsutil::rel_path;
use crate::image::ImageConfig;
use crate::snapshot::resolve_chown;

/// RUN: executes a command against the root directory.
#[derive(Debug)]
pub struct RunStep {
    pub(super) directive: Directive,
    pub(super) cache_id: String,
    work_dir: String,
    user: String,
}

impl RunStep {
    pub fn new(directive: Directive, seed: &str) -> Self {
        let cache_id = directive_cache_id(seed, &directive);
        Self { directive, cache_id, work_dir: "/".to_string(), user: String::new() }
    }

    pub fn apply_config(&mut self, config: &ImageConfig) -> Result<()> {
        if !config.config.working_dir.is_empty() {
            self.work_dir = config.config.working_dir.clone();
        }
        self.user = config.config.user.clone();
        Ok(())
    }

    pub async fn execute(&mut self, ctx: &mut BuildContext, modify_fs: bool) -> Result<()> {
        let command = match &self.directive.kind {
            DirectiveKind::Run { command } => command.clone(),
            _ => return Err(TesseraError::Internal(format!("{} is not a RUN directive", self.directive))),
        };
        if !modify_fs {
            return Err(TesseraError::InvalidPlan {
                reason: format!("{} needs filesystem modification to be allowed", self.directive),
            });
        }

        ctx.must_scan = true;
        let cwd = ctx.root_dir.join(rel_path(&self.work_dir));
        std::fs::create_dir_all(&cwd).map_err(|e| TesseraError::io(&cwd, e))?;

        let user = if self.user.is_empty() { None } else { resolve_chown(&self.user, &ctx.root_dir)? };
        let options = RunOptions { cwd, env: ctx.stage_vars.clone(), user };
        ctx.runner.run(&command, &options).await
    }
}
