use super::super::context::BuildContext;
use super::super::directive::{Directive, DirectiveKind};
use super::directive_cache_id;
use crate::error::Result;
use crate::fsutil::join_path;
use crate::image::{EmptyObject, Healthcheck, ImageConfig};

/// Directives that only change the image config or stage variables.
#[derive(Debug)]
pub struct MetadataStep {
    pub(super) directive: Directive,
    pub(super) cache_id: String,
}

impl MetadataStep {
    pub fn new(directive: Directive, seed: &str) -> Self {
        let cache_id = directive_cache_id(seed, &directive);
        Self { directive, cache_id }
    }

    /// ENV and ARG values become visible to later RUN steps.
    pub fn apply_config(&mut self, ctx: &mut BuildContext) -> Result<()> {
        match &self.directive.kind {
            DirectiveKind::Env { vars } => {
                ctx.stage_vars.extend(vars.iter().cloned());
            }
            DirectiveKind::Arg { name, value: Some(value) } => {
                ctx.stage_vars.insert(name.clone(), value.clone());
            }
            _ => {}
        }
        Ok(())
    }

    pub fn generate_config(&self, config: &ImageConfig) -> Result<ImageConfig> {
        let mut config = config.clone();
        let c = &mut config.config;

        match &self.directive.kind {
            DirectiveKind::Env { vars } => {
                for (key, value) in vars {
                    c.set_env(key, value);
                }
            }
            DirectiveKind::Cmd { command } => c.cmd = command.to_argv(),
            DirectiveKind::Entrypoint { command } => {
                // An inherited CMD no longer applies to a new entrypoint.
                c.entrypoint = command.to_argv();
                c.cmd.clear();
            }
            DirectiveKind::Label { labels } => c.labels.extend(labels.iter().cloned()),
            DirectiveKind::Expose { ports } => {
                c.exposed_ports.extend(ports.iter().map(|p| (p.clone(), EmptyObject {})));
            }
            DirectiveKind::User { user } => c.user = user.clone(),
            DirectiveKind::Volume { paths } => {
                c.volumes.extend(paths.iter().map(|p| (p.clone(), EmptyObject {})));
            }
            DirectiveKind::Workdir { path } => {
                let base = if c.working_dir.is_empty() { "/" } else { c.working_dir.as_str() };
                c.working_dir = if path.starts_with('/') { join_path("/", path) } else { join_path(base, path) };
            }
            DirectiveKind::Healthcheck { config: hc } => {
                c.healthcheck = Some(Healthcheck {
                    test: hc.test.clone(),
                    interval: hc.interval,
                    timeout: hc.timeout,
                    start_period: hc.start_period,
                    retries: hc.retries,
                });
            }
            DirectiveKind::StopSignal { signal } => c.stop_signal = signal.clone(),
            DirectiveKind::Maintainer { author } => config.author = author.clone(),
            DirectiveKind::Arg { .. }
            | DirectiveKind::From { .. }
            | DirectiveKind::Run { .. }
            | DirectiveKind::Copy { .. }
            | DirectiveKind::Add { .. } => {}
        }
        Ok(config)
    }
}
