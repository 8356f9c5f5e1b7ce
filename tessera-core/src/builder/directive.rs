//! Parsed build-file directives.
//!
//! A directive carries its arguments already variable-substituted. The
//! build core never looks at raw build-file text again.

use std::fmt;

/// RUN/CMD/ENTRYPOINT command format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunCommand {
    /// Shell form: `RUN apt-get update`
    Shell(String),
    /// Exec form: `RUN ["apt-get", "update"]`
    Exec(Vec<String>),
}

impl RunCommand {
    /// The argument vector the image config stores for this command.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            RunCommand::Shell(cmd) => vec!["/bin/sh".into(), "-c".into(), cmd.clone()],
            RunCommand::Exec(argv) => argv.clone(),
        }
    }
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunCommand::Shell(cmd) => f.write_str(cmd),
            RunCommand::Exec(argv) => write!(f, "{:?}", argv),
        }
    }
}

/// Healthcheck settings; durations in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthcheckConfig {
    /// `["NONE"]` disables an inherited check.
    pub test: Vec<String>,
    pub interval: i64,
    pub timeout: i64,
    pub start_period: i64,
    pub retries: i64,
}

/// One directive and the arguments it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub kind: DirectiveKind,
    /// Substituted argument text, as it appears in history records and
    /// cache IDs.
    pub args: String,
    /// Annotated with `#!COMMIT`.
    pub commit: bool,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveKind {
    From {
        image: String,
        alias: Option<String>,
    },
    Run {
        command: RunCommand,
    },
    Copy {
        from_stage: Option<String>,
        chown: Option<String>,
        sources: Vec<String>,
        destination: String,
    },
    Add {
        chown: Option<String>,
        sources: Vec<String>,
        destination: String,
    },
    Env {
        vars: Vec<(String, String)>,
    },
    /// `value` is the default or build-arg override, resolved.
    Arg {
        name: String,
        value: Option<String>,
    },
    Cmd {
        command: RunCommand,
    },
    Entrypoint {
        command: RunCommand,
    },
    Label {
        labels: Vec<(String, String)>,
    },
    Expose {
        ports: Vec<String>,
    },
    User {
        user: String,
    },
    Volume {
        paths: Vec<String>,
    },
    Workdir {
        path: String,
    },
    Healthcheck {
        config: HealthcheckConfig,
    },
    StopSignal {
        signal: String,
    },
    Maintainer {
        author: String,
    },
}

impl Directive {
    pub fn new(kind: DirectiveKind, args: impl Into<String>) -> Self {
        Self { kind, args: args.into(), commit: false, line: 0 }
    }

    /// Upper-case instruction keyword.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            DirectiveKind::From { .. } => "FROM",
            DirectiveKind::Run { .. } => "RUN",
            DirectiveKind::Copy { .. } => "COPY",
            DirectiveKind::Add { .. } => "ADD",
            DirectiveKind::Env { .. } => "ENV",
            DirectiveKind::Arg { .. } => "ARG",
            DirectiveKind::Cmd { .. } => "CMD",
            DirectiveKind::Entrypoint { .. } => "ENTRYPOINT",
            DirectiveKind::Label { .. } => "LABEL",
            DirectiveKind::Expose { .. } => "EXPOSE",
            DirectiveKind::User { .. } => "USER",
            DirectiveKind::Volume { .. } => "VOLUME",
            DirectiveKind::Workdir { .. } => "WORKDIR",
            DirectiveKind::Healthcheck { .. } => "HEALTHCHECK",
            DirectiveKind::StopSignal { .. } => "STOPSIGNAL",
            DirectiveKind::Maintainer { .. } => "MAINTAINER",
        }
    }

    /// The stage alias and paths this directive copies out of a previous
    /// stage, if any.
    pub fn context_dirs(&self) -> Option<(&str, &[String])> {
        match &self.kind {
            DirectiveKind::Copy { from_stage: Some(alias), sources, .. } => {
                Some((alias.as_str(), sources.as_slice()))
            }
            _ => None,
        }
    }

    /// True when the directive cannot run against the in-memory view alone.
    pub fn require_on_disk(&self) -> bool {
        match &self.kind {
            DirectiveKind::Run { .. } => true,
            DirectiveKind::Copy { chown, .. } | DirectiveKind::Add { chown, .. } => chown.is_some(),
            _ => false,
        }
    }

    /// True when the directive may produce a layer and asked for one.
    pub fn has_commit(&self) -> bool {
        self.commit
            && matches!(
                self.kind,
                DirectiveKind::Run { .. } | DirectiveKind::Copy { .. } | DirectiveKind::Add { .. }
            )
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.name(), self.args)?;
        if self.commit {
            f.write_str(" #!COMMIT")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy(from_stage: Option<&str>, chown: Option<&str>) -> Directive {
        Directive::new(
            DirectiveKind::Copy {
                from_stage: from_stage.map(String::from),
                chown: chown.map(String::from),
                sources: vec!["/out".into()],
                destination: "/app/".into(),
            },
            "/out /app/",
        )
    }

    #[test]
    fn test_context_dirs_only_for_stage_copies() {
        assert_eq!(copy(None, None).context_dirs(), None);
        let directive = copy(Some("builder"), None);
        let (alias, paths) = directive.context_dirs().unwrap();
        assert_eq!(alias, "builder");
        assert_eq!(paths, &["/out".to_string()]);
    }

    #[test]
    fn test_require_on_disk() {
        let run = Directive::new(DirectiveKind::Run { command: RunCommand::Shell("true".into()) }, "true");
        assert!(run.require_on_disk());
        assert!(!copy(None, None).require_on_disk());
        assert!(copy(None, Some("1000:1000")).require_on_disk());
    }

    #[test]
    fn test_has_commit_ignores_metadata_directives() {
        let mut env = Directive::new(DirectiveKind::Env { vars: vec![("A".into(), "b".into())] }, "A=b");
        env.commit = true;
        assert!(!env.has_commit());

        let mut run = Directive::new(DirectiveKind::Run { command: RunCommand::Shell("ls".into()) }, "ls");
        assert!(!run.has_commit());
        run.commit = true;
        assert!(run.has_commit());
        assert_eq!(run.to_string(), "RUN ls #!COMMIT");
    }

    #[test]
    fn test_shell_command_argv() {
        assert_eq!(
            RunCommand::Shell("echo hi".into()).to_argv(),
            vec!["/bin/sh".to_string(), "-c".into(), "echo hi".into()]
        );
    }
}
