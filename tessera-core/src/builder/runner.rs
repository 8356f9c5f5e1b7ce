//! Command execution for RUN steps.

use super::directive::RunCommand;
use crate::error::{Result, TesseraError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Where and how a RUN command executes.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: PathBuf,
    /// Added on top of the builder's own environment.
    pub env: BTreeMap<String, String>,
    /// `(uid, gid)` to run as; the builder's own user if unset.
    pub user: Option<(u32, u32)>,
}

/// Runs build commands. Swappable so builds can be exercised without a
/// shell.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &RunCommand, options: &RunOptions) -> Result<()>;
}

/// Runs commands as child processes: shell form through `sh -c`, exec form
/// directly. Output goes to the builder's own stdout and stderr.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &RunCommand, options: &RunOptions) -> Result<()> {
        let mut cmd = match command {
            RunCommand::Shell(script) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                cmd
            }
            RunCommand::Exec(argv) => {
                let (program, args) = argv.split_first().ok_or_else(|| TesseraError::CommandFailed {
                    command: command.to_string(),
                    reason: "empty command".into(),
                })?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };

        cmd.current_dir(&options.cwd)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some((uid, gid)) = options.user {
            cmd.uid(uid).gid(gid);
        }

        info!("* Running {}", command);
        debug!(cwd = %options.cwd.display(), user = ?options.user, "Spawning build command");
        let status = cmd.status().await.map_err(|e| TesseraError::CommandFailed {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

        if !status.success() {
            return Err(TesseraError::CommandFailed {
                command: command.to_string(),
                reason: format!("exited with {}", status),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_shell_runs_in_cwd_with_env() {
        let dir = TempDir::new().unwrap();
        let options = RunOptions {
            cwd: dir.path().to_path_buf(),
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            user: None,
        };
        ShellRunner
            .run(&RunCommand::Shell("echo $GREETING > out.txt".into()), &options)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let options = RunOptions { cwd: dir.path().to_path_buf(), ..Default::default() };
        let err = ShellRunner.run(&RunCommand::Shell("exit 3".into()), &options).await.unwrap_err();
        assert!(matches!(err, TesseraError::CommandFailed { .. }));

        let err = ShellRunner.run(&RunCommand::Exec(vec![]), &options).await.unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }
}
