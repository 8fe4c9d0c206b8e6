use async_trait::async_trait;
use std::path::Path;

use crate::{GitError, Result};

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Seam for running git. The orchestrator never shells out directly, so
/// tests can substitute a scripted executor.
#[async_trait]
pub trait GitExecutor: Send + Sync + 'static {
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput>;

    /// Like `run`, but a non-zero exit becomes an error.
    async fn run_checked(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        let output = self.run(cwd, args).await?;
        if output.success {
            Ok(output)
        } else {
            Err(GitError::CommandFailed {
                op: args.first().copied().unwrap_or("<none>").to_string(),
                detail: if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                },
            })
        }
    }
}

/// Production executor backed by the system `git` binary.
pub struct SystemGit;

#[async_trait]
impl GitExecutor for SystemGit {
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        tracing::debug!(cwd = %cwd.display(), ?args, "running git");
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
