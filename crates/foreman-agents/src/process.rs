use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::{
    AgentAdapter, AgentAdapterError, AgentContext, AgentErrorInfo, AgentResult, AgentStatus,
    Result,
};

async fn drain_into<R: AsyncRead + Unpin>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf
                .lock()
                .expect("capture buffer poisoned")
                .extend_from_slice(&chunk[..n]),
        }
    }
}

fn snapshot(buf: &Arc<Mutex<Vec<u8>>>) -> Vec<u8> {
    buf.lock().expect("capture buffer poisoned").clone()
}

/// Rough chars-per-token divisor used when an engine reports no metering.
const TOKEN_ESTIMATE_DIVISOR: u64 = 4;

/// Adapter that runs an engine as a local process inside the worktree.
///
/// The engine binary receives the prompt reference and resolved inputs via
/// environment variables and is expected to write its result to stdout;
/// stdout is captured into the primary output target. Declared aux outputs
/// are written by the engine itself at the paths passed in the environment.
pub struct ProcessAdapter {
    command: String,
    base_args: Vec<String>,
}

impl ProcessAdapter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            base_args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    fn env_for(ctx: &AgentContext) -> Vec<(String, String)> {
        let mut env = vec![
            ("FOREMAN_PROMPT_REF".to_string(), ctx.prompt_ref.clone()),
            (
                "FOREMAN_PROMPT_VERSION".to_string(),
                ctx.prompt_version.clone(),
            ),
            (
                "FOREMAN_OUTPUT_PRIMARY".to_string(),
                ctx.output_targets.primary.display().to_string(),
            ),
        ];
        for (name, path) in &ctx.resolved_inputs {
            env.push((
                format!("FOREMAN_INPUT_{}", name.to_uppercase().replace('-', "_")),
                path.display().to_string(),
            ));
        }
        for (name, path) in &ctx.output_targets.aux {
            env.push((
                format!("FOREMAN_OUTPUT_{}", name.to_uppercase().replace('-', "_")),
                path.display().to_string(),
            ));
        }
        env
    }

    async fn write_primary(path: &PathBuf, bytes: &[u8]) -> Result<u64> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn aux_bytes(ctx: &AgentContext) -> u64 {
        let mut total = 0u64;
        for path in ctx.output_targets.aux.values() {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                total += meta.len();
            }
        }
        total
    }

    fn errored(
        ctx: &AgentContext,
        status: AgentStatus,
        stdout_bytes: u64,
        class: &str,
        message: String,
    ) -> AgentResult {
        AgentResult {
            status,
            stdout_bytes_written: stdout_bytes,
            aux_bytes_written: 0,
            tokens_used: stdout_bytes / TOKEN_ESTIMATE_DIVISOR,
            cost_estimate: 0.0,
            prompt_version: ctx.prompt_version.clone(),
            error: Some(AgentErrorInfo {
                class: class.to_string(),
                message,
            }),
        }
    }
}

#[async_trait]
impl AgentAdapter for ProcessAdapter {
    async fn execute(&self, ctx: AgentContext) -> Result<AgentResult> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.base_args)
            .current_dir(&ctx.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in Self::env_for(&ctx) {
            command.env(key, value);
        }

        tracing::info!(
            command = %self.command,
            prompt_version = %ctx.prompt_version,
            cwd = %ctx.working_directory.display(),
            "spawning engine process"
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(Self::errored(
                    &ctx,
                    AgentStatus::TransientError,
                    0,
                    "spawn",
                    format!("failed to spawn {}: {}", self.command, e),
                ));
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentAdapterError::CaptureFailed("stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentAdapterError::CaptureFailed("stderr not piped".to_string()))?;

        // Readers run on their own tasks so partial output survives
        // cancellation and timeouts.
        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = tokio::spawn(drain_into(stdout, stdout_buf.clone()));
        let stderr_task = tokio::spawn(drain_into(stderr, stderr_buf.clone()));

        enum Wakeup {
            Exited(std::io::Result<std::process::ExitStatus>),
            Cancelled,
            TimedOut,
        }

        let wakeup = tokio::select! {
            exit = child.wait() => Wakeup::Exited(exit),
            _ = ctx.cancel.cancelled() => Wakeup::Cancelled,
            _ = tokio::time::sleep(ctx.limits.wall_time) => Wakeup::TimedOut,
        };

        let exit = match wakeup {
            Wakeup::Exited(exit) => exit,
            interrupted => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                // Partial stdout is still captured so the step can flag it.
                let partial = snapshot(&stdout_buf);
                let written = Self::write_primary(&ctx.output_targets.primary, &partial).await?;
                let (class, message) = match interrupted {
                    Wakeup::Cancelled => ("cancelled", "cancellation requested".to_string()),
                    _ => (
                        "timeout",
                        format!("wall time limit {:?} exceeded", ctx.limits.wall_time),
                    ),
                };
                return Ok(Self::errored(
                    &ctx,
                    AgentStatus::TransientError,
                    written,
                    class,
                    message,
                ));
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let stdout_bytes =
            Self::write_primary(&ctx.output_targets.primary, &snapshot(&stdout_buf)).await?;
        let aux_bytes = Self::aux_bytes(&ctx).await;
        let stderr_text = String::from_utf8_lossy(&snapshot(&stderr_buf)).to_string();

        match exit {
            Ok(status) if status.success() => Ok(AgentResult {
                status: AgentStatus::Ok,
                stdout_bytes_written: stdout_bytes,
                aux_bytes_written: aux_bytes,
                tokens_used: (stdout_bytes + aux_bytes) / TOKEN_ESTIMATE_DIVISOR,
                cost_estimate: 0.0,
                prompt_version: ctx.prompt_version.clone(),
                error: None,
            }),
            Ok(status) => {
                let class = if status.code().is_none() {
                    // Killed by signal
                    "signal"
                } else {
                    "exit_status"
                };
                Ok(Self::errored(
                    &ctx,
                    AgentStatus::PermanentError,
                    stdout_bytes,
                    class,
                    format!("engine exited with {}: {}", status, stderr_text.trim()),
                ))
            }
            Err(e) => Ok(Self::errored(
                &ctx,
                AgentStatus::TransientError,
                stdout_bytes,
                "io",
                e.to_string(),
            )),
        }
    }
}
