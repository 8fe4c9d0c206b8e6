// QA Gate Runner
// Deterministic gates run as subprocesses through a seam; the prompt gate
// goes through the agent adapter and returns a structured verdict.

use crate::error::Result;
use async_trait::async_trait;
use foreman_agents::{AgentContext, AgentLimits, AgentRegistry, OutputTargets};
use foreman_types::{
    Finding, GateResult, GateStatus, PromptVerdict, QaOutcome, QaSpec, QaVerdict, Severity,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Seam for running one named deterministic gate inside the worktree.
/// Returns `None` when no tool is configured for the name.
#[async_trait]
pub trait GateCommandRunner: Send + Sync + 'static {
    async fn run_gate(
        &self,
        name: &str,
        worktree: &Path,
        wall_time: Duration,
    ) -> Option<GateResult>;
}

/// Production runner: gate name -> command line, executed in the worktree.
/// A missing binary or an unmapped gate yields `skipped` with a reason.
pub struct SystemGateRunner {
    commands: HashMap<String, Vec<String>>,
}

impl SystemGateRunner {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    pub fn with_command(mut self, gate: impl Into<String>, command: Vec<String>) -> Self {
        self.commands.insert(gate.into(), command);
        self
    }
}

impl Default for SystemGateRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GateCommandRunner for SystemGateRunner {
    async fn run_gate(
        &self,
        name: &str,
        worktree: &Path,
        wall_time: Duration,
    ) -> Option<GateResult> {
        let Some(command) = self.commands.get(name) else {
            return Some(GateResult {
                name: name.to_string(),
                status: GateStatus::Skipped,
                findings: Vec::new(),
                reason: Some("no tool configured for gate".to_string()),
            });
        };
        let (program, args) = command.split_first()?;

        let spawned = tokio::process::Command::new(program)
            .args(args)
            .current_dir(worktree)
            .output();

        let output = match tokio::time::timeout(wall_time, spawned).await {
            Err(_) => {
                return Some(GateResult {
                    name: name.to_string(),
                    status: GateStatus::Failed,
                    findings: vec![Finding {
                        severity: Severity::Error,
                        code: "gate_timeout".to_string(),
                        message: format!("gate exceeded {:?}", wall_time),
                        location: None,
                    }],
                    reason: None,
                });
            }
            Ok(Err(e)) => {
                // Tool not installed.
                return Some(GateResult {
                    name: name.to_string(),
                    status: GateStatus::Skipped,
                    findings: Vec::new(),
                    reason: Some(format!("failed to launch {}: {}", program, e)),
                });
            }
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            Some(GateResult {
                name: name.to_string(),
                status: GateStatus::Passed,
                findings: Vec::new(),
                reason: None,
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout
            } else {
                stderr
            };
            Some(GateResult {
                name: name.to_string(),
                status: GateStatus::Failed,
                findings: vec![Finding {
                    severity: Severity::Error,
                    code: "gate_failed".to_string(),
                    message: truncate(&detail, 2_000),
                    location: None,
                }],
                reason: None,
            })
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        trimmed.to_string()
    } else {
        let mut end = max;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

/// Runs the QA stage for one step and aggregates a verdict.
pub struct QaGateRunner {
    gates: Arc<dyn GateCommandRunner>,
    agents: Arc<AgentRegistry>,
    qa_wall_time: Duration,
}

impl QaGateRunner {
    pub fn new(
        gates: Arc<dyn GateCommandRunner>,
        agents: Arc<AgentRegistry>,
        qa_wall_time: Duration,
    ) -> Self {
        Self {
            gates,
            agents,
            qa_wall_time,
        }
    }

    /// Run deterministic gates and, when requested, the prompt gate.
    ///
    /// `verdict_path` is where the prompt agent's raw output is captured;
    /// `prompt_version` is the resolved identifier for the QA prompt.
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate(
        &self,
        protocol_id: &str,
        worktree: &Path,
        qa: &QaSpec,
        run_prompt_gate: bool,
        prompt_version: String,
        verdict_path: PathBuf,
        cancel: CancellationToken,
    ) -> Result<QaVerdict> {
        let mut gates = Vec::new();
        for gate_name in &qa.required_gates {
            let result = self
                .gates
                .run_gate(gate_name, worktree, self.qa_wall_time)
                .await
                .unwrap_or_else(|| GateResult {
                    name: gate_name.clone(),
                    status: GateStatus::Skipped,
                    findings: Vec::new(),
                    reason: Some("gate runner returned nothing".to_string()),
                });
            let status_text = format!("{:?}", result.status);
            foreman_observability::emit(
                tracing::Level::INFO,
                &foreman_observability::ProtocolEvent::new("qa", "gate_finished", protocol_id)
                    .gate(gate_name)
                    .detail(&status_text),
            );
            gates.push(result);
        }

        let prompt_verdict = if run_prompt_gate {
            Some(
                self.run_prompt_gate(worktree, qa, prompt_version, verdict_path, cancel)
                    .await?,
            )
        } else {
            None
        };

        let overall = aggregate(&gates, prompt_verdict.as_ref());
        Ok(QaVerdict {
            overall,
            gates,
            prompt_verdict,
        })
    }

    async fn run_prompt_gate(
        &self,
        worktree: &Path,
        qa: &QaSpec,
        prompt_version: String,
        verdict_path: PathBuf,
        cancel: CancellationToken,
    ) -> Result<PromptVerdict> {
        let adapter = self.agents.get(&qa.engine_id)?;
        let ctx = AgentContext {
            working_directory: worktree.to_path_buf(),
            prompt_ref: qa.prompt_ref.clone(),
            prompt_version,
            resolved_inputs: BTreeMap::new(),
            output_targets: OutputTargets {
                primary: verdict_path.clone(),
                aux: BTreeMap::new(),
            },
            limits: AgentLimits {
                wall_time: self.qa_wall_time,
                token_budget: None,
            },
            cancel,
        };

        let result = adapter.execute(ctx).await?;
        if !result.is_ok() {
            let message = result
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "qa agent failed".to_string());
            return Ok(PromptVerdict {
                verdict: QaOutcome::Fail,
                rationale: format!("qa agent did not produce a verdict: {}", message),
                findings: Vec::new(),
                action: None,
            });
        }

        let raw = tokio::fs::read_to_string(&verdict_path)
            .await
            .unwrap_or_default();
        Ok(parse_prompt_verdict(&raw).unwrap_or_else(|| PromptVerdict {
            verdict: QaOutcome::Fail,
            rationale: format!("unparseable qa verdict ({} bytes)", raw.len()),
            findings: Vec::new(),
            action: None,
        }))
    }
}

/// Parse a verdict from agent output: strict JSON first, then the first
/// fenced JSON block, then the first balanced object.
pub fn parse_prompt_verdict(raw: &str) -> Option<PromptVerdict> {
    let trimmed = raw.trim();
    if let Ok(verdict) = serde_json::from_str::<PromptVerdict>(trimmed) {
        return Some(verdict);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(verdict) = serde_json::from_str::<PromptVerdict>(after[..end].trim()) {
                return Some(verdict);
            }
        }
    }

    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in trimmed[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..start + offset + 1];
                    return serde_json::from_str::<PromptVerdict>(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Aggregate deterministic gates and the prompt verdict:
/// any failed required gate wins, warning findings floor the outcome at
/// `warn`, otherwise the prompt verdict decides.
fn aggregate(gates: &[GateResult], prompt: Option<&PromptVerdict>) -> QaOutcome {
    if gates.iter().any(|g| g.status == GateStatus::Failed) {
        return QaOutcome::Fail;
    }

    let warn_floor = gates.iter().any(|g| {
        g.findings
            .iter()
            .any(|f| matches!(f.severity, Severity::Warning | Severity::Error))
    });

    let mut overall = if warn_floor {
        QaOutcome::Warn
    } else {
        QaOutcome::Pass
    };

    if let Some(prompt) = prompt {
        overall = overall.worst(prompt.verdict);
    }
    overall
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed(name: &str) -> GateResult {
        GateResult {
            name: name.to_string(),
            status: GateStatus::Passed,
            findings: Vec::new(),
            reason: None,
        }
    }

    fn failed(name: &str) -> GateResult {
        GateResult {
            name: name.to_string(),
            status: GateStatus::Failed,
            findings: Vec::new(),
            reason: None,
        }
    }

    fn prompt(verdict: QaOutcome) -> PromptVerdict {
        PromptVerdict {
            verdict,
            rationale: "because".to_string(),
            findings: Vec::new(),
            action: None,
        }
    }

    #[test]
    fn failed_gate_overrides_prompt_pass() {
        let gates = vec![passed("lint"), failed("test")];
        assert_eq!(
            aggregate(&gates, Some(&prompt(QaOutcome::Pass))),
            QaOutcome::Fail
        );
    }

    #[test]
    fn warning_findings_floor_at_warn() {
        let gates = vec![GateResult {
            name: "lint".to_string(),
            status: GateStatus::Passed,
            findings: vec![Finding {
                severity: Severity::Warning,
                code: "unused".to_string(),
                message: "unused import".to_string(),
                location: Some("src/lib.rs:3".to_string()),
            }],
            reason: None,
        }];
        assert_eq!(
            aggregate(&gates, Some(&prompt(QaOutcome::Pass))),
            QaOutcome::Warn
        );
    }

    #[test]
    fn prompt_fail_wins_over_clean_gates() {
        let gates = vec![passed("lint")];
        assert_eq!(
            aggregate(&gates, Some(&prompt(QaOutcome::Fail))),
            QaOutcome::Fail
        );
    }

    #[test]
    fn skipped_gates_do_not_fail_the_step() {
        let gates = vec![GateResult {
            name: "typecheck".to_string(),
            status: GateStatus::Skipped,
            findings: Vec::new(),
            reason: Some("no tool configured for gate".to_string()),
        }];
        assert_eq!(aggregate(&gates, None), QaOutcome::Pass);
    }

    #[test]
    fn parses_strict_json_verdict() {
        let verdict = parse_prompt_verdict(
            r#"{"verdict":"warn","rationale":"minor issues","findings":[]}"#,
        )
        .unwrap();
        assert_eq!(verdict.verdict, QaOutcome::Warn);
    }

    #[test]
    fn parses_fenced_verdict_with_prose() {
        let raw = "Here is my assessment.\n```json\n{\"verdict\":\"fail\",\"rationale\":\"tests missing\",\"action\":\"re_plan\"}\n```\nThanks.";
        let verdict = parse_prompt_verdict(raw).unwrap();
        assert_eq!(verdict.verdict, QaOutcome::Fail);
        assert_eq!(verdict.action, Some(foreman_types::QaAction::RePlan));
    }

    #[test]
    fn parses_embedded_object() {
        let raw = "verdict follows {\"verdict\":\"pass\",\"rationale\":\"ok\"} end";
        let verdict = parse_prompt_verdict(raw).unwrap();
        assert_eq!(verdict.verdict, QaOutcome::Pass);
    }

    #[test]
    fn garbage_is_unparseable() {
        assert!(parse_prompt_verdict("no json here").is_none());
    }

    #[tokio::test]
    async fn unmapped_gate_is_skipped_with_reason() {
        let runner = SystemGateRunner::new();
        let temp = tempfile::tempdir().unwrap();
        let result = runner
            .run_gate("lint", temp.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.status, GateStatus::Skipped);
        assert!(result.reason.unwrap().contains("no tool configured"));
    }

    #[tokio::test]
    async fn missing_binary_is_skipped() {
        let runner = SystemGateRunner::new().with_command(
            "lint",
            vec!["definitely-not-a-real-binary-5309".to_string()],
        );
        let temp = tempfile::tempdir().unwrap();
        let result = runner
            .run_gate("lint", temp.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.status, GateStatus::Skipped);
    }

    #[tokio::test]
    async fn failing_command_fails_the_gate() {
        let runner = SystemGateRunner::new().with_command(
            "test",
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo 2 tests failed >&2; exit 1".to_string(),
            ],
        );
        let temp = tempfile::tempdir().unwrap();
        let result = runner
            .run_gate("test", temp.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.status, GateStatus::Failed);
        assert!(result.findings[0].message.contains("2 tests failed"));
    }
}
