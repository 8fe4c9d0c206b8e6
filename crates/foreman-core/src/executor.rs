// Step Executor
// Reserve -> resolve -> budget check -> run agent -> capture artifacts ->
// QA -> feedback. Reservation and state mutation take the step board write
// lock; the agent call itself runs unlocked so parallel-group members can
// overlap.

use crate::engine::ProtocolEngine;
use crate::error::{ForemanError, Result};
use crate::feedback::{FeedbackOutcome, FeedbackRouter};
use crate::policy::RetryDecision;
use foreman_agents::{
    AgentContext, AgentLimits, AgentResult, AgentStatus, ErrorClass, OutputTargets,
};
use foreman_types::{
    ArtifactKind, ArtifactRecord, ClarificationScope, EventCategory, QaPolicy, QaVerdict, StepSpec,
    StepStatus,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Result of driving one step through its lifecycle.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub step_run_id: String,
    pub status: StepStatus,
}

impl ProtocolEngine {
    /// Execute one step end to end. `inline_depth` is the position in an
    /// inline-trigger chain; scheduler-driven runs start at zero.
    pub(crate) async fn execute_step(
        &self,
        step_index: u32,
        inline_depth: u32,
    ) -> Result<StepExecution> {
        let step_spec = self.step_spec(step_index).await?;

        // CAS reservation: losing means another worker won or the board
        // changed under us; abort without side effects.
        let (step_run_id, attempt) = {
            let mut steps = self.steps.write().await;
            let step = steps
                .iter_mut()
                .find(|s| s.step_index == step_index)
                .ok_or_else(|| ForemanError::NotFound(format!("step {}", step_index)))?;
            if !matches!(step.status, StepStatus::Pending | StepStatus::Blocked) {
                return Err(ForemanError::ConcurrencyConflict(format!(
                    "step {} is {:?}, not reservable",
                    step_index, step.status
                )));
            }
            step.status = StepStatus::Reserved;
            step.attempts += 1;
            step.started_at = Some(chrono::Utc::now());
            (step.id.clone(), step.attempts)
        };
        self.save_state().await?;
        self.emit(
            "step_reserved",
            EventCategory::Execution,
            Some(step_index),
            format!("step {} reserved (attempt {})", step_index, attempt),
            json!({ "step_run_id": step_run_id, "attempt": attempt }),
        )
        .await?;

        // The coordinator, not the persisted record, is the authority on
        // worktree ownership: a released or never-provisioned protocol must
        // not run steps.
        let worktree = match self.shared.worktrees.require_lease(&self.protocol_id) {
            Ok(lease) => lease.path,
            Err(e) => {
                self.emit(
                    "worktree_error",
                    EventCategory::Git,
                    Some(step_index),
                    format!("step {} has no worktree lease: {}", step_index, e),
                    json!({ "error": e.to_string() }),
                )
                .await?;
                return self
                    .finish_step(step_index, &step_run_id, StepStatus::Failed, Some(e.to_string()))
                    .await;
            }
        };

        // Prompt and output resolution happen before any tokens are spent;
        // failures here are not retryable.
        let resolution = self.resolve_step(&step_spec, &worktree).await;
        let resolved = match resolution {
            Ok(resolved) => resolved,
            Err(e) => {
                self.emit(
                    "prompt_resolve_error",
                    EventCategory::Execution,
                    Some(step_index),
                    format!("resolution failed for step {}: {}", step_index, e),
                    json!({ "error": e.to_string() }),
                )
                .await?;
                return self
                    .finish_step(step_index, &step_run_id, StepStatus::Failed, Some(e.to_string()))
                    .await;
            }
        };

        // Token budget pre-check against the protocol's remaining budget.
        let estimate = self.shared.policy.step_token_estimate(&step_spec);
        {
            let run = self.run.read().await;
            if run.budget.would_exceed(estimate) {
                drop(run);
                self.emit(
                    "budget_exhausted",
                    EventCategory::Policy,
                    Some(step_index),
                    format!(
                        "step {} needs ~{} tokens but the budget is exhausted",
                        step_index, estimate
                    ),
                    json!({ "estimated_tokens": estimate }),
                )
                .await?;
                return self
                    .finish_step(step_index, &step_run_id, StepStatus::Blocked, None)
                    .await;
            }
        }

        let adapter = match self.shared.agents.get(&step_spec.engine_id) {
            Ok(adapter) => adapter,
            Err(e) => {
                // An optional step under a skip QA policy may be bypassed
                // when its engine is unavailable.
                if step_spec.optional && step_spec.policies.qa_policy == QaPolicy::Skip {
                    self.emit(
                        "step_skipped",
                        EventCategory::Execution,
                        Some(step_index),
                        format!("optional step {} skipped: {}", step_index, e),
                        json!({ "reason": e.to_string() }),
                    )
                    .await?;
                    return self
                        .finish_step(step_index, &step_run_id, StepStatus::Skipped, None)
                        .await;
                }
                self.emit(
                    "agent_error",
                    EventCategory::Execution,
                    Some(step_index),
                    format!("no adapter for engine '{}'", step_spec.engine_id),
                    json!({ "engine": step_spec.engine_id }),
                )
                .await?;
                return self
                    .finish_step(step_index, &step_run_id, StepStatus::Failed, Some(e.to_string()))
                    .await;
            }
        };

        {
            let mut steps = self.steps.write().await;
            if let Some(step) = steps.iter_mut().find(|s| s.step_index == step_index) {
                step.status = StepStatus::Running;
            }
        }
        self.save_state().await?;
        self.emit(
            "step_started",
            EventCategory::Execution,
            Some(step_index),
            format!("step {} started", step_index),
            json!({
                "engine": step_spec.engine_id,
                "model": step_spec.model,
                "prompt_version": resolved.prompt_version,
                "estimated_tokens": estimate,
            }),
        )
        .await?;
        foreman_observability::emit(
            tracing::Level::INFO,
            &foreman_observability::ProtocolEvent::new("executor", "step_started", &self.protocol_id)
                .step(step_index)
                .engine(&step_spec.engine_id, &step_spec.model),
        );

        let remaining_budget = self.run.read().await.budget.remaining();
        let ctx = AgentContext {
            working_directory: worktree.clone(),
            prompt_ref: step_spec.prompt_ref.clone(),
            prompt_version: resolved.prompt_version.clone(),
            resolved_inputs: resolved.inputs.clone(),
            output_targets: OutputTargets {
                primary: resolved.primary.clone(),
                aux: resolved.aux.clone(),
            },
            limits: AgentLimits {
                wall_time: self.shared.config.agent_wall_time(),
                token_budget: match (remaining_budget, step_spec.policies.token_budget) {
                    (Some(remaining), Some(step)) => Some(remaining.min(step)),
                    (Some(remaining), None) => Some(remaining),
                    (None, step) => step,
                },
            },
            cancel: self.child_cancel_token(),
        };

        let result = match adapter.execute(ctx).await {
            Ok(result) => result,
            Err(e) => {
                self.emit(
                    "agent_error",
                    EventCategory::Execution,
                    Some(step_index),
                    format!("adapter failed for step {}: {}", step_index, e),
                    json!({ "error": e.to_string() }),
                )
                .await?;
                return self
                    .finish_step(step_index, &step_run_id, StepStatus::Failed, Some(e.to_string()))
                    .await;
            }
        };

        {
            let mut run = self.run.write().await;
            run.budget.record(result.tokens_used, result.cost_estimate);
        }
        self.warn_if_budget_hot().await;

        let partial = self.is_cancelled()
            || result
                .error
                .as_ref()
                .is_some_and(|e| e.class == "cancelled");
        let artifacts = self
            .capture_artifacts(&step_run_id, &step_spec, &worktree, &resolved, partial)
            .await?;
        {
            let mut steps = self.steps.write().await;
            if let Some(step) = steps.iter_mut().find(|s| s.step_index == step_index) {
                step.artifacts = artifacts;
            }
        }
        if partial {
            self.emit(
                "step_artifacts_partial",
                EventCategory::Execution,
                Some(step_index),
                format!("step {} outputs captured partially", step_index),
                json!(null),
            )
            .await?;
        }

        if result.status == AgentStatus::Ok {
            self.handle_agent_success(step_index, &step_run_id, &step_spec, &worktree, inline_depth)
                .await
        } else {
            self.handle_agent_failure(step_index, &step_run_id, &step_spec, result)
                .await
        }
    }

    // ------------------------------------------------------------------------

    async fn handle_agent_success(
        &self,
        step_index: u32,
        step_run_id: &str,
        step_spec: &StepSpec,
        worktree: &Path,
        inline_depth: u32,
    ) -> Result<StepExecution> {
        if step_spec.policies.qa_policy == QaPolicy::Skip {
            let execution = self
                .finish_step(step_index, step_run_id, StepStatus::Completed, None)
                .await?;
            self.emit_step_completed(step_index).await?;
            self.maybe_inline_trigger(step_spec, inline_depth).await?;
            return Ok(execution);
        }

        {
            let mut steps = self.steps.write().await;
            if let Some(step) = steps.iter_mut().find(|s| s.step_index == step_index) {
                step.status = StepStatus::NeedsQa;
            }
        }
        self.save_state().await?;

        let verdict = self.run_qa(step_index, step_run_id, step_spec, worktree).await?;
        {
            let mut steps = self.steps.write().await;
            if let Some(step) = steps.iter_mut().find(|s| s.step_index == step_index) {
                step.qa_verdict = Some(verdict.clone());
            }
        }
        self.save_state().await?;
        self.emit(
            "qa_verdict",
            EventCategory::Qa,
            Some(step_index),
            format!("qa verdict for step {}: {:?}", step_index, verdict.overall),
            json!({
                "overall": verdict.overall,
                "gates": verdict
                    .gates
                    .iter()
                    .map(|g| json!({ "name": g.name, "status": g.status }))
                    .collect::<Vec<_>>(),
            }),
        )
        .await?;

        let outcome = {
            let steps = self.steps.read().await;
            let step_run = steps
                .iter()
                .find(|s| s.step_index == step_index)
                .ok_or_else(|| ForemanError::NotFound(format!("step {}", step_index)))?;
            FeedbackRouter::route(&verdict, step_spec, step_run, self.enforcement().await)
        };
        self.handle_feedback_outcome(&outcome, step_index).await?;

        match outcome {
            FeedbackOutcome::Complete { with_warnings } => {
                let execution = self
                    .finish_step(step_index, step_run_id, StepStatus::Completed, None)
                    .await?;
                if with_warnings {
                    tracing::warn!(
                        protocol_id = %self.protocol_id,
                        step_index,
                        "step completed with qa warnings"
                    );
                }
                self.emit_step_completed(step_index).await?;
                self.maybe_inline_trigger(step_spec, inline_depth).await?;
                Ok(execution)
            }
            FeedbackOutcome::Retry => {
                self.bump_loop_count(step_index).await;
                self.save_state().await?;
                self.emit(
                    "step_retry_scheduled",
                    EventCategory::Qa,
                    Some(step_index),
                    format!("step {} re-queued by qa feedback", step_index),
                    json!({ "source": "qa" }),
                )
                .await?;
                self.finish_step(step_index, step_run_id, StepStatus::Pending, None)
                    .await
            }
            FeedbackOutcome::Clarify { key, question } => {
                self.bump_loop_count(step_index).await;
                let clarification = self.shared.clarifications.raise(
                    ClarificationScope::Step,
                    crate::clarifications::step_scope_id(&self.protocol_id, step_index),
                    key.clone(),
                    true,
                    question.clone(),
                    Vec::new(),
                )?;
                self.emit(
                    "clarification_raised",
                    EventCategory::Clarification,
                    Some(step_index),
                    format!("step {} blocked on clarification '{}'", step_index, key),
                    json!({ "key": clarification.key, "question": question }),
                )
                .await?;
                self.finish_step(step_index, step_run_id, StepStatus::Blocked, None)
                    .await
            }
            FeedbackOutcome::RePlan => {
                self.bump_loop_count(step_index).await;
                // The failing run is part of the cancelled generation.
                {
                    let mut steps = self.steps.write().await;
                    if let Some(step) = steps.iter_mut().find(|s| s.step_index == step_index) {
                        step.status = StepStatus::NeedsQa;
                    }
                }
                match self.replan_from_feedback().await {
                    Ok(()) => Ok(StepExecution {
                        step_run_id: step_run_id.to_string(),
                        status: StepStatus::Cancelled,
                    }),
                    Err(e) => {
                        self.emit(
                            "replan_error",
                            EventCategory::Planning,
                            Some(step_index),
                            format!("re-planning failed: {}", e),
                            json!({ "error": e.to_string() }),
                        )
                        .await?;
                        self.finish_step(
                            step_index,
                            step_run_id,
                            StepStatus::Failed,
                            Some(format!("re-planning failed: {}", e)),
                        )
                        .await
                    }
                }
            }
            FeedbackOutcome::Fail { reason } => {
                self.finish_step(step_index, step_run_id, StepStatus::Failed, Some(reason))
                    .await
            }
        }
    }

    async fn handle_agent_failure(
        &self,
        step_index: u32,
        step_run_id: &str,
        step_spec: &StepSpec,
        result: AgentResult,
    ) -> Result<StepExecution> {
        let error = result.error.unwrap_or(foreman_agents::AgentErrorInfo {
            class: "unknown".to_string(),
            message: "agent reported failure without detail".to_string(),
        });

        // A cancelled invocation ends the step, not the retry budget.
        if error.class == "cancelled" || self.is_cancelled() {
            self.emit(
                "step_cancelled",
                EventCategory::Execution,
                Some(step_index),
                format!("step {} cancelled mid-agent", step_index),
                json!(null),
            )
            .await?;
            return self
                .finish_step(step_index, step_run_id, StepStatus::Cancelled, None)
                .await;
        }

        let class = match result.status {
            AgentStatus::PermanentError => ErrorClass::Permanent,
            _ => self.shared.classifier.classify(&error.class, &error.message),
        };

        let decision = {
            let steps = self.steps.read().await;
            let step_run = steps
                .iter()
                .find(|s| s.step_index == step_index)
                .ok_or_else(|| ForemanError::NotFound(format!("step {}", step_index)))?;
            self.shared
                .policy
                .retry_decision(class, &error.class, step_run, step_spec)
        };

        match decision {
            RetryDecision::Retry => {
                let retries = {
                    let mut steps = self.steps.write().await;
                    let step = steps
                        .iter_mut()
                        .find(|s| s.step_index == step_index)
                        .ok_or_else(|| ForemanError::NotFound(format!("step {}", step_index)))?;
                    step.retries += 1;
                    step.retries
                };
                self.save_state().await?;
                self.emit(
                    "step_retry_scheduled",
                    EventCategory::Execution,
                    Some(step_index),
                    format!(
                        "step {} hit a transient error; retry {} of {}",
                        step_index, retries, step_spec.policies.retry_max
                    ),
                    json!({
                        "source": "transient",
                        "class": error.class,
                        "retries": retries,
                    }),
                )
                .await?;
                self.finish_step(
                    step_index,
                    step_run_id,
                    StepStatus::Pending,
                    Some(error.message),
                )
                .await
            }
            RetryDecision::Fail => {
                self.emit(
                    "agent_error",
                    EventCategory::Execution,
                    Some(step_index),
                    format!("step {} failed: {}", step_index, error.message),
                    json!({ "class": error.class }),
                )
                .await?;
                self.finish_step(
                    step_index,
                    step_run_id,
                    StepStatus::Failed,
                    Some(error.message),
                )
                .await
            }
        }
    }

    async fn run_qa(
        &self,
        step_index: u32,
        step_run_id: &str,
        step_spec: &StepSpec,
        worktree: &Path,
    ) -> Result<QaVerdict> {
        let Some(qa) = &step_spec.qa else {
            // Nothing configured: light/full QA over zero gates passes.
            return Ok(QaVerdict {
                overall: foreman_types::QaOutcome::Pass,
                gates: Vec::new(),
                prompt_verdict: None,
            });
        };

        let run_prompt_gate = step_spec.policies.qa_policy == QaPolicy::Full;
        let prompt_version = self.resolve_prompt_version(&qa.prompt_ref)?;
        let verdict_path = self
            .shared
            .store
            .artifacts_dir(&self.protocol_id, step_run_id)
            .join("qa-verdict.json");

        self.shared
            .qa_runner
            .evaluate(
                &self.protocol_id,
                worktree,
                qa,
                run_prompt_gate,
                prompt_version,
                verdict_path,
                self.child_cancel_token(),
            )
            .await
            .map_err(|e| {
                ForemanError::System(format!("qa evaluation failed for step {}: {}", step_index, e))
            })
    }

    /// Inline-trigger eligible dependents, bounded by the configured chain
    /// depth.
    async fn maybe_inline_trigger(&self, step_spec: &StepSpec, inline_depth: u32) -> Result<()> {
        if !step_spec.inline_trigger {
            return Ok(());
        }

        let dependents: Vec<u32> = {
            let spec_guard = self.spec.read().await;
            let Some(spec) = spec_guard.as_ref() else {
                return Ok(());
            };
            spec.steps
                .iter()
                .filter(|s| s.depends_on.contains(&step_spec.step_index))
                .map(|s| s.step_index)
                .collect()
        };
        if dependents.is_empty() {
            return Ok(());
        }

        if !self.shared.policy.inline_allowed(inline_depth) {
            self.emit(
                "inline_trigger_limit_hit",
                EventCategory::Policy,
                Some(step_spec.step_index),
                format!(
                    "inline trigger depth {} reached; dependents re-queued normally",
                    inline_depth
                ),
                json!({ "depth": inline_depth, "dependents": dependents }),
            )
            .await?;
            return Ok(());
        }

        {
            let mut run = self.run.write().await;
            run.inline_trigger_depth = run.inline_trigger_depth.max(inline_depth + 1);
        }

        for dependent in dependents {
            let runnable = match self.select().await {
                crate::scheduler::Selection::Batch(batch) => batch.contains(&dependent),
                _ => false,
            };
            if !runnable {
                continue;
            }
            if self.is_cancelled() || self.pause_signal.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            // Recursion bounded by max_inline_trigger_depth.
            Box::pin(self.execute_step(dependent, inline_depth + 1)).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------

    async fn emit_step_completed(&self, step_index: u32) -> Result<()> {
        let artifacts = {
            let steps = self.steps.read().await;
            steps
                .iter()
                .find(|s| s.step_index == step_index)
                .map(|s| {
                    s.artifacts
                        .iter()
                        .map(|a| json!({ "name": a.name, "sha256": a.sha256, "size": a.size_bytes }))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        self.emit(
            "step_completed",
            EventCategory::Execution,
            Some(step_index),
            format!("step {} completed", step_index),
            json!({ "artifacts": artifacts }),
        )
        .await
    }

    async fn bump_loop_count(&self, step_index: u32) {
        {
            let mut steps = self.steps.write().await;
            if let Some(step) = steps.iter_mut().find(|s| s.step_index == step_index) {
                step.loop_count += 1;
            }
        }
        let mut run = self.run.write().await;
        *run.loop_counts.entry(step_index).or_insert(0) += 1;
    }

    async fn warn_if_budget_hot(&self) {
        use foreman_observability::{emit, ProtocolEvent};

        let usage = self.run.read().await.budget.clone();
        match self.shared.policy.budget_check(&usage) {
            crate::policy::BudgetCheckResult::Warning { fraction } => {
                let detail = format!("token budget at {:.0}%", fraction * 100.0);
                emit(
                    tracing::Level::WARN,
                    &ProtocolEvent::new("policy", "budget_warning", &self.protocol_id)
                        .detail(&detail),
                );
            }
            crate::policy::BudgetCheckResult::Exceeded { reason } => {
                emit(
                    tracing::Level::WARN,
                    &ProtocolEvent::new("policy", "budget_exceeded", &self.protocol_id)
                        .detail(&reason),
                );
            }
            crate::policy::BudgetCheckResult::Ok => {}
        }
    }

    /// Set the step's terminal-or-requeued status, stamp bookkeeping, and
    /// persist. Emits `step_failed` for failures.
    async fn finish_step(
        &self,
        step_index: u32,
        step_run_id: &str,
        status: StepStatus,
        error: Option<String>,
    ) -> Result<StepExecution> {
        {
            let mut steps = self.steps.write().await;
            if let Some(step) = steps.iter_mut().find(|s| s.step_index == step_index) {
                step.status = status;
                step.error_message = error.clone();
                if status.is_terminal() {
                    step.ended_at = Some(chrono::Utc::now());
                }
            }
        }
        self.save_state().await?;
        if status == StepStatus::Failed {
            self.emit(
                "step_failed",
                EventCategory::Execution,
                Some(step_index),
                format!(
                    "step {} failed: {}",
                    step_index,
                    error.as_deref().unwrap_or("unknown")
                ),
                json!({ "reason": error }),
            )
            .await?;
        }
        Ok(StepExecution {
            step_run_id: step_run_id.to_string(),
            status,
        })
    }

    async fn step_spec(&self, step_index: u32) -> Result<StepSpec> {
        let spec_guard = self.spec.read().await;
        let spec = spec_guard
            .as_ref()
            .ok_or_else(|| ForemanError::InvalidOperation("no committed plan".to_string()))?;
        spec.steps
            .iter()
            .find(|s| s.step_index == step_index)
            .cloned()
            .ok_or_else(|| ForemanError::NotFound(format!("step {}", step_index)))
    }

    async fn resolve_step(&self, step: &StepSpec, worktree: &Path) -> Result<ResolvedStep> {
        let prompt_version = self.resolve_prompt_version(&step.prompt_ref)?;

        let primary = resolve_worktree_path(worktree, &step.outputs.primary)?;
        let mut aux = BTreeMap::new();
        for (name, rel) in &step.outputs.aux {
            aux.insert(name.clone(), resolve_worktree_path(worktree, rel)?);
        }

        let spec_guard = self.spec.read().await;
        let mut inputs = BTreeMap::new();
        for input in &step.inputs {
            // `step:N` references the primary output of an earlier step;
            // anything else is a worktree-relative file.
            let path = match input.strip_prefix("step:") {
                Some(index) => {
                    let index: u32 = index.parse().map_err(|_| {
                        ForemanError::Validation(format!("invalid input reference '{}'", input))
                    })?;
                    let producer = spec_guard
                        .as_ref()
                        .and_then(|s| s.steps.iter().find(|s| s.step_index == index))
                        .ok_or_else(|| {
                            ForemanError::Validation(format!(
                                "input '{}' references unknown step",
                                input
                            ))
                        })?;
                    resolve_worktree_path(worktree, &producer.outputs.primary)?
                }
                None => resolve_worktree_path(worktree, input)?,
            };
            inputs.insert(input.clone(), path);
        }

        Ok(ResolvedStep {
            prompt_version,
            primary,
            aux,
            inputs,
        })
    }

    /// Copy captured outputs into the step's artifact directory with
    /// digests, alongside a `git status` snapshot and a best-effort diff.
    async fn capture_artifacts(
        &self,
        step_run_id: &str,
        step: &StepSpec,
        worktree: &Path,
        resolved: &ResolvedStep,
        partial: bool,
    ) -> Result<Vec<ArtifactRecord>> {
        let mut records = Vec::new();

        if let Ok(bytes) = tokio::fs::read(&resolved.primary).await {
            records.push(self.shared.store.write_artifact(
                &self.protocol_id,
                step_run_id,
                "stdout",
                ArtifactKind::Stdout,
                &bytes,
                partial,
            )?);
        }
        for (name, path) in &resolved.aux {
            if let Ok(bytes) = tokio::fs::read(path).await {
                records.push(self.shared.store.write_artifact(
                    &self.protocol_id,
                    step_run_id,
                    &format!("aux/{}", name),
                    ArtifactKind::Aux,
                    &bytes,
                    partial,
                )?);
            }
        }

        match self.shared.worktrees.capture_status(worktree).await {
            Ok(status) => {
                records.push(self.shared.store.write_artifact(
                    &self.protocol_id,
                    step_run_id,
                    "git-status.txt",
                    ArtifactKind::GitStatus,
                    status.as_bytes(),
                    partial,
                )?);
            }
            Err(e) => {
                tracing::debug!(
                    protocol_id = %self.protocol_id,
                    step_index = step.step_index,
                    error = %e,
                    "git status capture failed"
                );
            }
        }
        if let Ok(diff) = self.shared.worktrees.capture_diff(worktree).await {
            if !diff.is_empty() {
                records.push(self.shared.store.write_artifact(
                    &self.protocol_id,
                    step_run_id,
                    "diff",
                    ArtifactKind::Diff,
                    diff.as_bytes(),
                    partial,
                )?);
            }
        }

        Ok(records)
    }
}

struct ResolvedStep {
    prompt_version: String,
    primary: PathBuf,
    aux: BTreeMap<String, PathBuf>,
    inputs: BTreeMap<String, PathBuf>,
}

/// Join a declared relative path onto the worktree, refusing traversal out
/// of it.
fn resolve_worktree_path(worktree: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(ForemanError::Validation(format!(
            "output path '{}' must be relative to the worktree",
            relative
        )));
    }
    for component in candidate.components() {
        if matches!(component, Component::ParentDir) {
            return Err(ForemanError::Validation(format!(
                "output path '{}' escapes the worktree",
                relative
            )));
        }
    }
    Ok(worktree.join(candidate))
}
