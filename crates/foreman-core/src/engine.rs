// Protocol Engine
// Owns one protocol's lifecycle: planning, step selection, pause/resume,
// cancellation, clarification gating. Every command serializes on the
// protocol lease; agent and gate subprocesses run outside it, steered by
// the pause signal and cancellation token.

use crate::clarifications::ClarificationRegistry;
use crate::config::OrchestratorConfig;
use crate::error::{ForemanError, Result};
use crate::feedback::FeedbackOutcome;
use crate::ids::IdProvider;
use crate::journal::{EventDraft, EventJournal};
use crate::machine;
use crate::plan;
use crate::policy::PolicyEvaluator;
use crate::qa::QaGateRunner;
use crate::scheduler::{Selection, StepScheduler};
use crate::store::ProtocolStore;
use foreman_agents::{AgentRegistry, ErrorClassifier};
use foreman_git::WorktreeCoordinator;
use foreman_types::{
    EnforcementMode, EventCategory, ProtocolRun, ProtocolSnapshot, ProtocolSpec, ProtocolStatus,
    StepRun, StepStatus,
};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Dependencies shared by every protocol engine in the process.
pub(crate) struct EngineShared {
    pub config: OrchestratorConfig,
    pub store: Arc<ProtocolStore>,
    pub journal: Arc<EventJournal>,
    pub worktrees: Arc<WorktreeCoordinator>,
    pub agents: Arc<AgentRegistry>,
    pub classifier: Arc<dyn ErrorClassifier>,
    pub qa_runner: Arc<QaGateRunner>,
    pub clarifications: Arc<ClarificationRegistry>,
    pub policy: PolicyEvaluator,
    pub ids: IdProvider,
}

/// Synchronous result of one command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub protocol_id: String,
    pub status: ProtocolStatus,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
}

#[derive(Clone)]
pub struct ProtocolEngine {
    pub(crate) protocol_id: String,
    pub(crate) project_id: String,
    pub(crate) shared: Arc<EngineShared>,
    /// Per-protocol command serialization; FIFO
    lease: Arc<Mutex<()>>,
    pub(crate) run: Arc<RwLock<ProtocolRun>>,
    pub(crate) steps: Arc<RwLock<Vec<StepRun>>>,
    pub(crate) spec: Arc<RwLock<Option<ProtocolSpec>>>,
    pub(crate) cancel_token: Arc<StdMutex<CancellationToken>>,
    pub(crate) pause_signal: Arc<AtomicBool>,
}

impl ProtocolEngine {
    pub(crate) fn new(
        run: ProtocolRun,
        steps: Vec<StepRun>,
        spec: Option<ProtocolSpec>,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            protocol_id: run.id.clone(),
            project_id: run.project_id.clone(),
            shared,
            lease: Arc::new(Mutex::new(())),
            pause_signal: Arc::new(AtomicBool::new(run.status == ProtocolStatus::Paused)),
            run: Arc::new(RwLock::new(run)),
            steps: Arc::new(RwLock::new(steps)),
            spec: Arc::new(RwLock::new(spec)),
            cancel_token: Arc::new(StdMutex::new(CancellationToken::new())),
        }
    }

    /// Rehydrate from the store, recovering steps orphaned in-flight by a
    /// previous process (reserved/running/needs_qa with no live worker).
    pub(crate) fn rehydrate(
        run: ProtocolRun,
        mut steps: Vec<StepRun>,
        spec: Option<ProtocolSpec>,
        shared: Arc<EngineShared>,
    ) -> Result<Self> {
        let mut recovered = 0;
        for step in steps.iter_mut() {
            if matches!(
                step.status,
                StepStatus::Reserved | StepStatus::Running | StepStatus::NeedsQa
            ) {
                step.status = StepStatus::Pending;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(
                protocol_id = %run.id,
                recovered,
                "recovered orphaned in-flight steps"
            );
            shared.store.save_steps(&run.id, &steps)?;
        }
        Ok(Self::new(run, steps, spec, shared))
    }

    pub async fn status(&self) -> ProtocolStatus {
        self.run.read().await.status
    }

    pub async fn snapshot(&self) -> ProtocolSnapshot {
        let run = self.run.read().await;
        let steps = self.steps.read().await;
        run.to_snapshot(&steps)
    }

    pub async fn step_runs(&self) -> Vec<StepRun> {
        self.steps.read().await.clone()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Validate and commit a spec document.
    ///
    /// From `pending` this provisions the worktree and commits the first
    /// plan. On an already-planned protocol an unchanged document is a
    /// no-op (same hash); a changed one replaces the unstarted plan.
    pub async fn plan(&self, document: &str) -> Result<CommandOutcome> {
        let _lease = self.lease.lock().await;

        let mut spec = plan::parse_spec_document(document)?;

        if spec.steps.is_empty() {
            if !self.shared.config.auto_generate_plan_on_missing {
                return Err(ForemanError::Validation(
                    "spec document has no steps and auto-generation is disabled".to_string(),
                ));
            }
            spec = self.synthesize_plan().await?;
        }

        let status = self.run.read().await.status;
        match status {
            ProtocolStatus::Pending => self.initial_plan(spec).await,
            ProtocolStatus::Planned => self.replace_plan(spec).await,
            other => Err(ForemanError::InvalidOperation(format!(
                "cannot plan protocol in status {:?}",
                other
            ))),
        }
    }

    async fn initial_plan(&self, spec: ProtocolSpec) -> Result<CommandOutcome> {
        self.transition(ProtocolStatus::Planning).await?;
        self.emit(
            "planning_started",
            EventCategory::Planning,
            None,
            "planning started",
            json!(null),
        )
        .await?;

        // Worktree first: isolation is a precondition for everything the
        // plan will execute.
        let (number, name, base_branch) = {
            let run = self.run.read().await;
            (run.number, run.name.clone(), run.base_branch.clone())
        };
        let hint = name
            .split_once('-')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| name.clone());

        let lease = match self
            .shared
            .worktrees
            .provision(&self.protocol_id, number, &hint, &base_branch)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                self.emit(
                    "worktree_error",
                    EventCategory::Git,
                    None,
                    format!("worktree provisioning failed: {}", e),
                    json!({ "error": e.to_string() }),
                )
                .await?;
                self.fail_protocol(&format!("worktree provisioning failed: {}", e))
                    .await?;
                return Err(e.into());
            }
        };

        {
            let mut run = self.run.write().await;
            run.branch_name = Some(lease.branch_name.clone());
            run.worktree_path = Some(lease.path.clone());
        }
        self.emit(
            "worktree_provisioned",
            EventCategory::Git,
            None,
            format!("worktree ready on branch {}", lease.branch_name),
            json!({ "branch": lease.branch_name, "path": lease.path.display().to_string() }),
        )
        .await?;

        self.commit_plan(spec, true).await
    }

    async fn replace_plan(&self, spec: ProtocolSpec) -> Result<CommandOutcome> {
        let new_hash = plan::spec_hash(&spec)?;
        let current = self.run.read().await.spec_hash.clone();
        if current.as_deref() == Some(new_hash.as_str()) {
            self.emit(
                "plan_unchanged",
                EventCategory::Planning,
                None,
                "plan document unchanged; keeping committed spec",
                json!({ "spec_hash": new_hash }),
            )
            .await?;
            let status = self.run.read().await.status;
            return Ok(self.outcome(status, "plan unchanged", None, Some(new_hash)));
        }
        self.commit_plan(spec, false).await
    }

    /// Validate, freeze, materialize, persist, and announce a spec version.
    async fn commit_plan(&self, spec: ProtocolSpec, from_planning: bool) -> Result<CommandOutcome> {
        if let Err(validation) = plan::validate(&spec) {
            self.emit(
                "spec_validation_error",
                EventCategory::Planning,
                None,
                format!("spec validation failed: {}", validation),
                json!({ "error": validation.to_string() }),
            )
            .await?;
            if from_planning {
                self.fail_protocol(&format!("spec validation failed: {}", validation))
                    .await?;
            }
            return Err(ForemanError::Validation(validation.to_string()));
        }

        let spec_hash = plan::spec_hash(&spec)?;
        let policy = plan::freeze_policy(&self.shared.config, None)?;
        let step_runs = plan::materialize_step_runs(&self.protocol_id, &spec, &self.shared.ids);
        let step_count = step_runs.len();

        // Unfinished runs from a replaced plan are cancelled into history.
        {
            let mut steps = self.steps.write().await;
            let mut replaced: Vec<StepRun> = steps.drain(..).collect();
            for step in replaced.iter_mut() {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Cancelled;
                }
            }
            self.shared
                .store
                .append_step_history(&self.protocol_id, &replaced)?;
            *steps = step_runs;
        }

        self.shared
            .store
            .save_spec(&self.protocol_id, &spec_hash, &spec)?;
        {
            let mut run = self.run.write().await;
            run.spec_hash = Some(spec_hash.clone());
            run.budget.token_budget = policy.token_budget;
            run.policy = Some(policy);
            run.loop_counts.clear();
        }
        *self.spec.write().await = Some(spec);

        if from_planning {
            self.transition(ProtocolStatus::Planned).await?;
        }
        self.save_state().await?;

        self.emit(
            "plan_committed",
            EventCategory::Planning,
            None,
            format!("plan committed with {} steps", step_count),
            json!({ "spec_hash": spec_hash, "step_count": step_count }),
        )
        .await?;

        let status = self.run.read().await.status;
        Ok(self.outcome(status, "plan committed", None, Some(spec_hash)))
    }

    /// Ask the configured planning agent to synthesize a spec document.
    async fn synthesize_plan(&self) -> Result<ProtocolSpec> {
        use foreman_agents::{AgentContext, AgentLimits, OutputTargets};
        use std::collections::BTreeMap;

        let adapter = self.shared.agents.get(&self.shared.config.planner_engine_id)?;
        let workdir = {
            let run = self.run.read().await;
            run.worktree_path
                .clone()
                .unwrap_or_else(|| std::env::temp_dir())
        };
        let output = self
            .shared
            .store
            .artifacts_dir(&self.protocol_id, "planner")
            .join("plan.json");

        let prompt_ref = self.shared.config.planner_prompt_ref.clone();
        let prompt_version = self.resolve_prompt_version(&prompt_ref)?;
        let ctx = AgentContext {
            working_directory: workdir,
            prompt_ref,
            prompt_version,
            resolved_inputs: BTreeMap::new(),
            output_targets: OutputTargets {
                primary: output.clone(),
                aux: BTreeMap::new(),
            },
            limits: AgentLimits {
                wall_time: self.shared.config.agent_wall_time(),
                token_budget: None,
            },
            cancel: self.child_cancel_token(),
        };

        let result = adapter.execute(ctx).await?;
        if !result.is_ok() {
            return Err(ForemanError::PermanentAgent(
                result
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "planner agent failed".to_string()),
            ));
        }
        {
            let mut run = self.run.write().await;
            run.budget.record(result.tokens_used, result.cost_estimate);
        }

        let raw = tokio::fs::read_to_string(&output).await.map_err(|e| {
            ForemanError::Parse(format!("planner produced no readable output: {}", e))
        })?;
        plan::parse_spec_document(&raw)
    }

    /// Reserve and fully execute one runnable step.
    pub async fn run_next(&self) -> Result<CommandOutcome> {
        let _lease = self.lease.lock().await;

        if self.is_cancelled() {
            return self.finalize_cancelled().await;
        }

        self.ensure_runnable().await?;

        match self.select().await {
            Selection::Batch(batch) => {
                let step_index = batch[0];
                let execution = self.execute_step(step_index, 0).await?;
                if self.is_cancelled() {
                    return self.finalize_cancelled().await;
                }
                let outcome = self.settle_after_execution().await?;
                Ok(CommandOutcome {
                    step_run_id: Some(execution.step_run_id),
                    ..outcome
                })
            }
            other => self.settle_selection(other).await,
        }
    }

    /// Repeat selection until the protocol blocks, completes, fails, or a
    /// pause/cancel signal lands. Parallel-group batches run concurrently.
    pub async fn run_until_idle(&self) -> Result<CommandOutcome> {
        let _lease = self.lease.lock().await;

        self.ensure_runnable().await?;

        loop {
            if self.is_cancelled() {
                return self.finalize_cancelled().await;
            }
            if self.pause_signal.load(Ordering::SeqCst) {
                return self.finalize_paused().await;
            }

            match self.select().await {
                Selection::Batch(batch) => {
                    if batch.len() == 1 {
                        self.execute_step(batch[0], 0).await?;
                    } else {
                        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
                        for step_index in batch {
                            let engine = self.clone();
                            join_set.spawn(async move {
                                engine.execute_step(step_index, 0).await.map(|_| ())
                            });
                        }
                        while let Some(joined) = join_set.join_next().await {
                            match joined {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    tracing::error!(
                                        protocol_id = %self.protocol_id,
                                        error = %e,
                                        "step task returned error"
                                    );
                                }
                                Err(e) => tracing::error!(
                                    protocol_id = %self.protocol_id,
                                    error = %e,
                                    "step task join error"
                                ),
                            }
                        }
                    }
                }
                other => return self.settle_selection(other).await,
            }
        }
    }

    /// Drain the in-flight step (the lease guarantees none once acquired)
    /// and refuse new reservations.
    pub async fn pause(&self) -> Result<CommandOutcome> {
        self.pause_signal.store(true, Ordering::SeqCst);
        let _lease = self.lease.lock().await;

        let status = self.run.read().await.status;
        match status {
            ProtocolStatus::Running | ProtocolStatus::Planned => self.finalize_paused().await,
            ProtocolStatus::Paused => Ok(self.outcome(status, "already paused", None, None)),
            other => {
                self.pause_signal.store(false, Ordering::SeqCst);
                Err(ForemanError::InvalidOperation(format!(
                    "cannot pause protocol in status {:?}",
                    other
                )))
            }
        }
    }

    pub async fn resume(&self) -> Result<CommandOutcome> {
        let _lease = self.lease.lock().await;

        let status = self.run.read().await.status;
        if status != ProtocolStatus::Paused {
            return Err(ForemanError::InvalidOperation(
                "protocol is not paused".to_string(),
            ));
        }
        self.pause_signal.store(false, Ordering::SeqCst);
        self.transition(ProtocolStatus::Running).await?;
        self.save_state().await?;
        self.emit(
            "protocol_resumed",
            EventCategory::Lifecycle,
            None,
            "execution resumed",
            json!(null),
        )
        .await?;
        Ok(self.outcome(ProtocolStatus::Running, "resumed", None, None))
    }

    /// Best-effort cancel: signal the in-flight step, then wait up to the
    /// grace period for it to drain and finalize the terminal state. Past
    /// the grace period the draining command finalizes cancellation itself.
    pub async fn cancel(&self) -> Result<CommandOutcome> {
        if let Ok(token) = self.cancel_token.lock() {
            token.cancel();
        } else {
            tracing::error!(protocol_id = %self.protocol_id, "failed to acquire cancel token lock");
        }
        match tokio::time::timeout(self.shared.config.cancel_grace(), self.lease.lock()).await {
            Ok(_lease) => self.finalize_cancelled().await,
            Err(_) => {
                tracing::warn!(
                    protocol_id = %self.protocol_id,
                    "in-flight step did not drain within the cancel grace period"
                );
                let status = self.run.read().await.status;
                Ok(self.outcome(
                    status,
                    "cancellation signalled; in-flight step still draining",
                    None,
                    None,
                ))
            }
        }
    }

    pub async fn answer_clarification(
        &self,
        key: &str,
        answer: &str,
    ) -> Result<CommandOutcome> {
        let _lease = self.lease.lock().await;

        let clarification = self.shared.clarifications.answer(
            &self.project_id,
            &self.protocol_id,
            key,
            answer,
        )?;

        self.emit(
            "clarification_answered",
            EventCategory::Clarification,
            None,
            format!("clarification '{}' answered", key),
            json!({
                "key": key,
                "scope": clarification.scope,
                "answer": foreman_observability::redact(answer),
            }),
        )
        .await?;

        let status = self.run.read().await.status;
        if status == ProtocolStatus::Blocked
            && !self
                .shared
                .clarifications
                .has_open_blockers(&self.project_id, &self.protocol_id)
        {
            // Parked steps get another pass through the selector.
            {
                let mut steps = self.steps.write().await;
                for step in steps.iter_mut() {
                    if step.status == StepStatus::Blocked {
                        step.status = StepStatus::Pending;
                    }
                }
            }
            self.transition(ProtocolStatus::Running).await?;
            self.save_state().await?;
            self.emit(
                "protocol_unblocked",
                EventCategory::Lifecycle,
                None,
                "last blocking clarification answered",
                json!(null),
            )
            .await?;
            return Ok(self.outcome(ProtocolStatus::Running, "unblocked", None, None));
        }

        Ok(self.outcome(status, "clarification answered", None, None))
    }

    /// Raise a protocol-scoped clarification. Blocking ones gate every step
    /// until answered.
    pub async fn raise_clarification(
        &self,
        key: &str,
        question: &str,
        blocking: bool,
    ) -> Result<foreman_types::Clarification> {
        let _lease = self.lease.lock().await;
        let clarification = self.shared.clarifications.raise(
            foreman_types::ClarificationScope::Protocol,
            self.protocol_id.clone(),
            key,
            blocking,
            question,
            Vec::new(),
        )?;
        self.emit(
            "clarification_raised",
            EventCategory::Clarification,
            None,
            format!("clarification '{}' raised", key),
            json!({ "key": key, "blocking": blocking }),
        )
        .await?;
        Ok(clarification)
    }

    /// Re-queue a failed or parked step.
    pub async fn retry_step(&self, step_index: u32) -> Result<CommandOutcome> {
        let _lease = self.lease.lock().await;

        let status = self.run.read().await.status;
        if status.is_terminal() {
            return Err(ForemanError::InvalidOperation(format!(
                "protocol is {:?}",
                status
            )));
        }

        let retry_max = {
            let spec = self.spec.read().await;
            let spec = spec
                .as_ref()
                .ok_or_else(|| ForemanError::InvalidOperation("no committed plan".to_string()))?;
            spec.steps
                .iter()
                .find(|s| s.step_index == step_index)
                .map(|s| s.policies.retry_max)
                .ok_or_else(|| ForemanError::NotFound(format!("step {}", step_index)))?
        };

        {
            let mut steps = self.steps.write().await;
            let step = steps
                .iter_mut()
                .find(|s| s.step_index == step_index)
                .ok_or_else(|| ForemanError::NotFound(format!("step {}", step_index)))?;
            match step.status {
                StepStatus::Failed => {
                    if step.retries >= retry_max {
                        return Err(ForemanError::PolicyBlock(format!(
                            "step {} has no retries left ({}/{})",
                            step_index, step.retries, retry_max
                        )));
                    }
                }
                StepStatus::Blocked => {}
                other => {
                    return Err(ForemanError::InvalidOperation(format!(
                        "step {} is {:?}, not failed or blocked",
                        step_index, other
                    )))
                }
            }
            step.status = StepStatus::Pending;
            step.error_message = None;
        }
        self.save_state().await?;
        self.emit(
            "step_retry_scheduled",
            EventCategory::Execution,
            Some(step_index),
            format!("step {} re-queued by operator", step_index),
            json!({ "source": "manual" }),
        )
        .await?;

        let status = self.run.read().await.status;
        Ok(self.outcome(status, "step re-queued", None, None))
    }

    // ========================================================================
    // Selection & settlement
    // ========================================================================

    pub(crate) async fn select(&self) -> Selection {
        let run = self.run.read().await.clone();
        let steps = self.steps.read().await.clone();
        let spec_guard = self.spec.read().await;
        let Some(spec) = spec_guard.as_ref() else {
            return Selection::Done;
        };

        StepScheduler::select(spec, &steps, |step, step_run| {
            let blockers = self.shared.clarifications.open_blockers_for_step(
                &self.project_id,
                &self.protocol_id,
                step.step_index,
            );
            self.shared
                .policy
                .step_block(&run, step, step_run, &blockers)
                .map(|block| block.to_string())
        })
    }

    /// After a step executed, refresh protocol status from the board.
    async fn settle_after_execution(&self) -> Result<CommandOutcome> {
        if self.pause_signal.load(Ordering::SeqCst) {
            return self.finalize_paused().await;
        }
        let selection = self.select().await;
        match selection {
            Selection::Batch(_) => {
                let status = self.run.read().await.status;
                Ok(self.outcome(status, "step executed; more work pending", None, None))
            }
            other => self.settle_selection(other).await,
        }
    }

    async fn settle_selection(&self, selection: Selection) -> Result<CommandOutcome> {
        match selection {
            Selection::Batch(_) => unreachable!("batches are executed, not settled"),
            Selection::Done => self.finalize_completed().await,
            Selection::Blocked { reasons } => {
                let summary = reasons
                    .iter()
                    .map(|(index, reason)| format!("step {}: {}", index, reason))
                    .collect::<Vec<_>>()
                    .join("; ");
                {
                    let mut steps = self.steps.write().await;
                    for (index, _) in &reasons {
                        if let Some(step) =
                            steps.iter_mut().find(|s| s.step_index == *index)
                        {
                            if step.status == StepStatus::Pending {
                                step.status = StepStatus::Blocked;
                            }
                        }
                    }
                }
                let status = self.run.read().await.status;
                if status == ProtocolStatus::Running {
                    self.transition(ProtocolStatus::Blocked).await?;
                    self.save_state().await?;
                    self.emit(
                        "protocol_blocked",
                        EventCategory::Policy,
                        None,
                        format!("no runnable steps: {}", summary),
                        json!({ "reasons": summary }),
                    )
                    .await?;
                }
                let status = self.run.read().await.status;
                Ok(self.outcome(status, &summary, None, None))
            }
            Selection::Deadlock { steps } => {
                // A failed step with retries left is recoverable via
                // retry_step; hold the protocol open for it.
                if self.any_failed_step_retryable().await {
                    let status = self.run.read().await.status;
                    return Ok(self.outcome(
                        status,
                        "step failed; retries remain via retry_step",
                        None,
                        None,
                    ));
                }
                let reason = format!(
                    "steps blocked by failed dependencies: {:?}",
                    steps
                );
                self.fail_protocol(&reason).await?;
                Ok(self.outcome(ProtocolStatus::Failed, &reason, None, None))
            }
        }
    }

    async fn any_failed_step_retryable(&self) -> bool {
        let steps = self.steps.read().await;
        let spec_guard = self.spec.read().await;
        let Some(spec) = spec_guard.as_ref() else {
            return false;
        };
        steps.iter().any(|step| {
            step.status == StepStatus::Failed
                && spec
                    .steps
                    .iter()
                    .find(|s| s.step_index == step.step_index)
                    .is_some_and(|s| step.retries < s.policies.retry_max)
        })
    }

    async fn ensure_runnable(&self) -> Result<()> {
        let status = self.run.read().await.status;
        match status {
            ProtocolStatus::Planned => {
                self.transition(ProtocolStatus::Running).await?;
                self.save_state().await?;
                self.emit(
                    "execution_started",
                    EventCategory::Execution,
                    None,
                    "execution started",
                    json!(null),
                )
                .await?;
                Ok(())
            }
            ProtocolStatus::Running => Ok(()),
            ProtocolStatus::Blocked => {
                // A cleared gate lets the selector move it back to running.
                if let Selection::Batch(_) = self.select().await {
                    self.transition(ProtocolStatus::Running).await?;
                    self.save_state().await?;
                }
                Ok(())
            }
            ProtocolStatus::Pending => Err(ForemanError::InvalidOperation(
                "protocol has no committed plan".to_string(),
            )),
            ProtocolStatus::Paused => Err(ForemanError::InvalidOperation(
                "protocol is paused; resume first".to_string(),
            )),
            other => Err(ForemanError::InvalidOperation(format!(
                "protocol is {:?}",
                other
            ))),
        }
    }

    // ========================================================================
    // Terminal & suspension handlers
    // ========================================================================

    async fn finalize_completed(&self) -> Result<CommandOutcome> {
        let all_satisfied = {
            let steps = self.steps.read().await;
            StepScheduler::all_satisfied(&steps)
        };
        if !all_satisfied {
            return Err(ForemanError::System(
                "selector reported done with unsatisfied steps".to_string(),
            ));
        }

        let status = self.run.read().await.status;
        if status == ProtocolStatus::Completed {
            return Ok(self.outcome(status, "already completed", None, None));
        }
        self.transition(ProtocolStatus::Completed).await?;
        self.save_state().await?;
        self.emit(
            "protocol_completed",
            EventCategory::Lifecycle,
            None,
            "all steps completed",
            json!(null),
        )
        .await?;
        self.release_worktree().await;
        Ok(self.outcome(ProtocolStatus::Completed, "completed", None, None))
    }

    pub(crate) async fn fail_protocol(&self, reason: &str) -> Result<()> {
        let status = self.run.read().await.status;
        if status.is_terminal() {
            return Ok(());
        }
        {
            let mut run = self.run.write().await;
            run.error_message = Some(reason.to_string());
        }
        self.transition(ProtocolStatus::Failed).await?;
        self.save_state().await?;
        self.emit(
            "protocol_failed",
            EventCategory::Lifecycle,
            None,
            reason.to_string(),
            json!({ "reason": reason }),
        )
        .await?;
        self.release_worktree().await;
        Ok(())
    }

    async fn finalize_cancelled(&self) -> Result<CommandOutcome> {
        let status = self.run.read().await.status;
        if status.is_terminal() {
            return Ok(self.outcome(status, "already terminal", None, None));
        }

        {
            let mut steps = self.steps.write().await;
            for step in steps.iter_mut() {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Cancelled;
                }
            }
        }
        self.transition(ProtocolStatus::Cancelled).await?;
        self.save_state().await?;
        self.emit(
            "protocol_cancelled",
            EventCategory::Lifecycle,
            None,
            "protocol cancelled",
            json!(null),
        )
        .await?;
        self.release_worktree().await;
        Ok(self.outcome(ProtocolStatus::Cancelled, "cancelled", None, None))
    }

    async fn finalize_paused(&self) -> Result<CommandOutcome> {
        let status = self.run.read().await.status;
        if status == ProtocolStatus::Paused {
            return Ok(self.outcome(status, "paused", None, None));
        }
        self.transition(ProtocolStatus::Paused).await?;
        self.save_state().await?;
        self.emit(
            "protocol_paused",
            EventCategory::Lifecycle,
            None,
            "execution paused",
            json!(null),
        )
        .await?;
        Ok(self.outcome(ProtocolStatus::Paused, "paused", None, None))
    }

    async fn release_worktree(&self) {
        if let Err(e) = self.shared.worktrees.release(&self.protocol_id).await {
            tracing::warn!(
                protocol_id = %self.protocol_id,
                error = %e,
                "failed to release worktree"
            );
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel_token
            .lock()
            .map(|token| token.is_cancelled())
            .unwrap_or(true)
    }

    pub(crate) fn child_cancel_token(&self) -> CancellationToken {
        self.cancel_token
            .lock()
            .map(|token| token.child_token())
            .unwrap_or_default()
    }

    pub(crate) async fn enforcement(&self) -> EnforcementMode {
        self.run
            .read()
            .await
            .policy
            .as_ref()
            .map(|p| p.enforcement)
            .unwrap_or(self.shared.config.default_enforcement_mode)
    }

    pub(crate) fn resolve_prompt_version(&self, prompt_ref: &str) -> Result<String> {
        match &self.shared.config.prompts_dir {
            None => Ok(format!("{}@inline", prompt_ref)),
            Some(dir) => {
                let path = dir.join(format!("{}.md", prompt_ref));
                let content = std::fs::read(&path).map_err(|_| {
                    ForemanError::Validation(format!(
                        "prompt '{}' not found under {}",
                        prompt_ref,
                        dir.display()
                    ))
                })?;
                let digest = crate::store::sha256_hex(&content);
                Ok(format!("{}@{}", prompt_ref, &digest[..12]))
            }
        }
    }

    pub(crate) async fn transition(&self, to: ProtocolStatus) -> Result<()> {
        let mut run = self.run.write().await;
        machine::transition(&mut run, to)
    }

    pub(crate) async fn save_state(&self) -> Result<()> {
        let run = self.run.read().await.clone();
        let steps = self.steps.read().await.clone();
        self.shared.store.save_protocol(&run)?;
        self.shared.store.save_steps(&self.protocol_id, &steps)?;
        Ok(())
    }

    /// Append a journal event stamped with the current status. Status
    /// transitions persist state before emitting, so observers never see a
    /// journal ahead of the record.
    pub(crate) async fn emit(
        &self,
        kind: &'static str,
        category: EventCategory,
        step_index: Option<u32>,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let status = self.run.read().await.status;
        let mut draft = EventDraft::new(kind, category, message).metadata(metadata);
        if let Some(index) = step_index {
            draft = draft.step(index);
        }
        self.shared.journal.emit(&self.protocol_id, status, draft)?;
        Ok(())
    }

    fn outcome(
        &self,
        status: ProtocolStatus,
        reason: &str,
        step_run_id: Option<String>,
        spec_hash: Option<String>,
    ) -> CommandOutcome {
        CommandOutcome {
            protocol_id: self.protocol_id.clone(),
            status,
            reason: reason.to_string(),
            step_run_id,
            spec_hash,
        }
    }

    /// Feedback-driven re-plan while running: cancel unfinished steps and
    /// commit a synthesized spec version.
    pub(crate) async fn replan_from_feedback(&self) -> Result<()> {
        let spec = self.synthesize_plan().await?;
        if let Err(validation) = plan::validate(&spec) {
            self.emit(
                "spec_validation_error",
                EventCategory::Planning,
                None,
                format!("re-plan validation failed: {}", validation),
                json!({ "error": validation.to_string() }),
            )
            .await?;
            return Err(ForemanError::Validation(validation.to_string()));
        }
        self.commit_plan(spec, false).await?;
        Ok(())
    }

    pub(crate) async fn handle_feedback_outcome(
        &self,
        outcome: &FeedbackOutcome,
        step_index: u32,
    ) -> Result<()> {
        self.emit(
            "feedback_decision",
            EventCategory::Qa,
            Some(step_index),
            format!("feedback outcome: {}", outcome.tag()),
            json!({ "outcome": outcome.tag() }),
        )
        .await
    }
}
