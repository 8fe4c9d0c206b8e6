// Command Dispatcher
// The external API: create protocols, submit commands, observe events.
// Commands to one protocol serialize on its lease; different protocols
// proceed in parallel up to the worker pool size.

use crate::clarifications::ClarificationRegistry;
use crate::config::OrchestratorConfig;
use crate::engine::{CommandOutcome, EngineShared, ProtocolEngine};
use crate::error::{ForemanError, Result};
use crate::ids::IdProvider;
use crate::journal::{EventDraft, EventJournal};
use crate::policy::PolicyEvaluator;
use crate::qa::{GateCommandRunner, QaGateRunner};
use crate::store::ProtocolStore;
use foreman_agents::{AgentRegistry, ErrorClassifier};
use foreman_git::{GitExecutor, WorktreeConfig, WorktreeCoordinator};
use foreman_types::{
    EventCategory, EventRecord, ProtocolRun, ProtocolSnapshot, ProtocolStatus, StepRun,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock, Semaphore, TryAcquireError};

/// Interface seams injected at construction so tests substitute fakes
/// without patching.
pub struct OrchestratorSeams {
    pub git: Arc<dyn GitExecutor>,
    pub agents: Arc<AgentRegistry>,
    pub gates: Arc<dyn GateCommandRunner>,
    pub classifier: Arc<dyn ErrorClassifier>,
}

pub struct Orchestrator {
    shared: Arc<EngineShared>,
    engines: RwLock<HashMap<String, Arc<ProtocolEngine>>>,
    workers: Arc<Semaphore>,
    worker_pool_size: usize,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        state_root: &Path,
        worktree_config: WorktreeConfig,
        seams: OrchestratorSeams,
    ) -> Result<Self> {
        let store = Arc::new(ProtocolStore::new(state_root)?);
        let journal = Arc::new(EventJournal::new(store.clone()));
        let worktrees = Arc::new(WorktreeCoordinator::new(worktree_config, seams.git));
        let clarifications = Arc::new(ClarificationRegistry::new(store.clone())?);
        let qa_runner = Arc::new(QaGateRunner::new(
            seams.gates,
            seams.agents.clone(),
            config.qa_wall_time(),
        ));
        let worker_pool_size = config.max_parallel_steps.max(1) as usize;

        let shared = Arc::new(EngineShared {
            policy: PolicyEvaluator::new(config.clone()),
            config,
            store,
            journal,
            worktrees,
            agents: seams.agents,
            classifier: seams.classifier,
            qa_runner,
            clarifications,
            ids: IdProvider,
        });

        Ok(Self {
            shared,
            engines: RwLock::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(worker_pool_size)),
            worker_pool_size,
        })
    }

    // ========================================================================
    // Command surface
    // ========================================================================

    /// Create a protocol in `pending` with a monotone `NNNN` name prefix.
    pub async fn create_protocol(
        &self,
        project_id: &str,
        name_hint: &str,
        base_branch: &str,
    ) -> Result<ProtocolRun> {
        let number = self.shared.store.allocate_number(project_id)?;
        let id = self.shared.ids.new_id();
        let name = WorktreeCoordinator::branch_name(number, name_hint);

        let run = ProtocolRun::new(
            id.clone(),
            project_id.to_string(),
            number,
            name.clone(),
            base_branch.to_string(),
        );
        self.shared.store.save_protocol(&run)?;
        self.shared.journal.emit(
            &id,
            ProtocolStatus::Pending,
            EventDraft::new(
                "protocol_created",
                EventCategory::Lifecycle,
                format!("protocol {} created", name),
            )
            .metadata(json!({ "project_id": project_id, "base_branch": base_branch })),
        )?;

        let engine = Arc::new(ProtocolEngine::new(
            run.clone(),
            Vec::new(),
            None,
            self.shared.clone(),
        ));
        self.engines.write().await.insert(id, engine);

        tracing::info!(protocol_id = %run.id, name = %run.name, "protocol created");
        Ok(run)
    }

    pub async fn plan(&self, protocol_id: &str, spec_document: &str) -> Result<CommandOutcome> {
        self.engine(protocol_id).await?.plan(spec_document).await
    }

    /// Reserve and execute at most one runnable step. Returns `busy` without
    /// queueing when the worker pool is saturated.
    pub async fn run_next(&self, protocol_id: &str) -> Result<CommandOutcome> {
        let _permit = self.worker_permit()?;
        self.engine(protocol_id).await?.run_next().await
    }

    /// Drive the protocol until the selector reports blocked or done.
    pub async fn run_until_idle(&self, protocol_id: &str) -> Result<CommandOutcome> {
        let _permit = self.worker_permit()?;
        self.engine(protocol_id).await?.run_until_idle().await
    }

    pub async fn pause(&self, protocol_id: &str) -> Result<CommandOutcome> {
        self.engine(protocol_id).await?.pause().await
    }

    pub async fn resume(&self, protocol_id: &str) -> Result<CommandOutcome> {
        self.engine(protocol_id).await?.resume().await
    }

    pub async fn cancel(&self, protocol_id: &str) -> Result<CommandOutcome> {
        self.engine(protocol_id).await?.cancel().await
    }

    pub async fn answer_clarification(
        &self,
        protocol_id: &str,
        key: &str,
        answer: &str,
    ) -> Result<CommandOutcome> {
        self.engine(protocol_id)
            .await?
            .answer_clarification(key, answer)
            .await
    }

    pub async fn retry_step(&self, protocol_id: &str, step_index: u32) -> Result<CommandOutcome> {
        self.engine(protocol_id).await?.retry_step(step_index).await
    }

    /// Raise a blocking (or advisory) clarification against a protocol.
    pub async fn raise_clarification(
        &self,
        protocol_id: &str,
        key: &str,
        question: &str,
        blocking: bool,
    ) -> Result<foreman_types::Clarification> {
        self.engine(protocol_id)
            .await?
            .raise_clarification(key, question, blocking)
            .await
    }

    // ========================================================================
    // Observation surface
    // ========================================================================

    pub async fn snapshot(&self, protocol_id: &str) -> Result<ProtocolSnapshot> {
        Ok(self.engine(protocol_id).await?.snapshot().await)
    }

    pub async fn step_runs(&self, protocol_id: &str) -> Result<Vec<StepRun>> {
        Ok(self.engine(protocol_id).await?.step_runs().await)
    }

    /// Replay a protocol's journal from `since_seq`, plus a live receiver.
    /// The receiver carries all protocols; filter on `protocol_id`.
    pub async fn subscribe_events(
        &self,
        protocol_id: &str,
        since_seq: Option<u64>,
    ) -> Result<(Vec<EventRecord>, broadcast::Receiver<EventRecord>)> {
        if !self.shared.store.protocol_exists(protocol_id) {
            return Err(ForemanError::NotFound(format!("protocol {}", protocol_id)));
        }
        let replay = self.shared.journal.replay(protocol_id, since_seq)?;
        Ok((replay, self.shared.journal.subscribe()))
    }

    pub fn list_protocols(&self) -> Result<Vec<String>> {
        self.shared.store.list_protocols()
    }

    pub fn read_artifact(
        &self,
        protocol_id: &str,
        step_run_id: &str,
        name: &str,
    ) -> Result<Vec<u8>> {
        self.shared.store.read_artifact(protocol_id, step_run_id, name)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn worker_permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        match self.workers.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => Err(ForemanError::Busy(format!(
                "worker pool saturated ({} workers in use)",
                self.worker_pool_size
            ))),
            Err(TryAcquireError::Closed) => {
                Err(ForemanError::System("worker pool closed".to_string()))
            }
        }
    }

    /// Fetch the live engine or rehydrate it from the store.
    async fn engine(&self, protocol_id: &str) -> Result<Arc<ProtocolEngine>> {
        if let Some(engine) = self.engines.read().await.get(protocol_id) {
            return Ok(engine.clone());
        }

        let mut engines = self.engines.write().await;
        // Double-checked: another command may have rehydrated meanwhile.
        if let Some(engine) = engines.get(protocol_id) {
            return Ok(engine.clone());
        }

        let run = self.shared.store.load_protocol(protocol_id)?;
        let steps = self.shared.store.load_steps(protocol_id)?;
        let spec = match &run.spec_hash {
            Some(hash) => Some(self.shared.store.load_spec(protocol_id, hash)?),
            None => None,
        };
        // A live protocol's worktree survives the process; re-register its
        // lease so exclusivity holds and the executor can run steps again.
        if !run.status.is_terminal() {
            if let (Some(branch), Some(path)) = (&run.branch_name, &run.worktree_path) {
                self.shared.worktrees.adopt(&run.id, branch, path.clone())?;
            }
        }
        let engine = Arc::new(ProtocolEngine::rehydrate(
            run,
            steps,
            spec,
            self.shared.clone(),
        )?);
        engines.insert(protocol_id.to_string(), engine.clone());
        Ok(engine)
    }
}
