// End-to-end scenarios driven through the dispatcher with scripted seams:
// a recording git executor, a scripted agent adapter, and the default gate
// runner (which skips unmapped gates).

use crate::config::OrchestratorConfig;
use crate::dispatcher::{Orchestrator, OrchestratorSeams};
use crate::error::ForemanError;
use crate::qa::SystemGateRunner;
use async_trait::async_trait;
use foreman_agents::{
    AgentAdapter, AgentContext, AgentErrorInfo, AgentRegistry, AgentResult, AgentStatus,
    DefaultClassifier,
};
use foreman_git::{GitExecutor, GitOutput, WorktreeConfig};
use foreman_types::{
    ProtocolSpec, ProtocolStatus, QaPolicy, QaSpec, StepSpec, StepStatus,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

// ============================================================================
// Scripted seams
// ============================================================================

/// Git executor that answers success and materializes worktree directories
/// so agents have a real cwd to write into.
struct FakeGit;

#[async_trait]
impl GitExecutor for FakeGit {
    async fn run(&self, _cwd: &Path, args: &[&str]) -> foreman_git::Result<GitOutput> {
        if args.first() == Some(&"worktree") && args.get(1) == Some(&"add") {
            // ["worktree", "add", "-b", <branch>, <path>, <base>]
            if let Some(path) = args.get(4) {
                std::fs::create_dir_all(path)?;
            }
        }
        Ok(GitOutput::ok(""))
    }
}

#[derive(Clone)]
enum Scripted {
    Ok { output: String, tokens: u64 },
    Transient { message: String },
    Permanent { message: String },
    /// Emit partial output, then wait for cancellation
    Hang { partial: String },
}

/// Adapter scripted per prompt_ref; unscripted prompts succeed with a stub
/// output.
struct ScriptedAdapter {
    responses: StdMutex<HashMap<String, VecDeque<Scripted>>>,
    calls: StdMutex<Vec<String>>,
}

impl ScriptedAdapter {
    fn new() -> Self {
        Self {
            responses: StdMutex::new(HashMap::new()),
            calls: StdMutex::new(Vec::new()),
        }
    }

    fn script(&self, prompt_ref: &str, responses: Vec<Scripted>) {
        self.responses
            .lock()
            .unwrap()
            .insert(prompt_ref.to_string(), responses.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next_for(&self, prompt_ref: &str) -> Scripted {
        let mut responses = self.responses.lock().unwrap();
        responses
            .get_mut(prompt_ref)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Scripted::Ok {
                output: format!("output of {}", prompt_ref),
                tokens: 100,
            })
    }

    fn write_primary(ctx: &AgentContext, content: &str) -> u64 {
        if let Some(parent) = ctx.output_targets.primary.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&ctx.output_targets.primary, content).unwrap();
        content.len() as u64
    }
}

#[async_trait]
impl AgentAdapter for ScriptedAdapter {
    async fn execute(&self, ctx: AgentContext) -> foreman_agents::Result<AgentResult> {
        self.calls.lock().unwrap().push(ctx.prompt_ref.clone());
        let prompt_version = ctx.prompt_version.clone();

        let respond = |status: AgentStatus, written: u64, error: Option<AgentErrorInfo>| {
            AgentResult {
                status,
                stdout_bytes_written: written,
                aux_bytes_written: 0,
                tokens_used: written.max(1) / 4 + 50,
                cost_estimate: 0.001,
                prompt_version: prompt_version.clone(),
                error,
            }
        };

        match self.next_for(&ctx.prompt_ref) {
            Scripted::Ok { output, tokens } => {
                let written = Self::write_primary(&ctx, &output);
                let mut result = respond(AgentStatus::Ok, written, None);
                result.tokens_used = tokens;
                Ok(result)
            }
            Scripted::Transient { message } => Ok(respond(
                AgentStatus::TransientError,
                0,
                Some(AgentErrorInfo {
                    class: "io".to_string(),
                    message,
                }),
            )),
            Scripted::Permanent { message } => Ok(respond(
                AgentStatus::PermanentError,
                0,
                Some(AgentErrorInfo {
                    class: "exit_status".to_string(),
                    message,
                }),
            )),
            Scripted::Hang { partial } => {
                let written = Self::write_primary(&ctx, &partial);
                ctx.cancel.cancelled().await;
                Ok(respond(
                    AgentStatus::TransientError,
                    written,
                    Some(AgentErrorInfo {
                        class: "cancelled".to_string(),
                        message: "cancellation requested".to_string(),
                    }),
                ))
            }
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    _temp: tempfile::TempDir,
    orchestrator: Arc<Orchestrator>,
    adapter: Arc<ScriptedAdapter>,
}

fn harness_with(config: OrchestratorConfig) -> Harness {
    let temp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(temp.path().join("repo").join(".git")).unwrap();

    let adapter = Arc::new(ScriptedAdapter::new());
    let mut agents = AgentRegistry::new();
    agents.register("codex", adapter.clone());
    agents.register("qa", adapter.clone());

    let orchestrator = Orchestrator::new(
        config,
        &temp.path().join("state"),
        WorktreeConfig {
            repo_root: temp.path().join("repo"),
            worktrees_root: temp.path().join("worktrees"),
            remote_url: None,
            auto_clone: false,
        },
        OrchestratorSeams {
            git: Arc::new(FakeGit),
            agents: Arc::new(agents),
            gates: Arc::new(SystemGateRunner::new()),
            classifier: Arc::new(DefaultClassifier),
        },
    )
    .unwrap();

    Harness {
        _temp: temp,
        orchestrator: Arc::new(orchestrator),
        adapter,
    }
}

fn harness() -> Harness {
    harness_with(OrchestratorConfig::default())
}

fn skip_qa(mut step: StepSpec) -> StepSpec {
    step.policies.qa_policy = QaPolicy::Skip;
    step
}

fn with_deps(mut step: StepSpec, deps: &[u32]) -> StepSpec {
    step.depends_on = deps.iter().copied().collect();
    step
}

fn spec_json(steps: Vec<StepSpec>) -> String {
    serde_json::to_string(&ProtocolSpec { version: 1, steps }).unwrap()
}

async fn event_kinds(orchestrator: &Orchestrator, protocol_id: &str) -> Vec<String> {
    let (events, _) = orchestrator
        .subscribe_events(protocol_id, None)
        .await
        .unwrap();
    events.into_iter().map(|e| e.kind).collect()
}

fn seq_of(kinds: &[String], kind: &str) -> usize {
    kinds
        .iter()
        .position(|k| k == kind)
        .unwrap_or_else(|| panic!("event '{}' not found in {:?}", kind, kinds))
}

// ============================================================================
// Scenario A — happy path, two sequential steps, QA skip
// ============================================================================

#[tokio::test]
async fn scenario_a_happy_path_two_sequential_steps() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "demo", "main")
        .await
        .unwrap();
    assert_eq!(protocol.status, ProtocolStatus::Pending);
    assert_eq!(protocol.name, "0001-demo");

    let document = spec_json(vec![
        skip_qa(StepSpec::new(0, "first")),
        with_deps(skip_qa(StepSpec::new(1, "second")), &[0]),
    ]);
    let planned = h.orchestrator.plan(&protocol.id, &document).await.unwrap();
    assert_eq!(planned.status, ProtocolStatus::Planned);
    assert!(planned.spec_hash.is_some());

    let first = h.orchestrator.run_next(&protocol.id).await.unwrap();
    assert!(first.step_run_id.is_some());
    let second = h.orchestrator.run_next(&protocol.id).await.unwrap();
    assert_eq!(second.status, ProtocolStatus::Completed);

    // A third run_next against the completed protocol is refused.
    let err = h.orchestrator.run_next(&protocol.id).await.unwrap_err();
    assert!(matches!(err, ForemanError::InvalidOperation(_)));

    let kinds = event_kinds(&h.orchestrator, &protocol.id).await;
    for expected in [
        "protocol_created",
        "planning_started",
        "worktree_provisioned",
        "plan_committed",
        "execution_started",
        "step_started",
        "step_completed",
        "protocol_completed",
    ] {
        assert!(kinds.iter().any(|k| k == expected), "missing {}", expected);
    }
    assert_eq!(kinds.iter().filter(|k| *k == "step_completed").count(), 2);

    let snapshot = h.orchestrator.snapshot(&protocol.id).await.unwrap();
    assert_eq!(snapshot.status, ProtocolStatus::Completed);
    assert_eq!(snapshot.steps_completed, 2);
}

// ============================================================================
// Scenario B — parallel group
// ============================================================================

#[tokio::test]
async fn scenario_b_parallel_group_batches_and_joins() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "fanout", "main")
        .await
        .unwrap();

    let mut s1 = with_deps(skip_qa(StepSpec::new(1, "left")), &[0]);
    s1.parallel_group = Some("a".to_string());
    let mut s2 = with_deps(skip_qa(StepSpec::new(2, "right")), &[0]);
    s2.parallel_group = Some("a".to_string());

    let document = spec_json(vec![
        skip_qa(StepSpec::new(0, "root")),
        s1,
        s2,
        with_deps(skip_qa(StepSpec::new(3, "join")), &[1, 2]),
    ]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();

    let outcome = h.orchestrator.run_until_idle(&protocol.id).await.unwrap();
    assert_eq!(outcome.status, ProtocolStatus::Completed);

    let (events, _) = h
        .orchestrator
        .subscribe_events(&protocol.id, None)
        .await
        .unwrap();
    let started_3 = events
        .iter()
        .find(|e| e.kind == "step_started" && e.step_index == Some(3))
        .expect("step 3 started")
        .seq;
    for member in [1, 2] {
        let completed = events
            .iter()
            .find(|e| e.kind == "step_completed" && e.step_index == Some(member))
            .expect("group member completed")
            .seq;
        assert!(
            completed < started_3,
            "step 3 started before step {} completed",
            member
        );
    }
}

// ============================================================================
// Scenario C — transient failure with retry
// ============================================================================

#[tokio::test]
async fn scenario_c_transient_errors_retry_then_succeed() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "flaky", "main")
        .await
        .unwrap();

    h.adapter.script(
        "step-0",
        vec![
            Scripted::Transient {
                message: "connection reset".to_string(),
            },
            Scripted::Transient {
                message: "connection reset".to_string(),
            },
            Scripted::Ok {
                output: "done".to_string(),
                tokens: 120,
            },
        ],
    );

    let document = spec_json(vec![skip_qa(StepSpec::new(0, "flaky"))]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();

    h.orchestrator.run_next(&protocol.id).await.unwrap();
    h.orchestrator.run_next(&protocol.id).await.unwrap();
    let outcome = h.orchestrator.run_next(&protocol.id).await.unwrap();
    assert_eq!(outcome.status, ProtocolStatus::Completed);

    let steps = h.orchestrator.step_runs(&protocol.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[0].attempts, 3);
    assert_eq!(steps[0].retries, 2);

    let kinds = event_kinds(&h.orchestrator, &protocol.id).await;
    assert_eq!(
        kinds.iter().filter(|k| *k == "step_retry_scheduled").count(),
        2
    );
}

#[tokio::test]
async fn retries_exhaust_into_step_failure() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "doomed", "main")
        .await
        .unwrap();

    h.adapter.script(
        "step-0",
        vec![
            Scripted::Transient {
                message: "io".to_string(),
            };
            4
        ],
    );

    let document = spec_json(vec![skip_qa(StepSpec::new(0, "doomed"))]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();

    // retry_max = 2: attempts 1..=3, the third failure is terminal and, with
    // no retries left, fails the protocol in the same command.
    let mut last = None;
    for _ in 0..3 {
        last = Some(h.orchestrator.run_next(&protocol.id).await.unwrap());
    }
    assert_eq!(last.unwrap().status, ProtocolStatus::Failed);

    let steps = h.orchestrator.step_runs(&protocol.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert_eq!(steps[0].attempts, 3);
    assert_eq!(steps[0].retries, 2);
}

// ============================================================================
// Scenario D — blocking clarification
// ============================================================================

#[tokio::test]
async fn scenario_d_blocking_clarification_gates_reservation() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "gated", "main")
        .await
        .unwrap();

    let document = spec_json(vec![skip_qa(StepSpec::new(0, "impl"))]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();

    h.orchestrator
        .raise_clarification(&protocol.id, "db_choice", "Which database?", true)
        .await
        .unwrap();

    let blocked = h.orchestrator.run_next(&protocol.id).await.unwrap();
    assert_eq!(blocked.status, ProtocolStatus::Blocked);
    assert!(blocked.reason.contains("db_choice"));

    let answered = h
        .orchestrator
        .answer_clarification(&protocol.id, "db_choice", "Postgres")
        .await
        .unwrap();
    assert_eq!(answered.status, ProtocolStatus::Running);

    let outcome = h.orchestrator.run_next(&protocol.id).await.unwrap();
    assert_eq!(outcome.status, ProtocolStatus::Completed);

    // The step was never reserved while the blocker was open.
    let kinds = event_kinds(&h.orchestrator, &protocol.id).await;
    assert!(seq_of(&kinds, "step_reserved") > seq_of(&kinds, "clarification_answered"));
}

// ============================================================================
// Scenario E — QA fail triggers re-plan
// ============================================================================

#[tokio::test]
async fn scenario_e_qa_fail_replans_with_fresh_spec() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "replanned", "main")
        .await
        .unwrap();

    let mut gated = StepSpec::new(0, "impl");
    gated.policies.qa_policy = QaPolicy::Full;
    gated.qa = Some(QaSpec {
        engine_id: "qa".to_string(),
        model: "default".to_string(),
        prompt_ref: "qa-0".to_string(),
        required_gates: Vec::new(),
    });

    h.adapter.script(
        "qa-0",
        vec![Scripted::Ok {
            output: r#"{"verdict":"fail","rationale":"plan is wrong","action":"re_plan"}"#
                .to_string(),
            tokens: 40,
        }],
    );
    let replacement = spec_json(vec![
        skip_qa(StepSpec::new(0, "impl-v2")),
        with_deps(skip_qa(StepSpec::new(1, "test-v2")), &[0]),
    ]);
    h.adapter.script(
        "planner",
        vec![Scripted::Ok {
            output: replacement,
            tokens: 200,
        }],
    );

    let document = spec_json(vec![gated]);
    let first_plan = h.orchestrator.plan(&protocol.id, &document).await.unwrap();
    let first_hash = first_plan.spec_hash.unwrap();

    h.orchestrator.run_next(&protocol.id).await.unwrap();

    let kinds = event_kinds(&h.orchestrator, &protocol.id).await;
    assert!(kinds.iter().any(|k| k == "qa_verdict"));
    assert!(kinds.iter().any(|k| k == "feedback_decision"));
    assert_eq!(kinds.iter().filter(|k| *k == "plan_committed").count(), 2);

    let snapshot = h.orchestrator.snapshot(&protocol.id).await.unwrap();
    assert_eq!(snapshot.step_count, 2);
    assert_ne!(snapshot.spec_hash.as_deref(), Some(first_hash.as_str()));

    let outcome = h.orchestrator.run_until_idle(&protocol.id).await.unwrap();
    assert_eq!(outcome.status, ProtocolStatus::Completed);

    let steps = h.orchestrator.step_runs(&protocol.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
}

// ============================================================================
// Scenario F — cancellation mid-agent
// ============================================================================

#[tokio::test]
async fn scenario_f_cancel_mid_agent_flags_partial_artifacts() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "longrun", "main")
        .await
        .unwrap();

    h.adapter.script(
        "step-0",
        vec![Scripted::Hang {
            partial: "partial output".to_string(),
        }],
    );

    let document = spec_json(vec![skip_qa(StepSpec::new(0, "long"))]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();

    let orchestrator = h.orchestrator.clone();
    let id = protocol.id.clone();
    let runner = tokio::spawn(async move { orchestrator.run_next(&id).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled = h.orchestrator.cancel(&protocol.id).await.unwrap();
    assert_eq!(cancelled.status, ProtocolStatus::Cancelled);

    let outcome = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("run_next returned promptly after cancel")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, ProtocolStatus::Cancelled);

    let steps = h.orchestrator.step_runs(&protocol.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Cancelled);
    let stdout = steps[0]
        .artifacts
        .iter()
        .find(|a| a.name == "stdout")
        .expect("partial stdout captured");
    assert!(stdout.partial);

    let kinds = event_kinds(&h.orchestrator, &protocol.id).await;
    assert!(kinds.iter().any(|k| k == "step_artifacts_partial"));
    assert!(kinds.iter().any(|k| k == "step_cancelled"));
    assert!(kinds.iter().any(|k| k == "protocol_cancelled"));
}

// ============================================================================
// Invariants
// ============================================================================

#[tokio::test]
async fn plan_is_idempotent_for_unchanged_documents() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "idem", "main")
        .await
        .unwrap();

    let document = spec_json(vec![skip_qa(StepSpec::new(0, "only"))]);
    let first = h.orchestrator.plan(&protocol.id, &document).await.unwrap();
    let second = h.orchestrator.plan(&protocol.id, &document).await.unwrap();

    assert_eq!(first.spec_hash, second.spec_hash);
    assert_eq!(second.status, ProtocolStatus::Planned);
    assert_eq!(second.reason, "plan unchanged");

    let kinds = event_kinds(&h.orchestrator, &protocol.id).await;
    assert_eq!(kinds.iter().filter(|k| *k == "plan_committed").count(), 1);
    assert_eq!(kinds.iter().filter(|k| *k == "plan_unchanged").count(), 1);
}

#[tokio::test]
async fn invalid_spec_fails_planning_with_validation_event() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "badspec", "main")
        .await
        .unwrap();

    // Cycle: 0 -> 1 -> 0.
    let document = spec_json(vec![
        with_deps(StepSpec::new(0, "a"), &[1]),
        with_deps(StepSpec::new(1, "b"), &[0]),
    ]);
    let err = h.orchestrator.plan(&protocol.id, &document).await.unwrap_err();
    assert!(matches!(err, ForemanError::Validation(_)));

    let snapshot = h.orchestrator.snapshot(&protocol.id).await.unwrap();
    assert_eq!(snapshot.status, ProtocolStatus::Failed);

    let kinds = event_kinds(&h.orchestrator, &protocol.id).await;
    assert!(kinds.iter().any(|k| k == "spec_validation_error"));
}

#[tokio::test]
async fn event_seq_is_strictly_increasing_with_monotone_clock() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "ordered", "main")
        .await
        .unwrap();
    let document = spec_json(vec![
        skip_qa(StepSpec::new(0, "a")),
        with_deps(skip_qa(StepSpec::new(1, "b")), &[0]),
    ]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();
    h.orchestrator.run_until_idle(&protocol.id).await.unwrap();

    let (events, _) = h
        .orchestrator
        .subscribe_events(&protocol.id, None)
        .await
        .unwrap();
    assert!(!events.is_empty());
    for window in events.windows(2) {
        assert!(window[1].seq == window[0].seq + 1, "seq gap or reorder");
        assert!(window[1].mono_ms >= window[0].mono_ms);
        assert!(window[1].ts >= window[0].ts);
    }
}

#[tokio::test]
async fn terminal_protocols_emit_no_further_events() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "closed", "main")
        .await
        .unwrap();
    let document = spec_json(vec![skip_qa(StepSpec::new(0, "only"))]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();
    h.orchestrator.run_next(&protocol.id).await.unwrap();

    let before = event_kinds(&h.orchestrator, &protocol.id).await.len();

    assert!(h.orchestrator.run_next(&protocol.id).await.is_err());
    assert!(h.orchestrator.resume(&protocol.id).await.is_err());
    assert!(h
        .orchestrator
        .retry_step(&protocol.id, 0)
        .await
        .is_err());
    // Cancel on a terminal protocol is a no-op.
    let outcome = h.orchestrator.cancel(&protocol.id).await.unwrap();
    assert_eq!(outcome.status, ProtocolStatus::Completed);

    let after = event_kinds(&h.orchestrator, &protocol.id).await.len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn concurrent_commands_serialize_per_protocol() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "serial", "main")
        .await
        .unwrap();
    let document = spec_json(vec![skip_qa(StepSpec::new(0, "only"))]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();

    let a = {
        let orchestrator = h.orchestrator.clone();
        let id = protocol.id.clone();
        tokio::spawn(async move { orchestrator.run_next(&id).await })
    };
    let b = {
        let orchestrator = h.orchestrator.clone();
        let id = protocol.id.clone();
        tokio::spawn(async move { orchestrator.run_next(&id).await })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert!(successes >= 1);

    // Exactly one reservation happened regardless of command interleaving.
    let steps = h.orchestrator.step_runs(&protocol.id).await.unwrap();
    assert_eq!(steps[0].attempts, 1);
    assert_eq!(steps[0].status, StepStatus::Completed);
}

#[tokio::test]
async fn budget_exhaustion_blocks_instead_of_running() {
    let h = harness_with(OrchestratorConfig {
        default_token_budget: Some(1_000),
        ..OrchestratorConfig::default()
    });
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "broke", "main")
        .await
        .unwrap();
    let document = spec_json(vec![skip_qa(StepSpec::new(0, "expensive"))]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();

    // The default per-step estimate (8k tokens) exceeds the 1k budget, so
    // the selector reports the step policy-blocked before any reservation.
    let outcome = h.orchestrator.run_next(&protocol.id).await.unwrap();
    assert_eq!(outcome.status, ProtocolStatus::Blocked);
    assert!(outcome.reason.contains("token budget"));

    let kinds = event_kinds(&h.orchestrator, &protocol.id).await;
    assert!(kinds.iter().any(|k| k == "protocol_blocked"));
    assert!(!kinds.iter().any(|k| k == "step_reserved"));
    assert!(h.adapter.calls().is_empty(), "no agent call was made");
}

#[tokio::test]
async fn pause_refuses_new_reservations_until_resume() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "paused", "main")
        .await
        .unwrap();
    let document = spec_json(vec![
        skip_qa(StepSpec::new(0, "a")),
        with_deps(skip_qa(StepSpec::new(1, "b")), &[0]),
    ]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();
    h.orchestrator.run_next(&protocol.id).await.unwrap();

    let paused = h.orchestrator.pause(&protocol.id).await.unwrap();
    assert_eq!(paused.status, ProtocolStatus::Paused);

    let err = h.orchestrator.run_next(&protocol.id).await.unwrap_err();
    assert!(matches!(err, ForemanError::InvalidOperation(_)));

    h.orchestrator.resume(&protocol.id).await.unwrap();
    let outcome = h.orchestrator.run_next(&protocol.id).await.unwrap();
    assert_eq!(outcome.status, ProtocolStatus::Completed);
}

#[tokio::test]
async fn inline_trigger_runs_dependents_up_to_depth_limit() {
    let h = harness_with(OrchestratorConfig {
        max_inline_trigger_depth: 1,
        ..OrchestratorConfig::default()
    });
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "chained", "main")
        .await
        .unwrap();

    let mut s0 = skip_qa(StepSpec::new(0, "root"));
    s0.inline_trigger = true;
    let mut s1 = with_deps(skip_qa(StepSpec::new(1, "mid")), &[0]);
    s1.inline_trigger = true;
    let s2 = with_deps(skip_qa(StepSpec::new(2, "leaf")), &[1]);

    let document = spec_json(vec![s0, s1, s2]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();

    // One command runs step 0 plus its inline dependent (depth 1); step 2
    // hits the depth limit and is re-queued normally.
    h.orchestrator.run_next(&protocol.id).await.unwrap();
    let steps = h.orchestrator.step_runs(&protocol.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_eq!(steps[2].status, StepStatus::Pending);

    let kinds = event_kinds(&h.orchestrator, &protocol.id).await;
    assert!(kinds.iter().any(|k| k == "inline_trigger_limit_hit"));

    let outcome = h.orchestrator.run_next(&protocol.id).await.unwrap();
    assert_eq!(outcome.status, ProtocolStatus::Completed);
}

#[tokio::test]
async fn saturated_worker_pool_returns_busy() {
    let h = harness_with(OrchestratorConfig {
        max_parallel_steps: 1,
        ..OrchestratorConfig::default()
    });

    let blocked = h
        .orchestrator
        .create_protocol("project-1", "holder", "main")
        .await
        .unwrap();
    h.adapter.script(
        "step-0",
        vec![Scripted::Hang {
            partial: String::new(),
        }],
    );
    let document = spec_json(vec![skip_qa(StepSpec::new(0, "slow"))]);
    h.orchestrator.plan(&blocked.id, &document).await.unwrap();

    let orchestrator = h.orchestrator.clone();
    let holder_id = blocked.id.clone();
    let holder = tokio::spawn(async move { orchestrator.run_next(&holder_id).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let other = h
        .orchestrator
        .create_protocol("project-1", "waiter", "main")
        .await
        .unwrap();
    let err = h.orchestrator.run_next(&other.id).await.unwrap_err();
    assert!(matches!(err, ForemanError::Busy(_)));

    h.orchestrator.cancel(&blocked.id).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), holder).await;
}

#[tokio::test]
async fn qa_light_runs_gates_but_not_prompt() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "light", "main")
        .await
        .unwrap();

    let mut step = StepSpec::new(0, "impl");
    step.policies.qa_policy = QaPolicy::Light;
    step.qa = Some(QaSpec {
        engine_id: "qa".to_string(),
        model: "default".to_string(),
        prompt_ref: "qa-0".to_string(),
        required_gates: vec!["lint".to_string()],
    });

    let document = spec_json(vec![step]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();
    let outcome = h.orchestrator.run_next(&protocol.id).await.unwrap();
    assert_eq!(outcome.status, ProtocolStatus::Completed);

    // Gate "lint" is unmapped (skipped) and the prompt agent was never
    // invoked under the light policy.
    assert!(!h.adapter.calls().iter().any(|c| c == "qa-0"));

    let steps = h.orchestrator.step_runs(&protocol.id).await.unwrap();
    let verdict = steps[0].qa_verdict.as_ref().unwrap();
    assert_eq!(verdict.gates.len(), 1);
    assert!(verdict.prompt_verdict.is_none());
}

#[tokio::test]
async fn failed_step_with_retries_left_supports_manual_retry() {
    let h = harness();
    let protocol = h
        .orchestrator
        .create_protocol("project-1", "manual", "main")
        .await
        .unwrap();

    h.adapter.script(
        "step-0",
        vec![
            Scripted::Permanent {
                message: "assertion failed".to_string(),
            },
            Scripted::Ok {
                output: "fixed".to_string(),
                tokens: 80,
            },
        ],
    );
    let document = spec_json(vec![skip_qa(StepSpec::new(0, "flappy"))]);
    h.orchestrator.plan(&protocol.id, &document).await.unwrap();

    // Permanent error fails the step immediately, but retries remain, so
    // the protocol stays open for a manual retry.
    let outcome = h.orchestrator.run_next(&protocol.id).await.unwrap();
    assert_ne!(outcome.status, ProtocolStatus::Failed);
    let steps = h.orchestrator.step_runs(&protocol.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);

    h.orchestrator.retry_step(&protocol.id, 0).await.unwrap();
    let outcome = h.orchestrator.run_next(&protocol.id).await.unwrap();
    assert_eq!(outcome.status, ProtocolStatus::Completed);
}
