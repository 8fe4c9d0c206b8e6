//! The single boundary between the orchestrator and external agent
//! processes. The orchestrator never inspects prompt text or engine
//! internals; adapters own process spawning, output capture, and usage
//! accounting.

pub mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum AgentAdapterError {
    #[error("engine not registered: {0}")]
    EngineNotRegistered(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("output capture failed: {0}")]
    CaptureFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentAdapterError>;

/// Terminal status of one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Ok,
    TransientError,
    PermanentError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentErrorInfo {
    /// Stable classification tag, e.g. `timeout`, `cancelled`, `exit_status`
    pub class: String,
    pub message: String,
}

/// Result contract of `AgentAdapter::execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub status: AgentStatus,
    pub stdout_bytes_written: u64,
    pub aux_bytes_written: u64,
    pub tokens_used: u64,
    pub cost_estimate: f64,
    /// Concrete identifier of the prompt actually used
    pub prompt_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentErrorInfo>,
}

impl AgentResult {
    pub fn is_ok(&self) -> bool {
        self.status == AgentStatus::Ok
    }
}

/// Resource limits for one invocation.
#[derive(Debug, Clone)]
pub struct AgentLimits {
    pub wall_time: Duration,
    pub token_budget: Option<u64>,
}

/// Where captured outputs land on disk, all inside the worktree.
#[derive(Debug, Clone)]
pub struct OutputTargets {
    pub primary: PathBuf,
    pub aux: BTreeMap<String, PathBuf>,
}

/// Everything an adapter needs for one invocation.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Always the protocol's worktree; agents must not operate outside it
    pub working_directory: PathBuf,
    pub prompt_ref: String,
    /// Resolved by the shared prompt resolver before dispatch
    pub prompt_version: String,
    pub resolved_inputs: BTreeMap<String, PathBuf>,
    pub output_targets: OutputTargets,
    pub limits: AgentLimits,
    pub cancel: CancellationToken,
}

/// Narrow contract for invoking an agent engine, implemented once per engine.
#[async_trait]
pub trait AgentAdapter: Send + Sync + 'static {
    async fn execute(&self, ctx: AgentContext) -> Result<AgentResult>;
}

/// Whether a failed invocation is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Pluggable transient-vs-permanent classification for adapter failures.
pub trait ErrorClassifier: Send + Sync + 'static {
    fn classify(&self, class: &str, message: &str) -> ErrorClass;
}

/// Default heuristics: infrastructure hiccups retry, everything else fails.
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, class: &str, message: &str) -> ErrorClass {
        if matches!(class, "timeout" | "cancelled" | "spawn" | "signal" | "io") {
            return ErrorClass::Transient;
        }
        let m = message.to_lowercase();
        if m.contains("rate limit")
            || m.contains("ratelimit")
            || m.contains("too many requests")
            || m.contains("429")
            || m.contains("connection reset")
            || m.contains("temporarily unavailable")
        {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }
}

/// Adapter lookup by engine id. No code outside adapters observes engine
/// identity beyond this key.
#[derive(Default)]
pub struct AgentRegistry {
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine_id: impl Into<String>, adapter: Arc<dyn AgentAdapter>) {
        self.adapters.insert(engine_id.into(), adapter);
    }

    pub fn get(&self, engine_id: &str) -> Result<Arc<dyn AgentAdapter>> {
        self.adapters
            .get(engine_id)
            .cloned()
            .ok_or_else(|| AgentAdapterError::EngineNotRegistered(engine_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classifier_treats_timeouts_as_transient() {
        let classifier = DefaultClassifier;
        assert_eq!(
            classifier.classify("timeout", "wall clock exceeded"),
            ErrorClass::Transient
        );
        assert_eq!(
            classifier.classify("exit_status", "HTTP 429 too many requests"),
            ErrorClass::Transient
        );
        assert_eq!(
            classifier.classify("exit_status", "assertion failed"),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn registry_resolves_by_engine_id() {
        struct Noop;
        #[async_trait]
        impl AgentAdapter for Noop {
            async fn execute(&self, _ctx: AgentContext) -> Result<AgentResult> {
                unreachable!("not invoked in this test")
            }
        }

        let mut registry = AgentRegistry::new();
        registry.register("codex", Arc::new(Noop));
        assert!(registry.get("codex").is_ok());
        assert!(matches!(
            registry.get("claude"),
            Err(AgentAdapterError::EngineNotRegistered(_))
        ));
    }
}
