use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::qa::QaVerdict;

/// State of a step run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for dependencies or a worker
    Pending,
    /// A worker committed to this step but has not started the agent yet
    Reserved,
    /// Agent invocation in flight
    Running,
    /// Agent finished, QA verdict outstanding
    NeedsQa,
    Completed,
    Failed,
    Cancelled,
    /// Gated by an open clarification or a policy precondition
    Blocked,
    /// Optional step bypassed under a skip QA policy
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled | StepStatus::Skipped
        )
    }

    /// Counts toward the protocol completion rule.
    pub fn is_satisfied(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

/// What kind of output an artifact record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Stdout,
    Aux,
    GitStatus,
    Diff,
}

/// One captured output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub kind: ArtifactKind,
    /// Set when capture was interrupted by cancellation
    #[serde(default)]
    pub partial: bool,
}

/// Execution record for one (protocol, step_index) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    /// Unique step run identifier
    pub id: String,
    pub protocol_id: String,
    pub step_index: u32,
    pub status: StepStatus,
    /// Total invocation attempts, including the first
    pub attempts: u32,
    /// Transient-failure retries consumed
    pub retries: u32,
    /// Feedback loops consumed
    pub loop_count: u32,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_verdict: Option<QaVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepRun {
    pub fn new(id: String, protocol_id: String, step_index: u32) -> Self {
        Self {
            id,
            protocol_id,
            step_index,
            status: StepStatus::Pending,
            attempts: 0,
            retries: 0,
            loop_count: 0,
            artifacts: Vec::new(),
            qa_verdict: None,
            error_message: None,
            started_at: None,
            ended_at: None,
        }
    }
}
