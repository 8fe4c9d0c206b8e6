use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::step::{StepRun, StepStatus};

/// Status of a protocol run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolStatus {
    /// Created, no plan yet
    Pending,
    /// Planner is validating and materializing the spec
    Planning,
    /// Plan committed, awaiting execution
    Planned,
    /// Steps may be reserved and executed
    Running,
    /// Execution suspended by an operator
    Paused,
    /// No step is runnable because of open clarifications or policy gates
    Blocked,
    /// Unrecoverable failure
    Failed,
    /// Cancelled by an operator
    Cancelled,
    /// Every step reached completed or skipped
    Completed,
}

impl ProtocolStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProtocolStatus::Completed | ProtocolStatus::Failed | ProtocolStatus::Cancelled
        )
    }
}

/// Policy enforcement mode, inherited from the project unless overridden.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    Off,
    #[default]
    Warn,
    Block,
}

/// Policy state frozen when the plan commits. Re-planning freezes a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Hash over the serialized policy content
    pub policy_hash: String,
    pub enforcement: EnforcementMode,
    /// Protocol-wide token budget; `None` means unmetered
    pub token_budget: Option<u64>,
    pub frozen_at: DateTime<Utc>,
}

/// Cumulative budget counters for one protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub tokens_used: u64,
    pub cost_estimate: f64,
    /// Copied from the policy snapshot at planning time
    pub token_budget: Option<u64>,
}

impl BudgetUsage {
    pub fn remaining(&self) -> Option<u64> {
        self.token_budget.map(|b| b.saturating_sub(self.tokens_used))
    }

    /// True when a call expected to cost `estimate` tokens would overrun the budget.
    pub fn would_exceed(&self, estimate: u64) -> bool {
        match self.token_budget {
            Some(budget) => self.tokens_used.saturating_add(estimate) > budget,
            None => false,
        }
    }

    pub fn record(&mut self, tokens: u64, cost: f64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        self.cost_estimate += cost;
    }
}

/// One unit of delivery work: a branch-worth of change with a frozen plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolRun {
    /// Unique protocol identifier
    pub id: String,
    pub project_id: String,
    /// Monotone per-project sequence, rendered as the `NNNN` name prefix
    pub number: u32,
    /// Unique per project, `NNNN-<short-name>`
    pub name: String,
    pub status: ProtocolStatus,
    pub base_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    /// Content hash of the currently committed spec version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicySnapshot>,
    pub budget: BudgetUsage,
    /// Deepest inline-trigger chain observed so far
    pub inline_trigger_depth: u32,
    /// Feedback loop counts keyed by step index
    #[serde(default)]
    pub loop_counts: HashMap<u32, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProtocolRun {
    pub fn new(
        id: String,
        project_id: String,
        number: u32,
        name: String,
        base_branch: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_id,
            number,
            name,
            status: ProtocolStatus::Pending,
            base_branch,
            branch_name: None,
            worktree_path: None,
            spec_hash: None,
            policy: None,
            budget: BudgetUsage::default(),
            inline_trigger_depth: 0,
            loop_counts: HashMap::new(),
            created_at: now,
            updated_at: now,
            ended_at: None,
            error_message: None,
        }
    }

    pub fn loop_count(&self, step_index: u32) -> u32 {
        self.loop_counts.get(&step_index).copied().unwrap_or(0)
    }

    pub fn to_snapshot(&self, steps: &[StepRun]) -> ProtocolSnapshot {
        let mut snapshot = ProtocolSnapshot {
            protocol_id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            spec_hash: self.spec_hash.clone(),
            step_count: steps.len(),
            steps_completed: 0,
            steps_failed: 0,
            steps_blocked: 0,
            active_step_indices: Vec::new(),
            budget: self.budget.clone(),
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        for step in steps {
            match step.status {
                StepStatus::Completed | StepStatus::Skipped => snapshot.steps_completed += 1,
                StepStatus::Failed => snapshot.steps_failed += 1,
                StepStatus::Blocked => snapshot.steps_blocked += 1,
                StepStatus::Reserved | StepStatus::Running | StepStatus::NeedsQa => {
                    snapshot.active_step_indices.push(step.step_index);
                }
                StepStatus::Pending | StepStatus::Cancelled => {}
            }
        }
        snapshot
    }
}

/// Point-in-time projection of a protocol for observers.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolSnapshot {
    pub protocol_id: String,
    pub name: String,
    pub status: ProtocolStatus,
    pub spec_hash: Option<String>,
    pub step_count: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub steps_blocked: usize,
    pub active_step_indices: Vec<u32>,
    pub budget: BudgetUsage,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
