// Policy Evaluator
// Loop limits, retry decisions, inline-trigger depth, token budgets, and
// enforcement-mode lookups. Pure decisions; callers apply the effects.

use crate::config::OrchestratorConfig;
use foreman_agents::ErrorClass;
use foreman_types::{BudgetUsage, Clarification, ProtocolRun, StepRun, StepSpec};

/// Result of a protocol-level budget check.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetCheckResult {
    Ok,
    Warning { fraction: f64 },
    Exceeded { reason: String },
}

/// Why a step is not policy-eligible right now.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyBlock {
    Clarification { key: String },
    LoopLimit { loops: u32, max_loops: u32 },
    Budget { reason: String },
}

impl std::fmt::Display for PolicyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clarification { key } => write!(f, "blocking clarification '{}' is open", key),
            Self::LoopLimit { loops, max_loops } => {
                write!(f, "loop limit reached ({}/{})", loops, max_loops)
            }
            Self::Budget { reason } => write!(f, "{}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail,
}

#[derive(Clone)]
pub struct PolicyEvaluator {
    config: OrchestratorConfig,
}

impl PolicyEvaluator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    /// Token pre-check estimate for one step invocation.
    pub fn step_token_estimate(&self, step: &StepSpec) -> u64 {
        step.policies
            .token_budget
            .unwrap_or(self.config.default_step_token_estimate)
    }

    /// First applicable policy block for a step, or `None` when eligible.
    /// `open_blockers` must already be filtered to clarifications applying
    /// to this step's scope chain.
    pub fn step_block(
        &self,
        protocol: &ProtocolRun,
        step: &StepSpec,
        run: &StepRun,
        open_blockers: &[Clarification],
    ) -> Option<PolicyBlock> {
        if let Some(blocker) = open_blockers.first() {
            return Some(PolicyBlock::Clarification {
                key: blocker.key.clone(),
            });
        }

        let loops = run.loop_count.max(protocol.loop_count(step.step_index));
        if loops >= step.policies.max_loops {
            return Some(PolicyBlock::LoopLimit {
                loops,
                max_loops: step.policies.max_loops,
            });
        }

        if protocol.budget.would_exceed(self.step_token_estimate(step)) {
            return Some(PolicyBlock::Budget {
                reason: format!(
                    "token budget exhausted ({} used of {})",
                    protocol.budget.tokens_used,
                    protocol
                        .budget
                        .token_budget
                        .map(|b| b.to_string())
                        .unwrap_or_else(|| "unmetered".to_string())
                ),
            });
        }

        None
    }

    pub fn budget_check(&self, usage: &BudgetUsage) -> BudgetCheckResult {
        let Some(budget) = usage.token_budget else {
            return BudgetCheckResult::Ok;
        };
        if budget == 0 || usage.tokens_used >= budget {
            return BudgetCheckResult::Exceeded {
                reason: format!("{} tokens used of {}", usage.tokens_used, budget),
            };
        }
        let fraction = usage.tokens_used as f64 / budget as f64;
        if fraction >= self.config.budget_warn_fraction {
            BudgetCheckResult::Warning { fraction }
        } else {
            BudgetCheckResult::Ok
        }
    }

    /// Whether an inline dependent trigger at `depth` (zero-based chain
    /// depth) may proceed.
    pub fn inline_allowed(&self, depth: u32) -> bool {
        depth < self.config.max_inline_trigger_depth
    }

    /// Retry policy for a failed agent invocation. Timeouts get one retry;
    /// a repeated timeout is treated as permanent.
    pub fn retry_decision(
        &self,
        class: ErrorClass,
        error_tag: &str,
        run: &StepRun,
        step: &StepSpec,
    ) -> RetryDecision {
        if class == ErrorClass::Permanent {
            return RetryDecision::Fail;
        }
        if error_tag == "timeout" && run.retries >= 1 {
            return RetryDecision::Fail;
        }
        if run.retries < step.policies.retry_max {
            RetryDecision::Retry
        } else {
            RetryDecision::Fail
        }
    }
}
