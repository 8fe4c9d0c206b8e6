// Orchestrator Configuration
// The environment contract lifted into an explicit struct passed at
// construction. No process-wide mutable state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use foreman_types::EnforcementMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Synthesize a plan through the planning agent when a spec document
    /// arrives with no steps; refuse planning otherwise.
    #[serde(default)]
    pub auto_generate_plan_on_missing: bool,
    /// Upper bound for inline dependent triggering per call chain
    #[serde(default = "default_max_inline_trigger_depth")]
    pub max_inline_trigger_depth: u32,
    /// Baseline when the project policy does not specify
    #[serde(default)]
    pub default_enforcement_mode: EnforcementMode,
    /// Wall-clock limit per agent invocation, seconds
    #[serde(default = "default_agent_wall_time_secs")]
    pub agent_wall_time_secs: u64,
    /// Wall-clock limit per QA gate or QA prompt call, seconds
    #[serde(default = "default_qa_wall_time_secs")]
    pub qa_wall_time_secs: u64,
    /// Worker pool size across all protocols
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: u32,
    /// Grace period before an in-flight step is force-terminated on cancel
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// Fraction of the token budget that triggers a warning log
    #[serde(default = "default_budget_warn_fraction")]
    pub budget_warn_fraction: f64,
    /// Protocol-wide token budget frozen into the policy snapshot; `None`
    /// leaves protocols unmetered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_token_budget: Option<u64>,
    /// Pre-check estimate for steps that do not declare a token budget
    #[serde(default = "default_step_token_estimate")]
    pub default_step_token_estimate: u64,
    /// Directory of prompt templates; when set, `prompt_ref` must resolve to
    /// `<dir>/<ref>.md` and the content hash becomes the prompt version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts_dir: Option<PathBuf>,
    /// Engine used to synthesize plans when auto-generation is on
    #[serde(default = "default_planner_engine")]
    pub planner_engine_id: String,
    #[serde(default = "default_planner_model")]
    pub planner_model: String,
    #[serde(default = "default_planner_prompt_ref")]
    pub planner_prompt_ref: String,
}

fn default_max_inline_trigger_depth() -> u32 {
    2
}

fn default_agent_wall_time_secs() -> u64 {
    // Agent calls can legitimately take a while on large repos and slow
    // models; keep this high enough not to fail healthy runs.
    15 * 60
}

fn default_qa_wall_time_secs() -> u64 {
    5 * 60
}

fn default_max_parallel_steps() -> u32 {
    4
}

fn default_cancel_grace_secs() -> u64 {
    10
}

fn default_budget_warn_fraction() -> f64 {
    0.8
}

fn default_step_token_estimate() -> u64 {
    8_000
}

fn default_planner_engine() -> String {
    "codex".to_string()
}

fn default_planner_model() -> String {
    "default".to_string()
}

fn default_planner_prompt_ref() -> String {
    "planner".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_generate_plan_on_missing: false,
            max_inline_trigger_depth: default_max_inline_trigger_depth(),
            default_enforcement_mode: EnforcementMode::default(),
            agent_wall_time_secs: default_agent_wall_time_secs(),
            qa_wall_time_secs: default_qa_wall_time_secs(),
            max_parallel_steps: default_max_parallel_steps(),
            cancel_grace_secs: default_cancel_grace_secs(),
            budget_warn_fraction: default_budget_warn_fraction(),
            default_token_budget: None,
            default_step_token_estimate: default_step_token_estimate(),
            prompts_dir: None,
            planner_engine_id: default_planner_engine(),
            planner_model: default_planner_model(),
            planner_prompt_ref: default_planner_prompt_ref(),
        }
    }
}

impl OrchestratorConfig {
    pub fn agent_wall_time(&self) -> Duration {
        Duration::from_secs(self.agent_wall_time_secs)
    }

    pub fn qa_wall_time(&self) -> Duration {
        Duration::from_secs(self.qa_wall_time_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_serde() {
        let config: OrchestratorConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.auto_generate_plan_on_missing);
        assert_eq!(config.max_inline_trigger_depth, 2);
        assert_eq!(config.default_enforcement_mode, EnforcementMode::Warn);
        assert_eq!(config.max_parallel_steps, 4);
        assert!(config.default_token_budget.is_none());
    }
}
