use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Schema version this build understands. Unknown versions are refused at
/// planning time rather than partially interpreted.
pub const SPEC_SCHEMA_VERSION: u32 = 1;

/// The immutable plan document. Identified by the SHA-256 of its canonical
/// JSON form; re-planning produces a new document with a new hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    pub version: u32,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// QA depth for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaPolicy {
    /// Bypass the QA stage entirely, deterministic gates included
    Skip,
    /// Deterministic gates only
    Light,
    /// Deterministic gates plus the prompt gate
    #[default]
    Full,
}

/// Per-step policy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPolicies {
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    #[serde(default)]
    pub qa_policy: QaPolicy,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    /// Optional per-step token ceiling, checked in addition to the protocol budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,
}

fn default_max_loops() -> u32 {
    3
}

fn default_retry_max() -> u32 {
    2
}

impl Default for StepPolicies {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
            qa_policy: QaPolicy::default(),
            retry_max: default_retry_max(),
            token_budget: None,
        }
    }
}

/// Where a step's captured outputs land, relative to the worktree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Destination for the agent's primary (stdout) output
    pub primary: String,
    /// Named auxiliary outputs the adapter writes itself
    #[serde(default)]
    pub aux: BTreeMap<String, String>,
}

/// QA configuration for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaSpec {
    pub engine_id: String,
    pub model: String,
    pub prompt_ref: String,
    #[serde(default)]
    pub required_gates: Vec<String>,
}

/// One unit of agent-driven work inside a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Zero-based, contiguous, unique within the spec
    pub step_index: u32,
    pub name: String,
    /// Free-form tag, e.g. `codex`, `review`, `qa-only`
    #[serde(rename = "type", default)]
    pub step_type: String,
    pub engine_id: String,
    pub model: String,
    pub prompt_ref: String,
    /// Logical artifact references this step consumes
    #[serde(default)]
    pub inputs: BTreeSet<String>,
    #[serde(default)]
    pub outputs: OutputSpec,
    /// Step indices that must be completed first; must form a DAG
    #[serde(default)]
    pub depends_on: BTreeSet<u32>,
    /// Steps sharing a tag may run concurrently once dependencies allow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    /// An optional step may be skipped when its QA policy is `skip`
    #[serde(default)]
    pub optional: bool,
    /// On success, run eligible dependents inline without yielding the
    /// scheduler (bounded by the configured trigger depth)
    #[serde(default)]
    pub inline_trigger: bool,
    #[serde(default)]
    pub policies: StepPolicies,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa: Option<QaSpec>,
}

impl StepSpec {
    /// Minimal well-formed step, used by builders and tests.
    pub fn new(step_index: u32, name: impl Into<String>) -> Self {
        Self {
            step_index,
            name: name.into(),
            step_type: "codex".to_string(),
            engine_id: "codex".to_string(),
            model: "default".to_string(),
            prompt_ref: format!("step-{}", step_index),
            inputs: BTreeSet::new(),
            outputs: OutputSpec {
                primary: format!("steps/{}.out.md", step_index),
                aux: BTreeMap::new(),
            },
            depends_on: BTreeSet::new(),
            parallel_group: None,
            optional: false,
            inline_trigger: false,
            policies: StepPolicies::default(),
            qa: None,
        }
    }
}
