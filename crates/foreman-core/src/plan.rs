// Plan Store
// Spec document parsing, structural validation, canonical hashing, and
// step-run materialization.

use crate::config::OrchestratorConfig;
use crate::error::{ForemanError, Result};
use crate::ids::IdProvider;
use crate::store::sha256_hex;
use foreman_types::{
    EnforcementMode, PolicySnapshot, ProtocolSpec, StepRun, StepSpec, SPEC_SCHEMA_VERSION,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Structural spec violations, reported with enough context to fix the
/// document.
#[derive(Debug, Clone, PartialEq)]
pub enum SpecValidationError {
    EmptySpec,
    UnsupportedVersion(u32),
    DuplicateIndex(u32),
    NonContiguousIndex { expected: u32, found: u32 },
    MissingField { step_index: u32, field: &'static str },
    UnknownDependency { step_index: u32, dependency: u32 },
    SelfDependency(u32),
    CycleDetected { path: Vec<u32> },
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptySpec => write!(f, "spec has no steps"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported spec version {}", v),
            Self::DuplicateIndex(i) => write!(f, "duplicate step_index {}", i),
            Self::NonContiguousIndex { expected, found } => {
                write!(
                    f,
                    "step indices must be contiguous from 0: expected {}, found {}",
                    expected, found
                )
            }
            Self::MissingField { step_index, field } => {
                write!(f, "step {} is missing required field '{}'", step_index, field)
            }
            Self::UnknownDependency {
                step_index,
                dependency,
            } => write!(
                f,
                "step {} depends on unknown step {}",
                step_index, dependency
            ),
            Self::SelfDependency(i) => write!(f, "step {} depends on itself", i),
            Self::CycleDetected { path } => write!(
                f,
                "dependency cycle: {}",
                path.iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            ),
        }
    }
}

/// Parse a spec document from JSON, falling back to YAML.
pub fn parse_spec_document(document: &str) -> Result<ProtocolSpec> {
    if let Ok(spec) = serde_json::from_str::<ProtocolSpec>(document) {
        return Ok(spec);
    }
    serde_yaml::from_str(document)
        .map_err(|e| ForemanError::Parse(format!("spec document is neither JSON nor YAML: {}", e)))
}

/// Validate the structural invariants of a spec.
pub fn validate(spec: &ProtocolSpec) -> std::result::Result<(), SpecValidationError> {
    if spec.version != SPEC_SCHEMA_VERSION {
        return Err(SpecValidationError::UnsupportedVersion(spec.version));
    }
    if spec.steps.is_empty() {
        return Err(SpecValidationError::EmptySpec);
    }

    let mut seen = HashSet::new();
    for step in &spec.steps {
        if !seen.insert(step.step_index) {
            return Err(SpecValidationError::DuplicateIndex(step.step_index));
        }
    }
    let mut indices: Vec<u32> = seen.iter().copied().collect();
    indices.sort_unstable();
    for (position, index) in indices.iter().enumerate() {
        if *index != position as u32 {
            return Err(SpecValidationError::NonContiguousIndex {
                expected: position as u32,
                found: *index,
            });
        }
    }

    for step in &spec.steps {
        for (field, value) in [
            ("prompt_ref", &step.prompt_ref),
            ("engine_id", &step.engine_id),
            ("model", &step.model),
        ] {
            if value.trim().is_empty() {
                return Err(SpecValidationError::MissingField {
                    step_index: step.step_index,
                    field,
                });
            }
        }
        for dep in &step.depends_on {
            if *dep == step.step_index {
                return Err(SpecValidationError::SelfDependency(step.step_index));
            }
            if !seen.contains(dep) {
                return Err(SpecValidationError::UnknownDependency {
                    step_index: step.step_index,
                    dependency: *dep,
                });
            }
        }
    }

    if let Some(path) = detect_cycle(&spec.steps) {
        return Err(SpecValidationError::CycleDetected { path });
    }

    Ok(())
}

fn detect_cycle(steps: &[StepSpec]) -> Option<Vec<u32>> {
    let by_index: HashMap<u32, &StepSpec> = steps.iter().map(|s| (s.step_index, s)).collect();

    for step in steps {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if dfs_cycle(step.step_index, &by_index, &mut visited, &mut path) {
            return Some(path);
        }
    }
    None
}

fn dfs_cycle(
    index: u32,
    by_index: &HashMap<u32, &StepSpec>,
    visited: &mut HashSet<u32>,
    path: &mut Vec<u32>,
) -> bool {
    if path.contains(&index) {
        path.push(index);
        return true;
    }
    if visited.contains(&index) {
        return false;
    }
    visited.insert(index);
    path.push(index);

    if let Some(step) = by_index.get(&index) {
        for dep in &step.depends_on {
            if dfs_cycle(*dep, by_index, visited, path) {
                return true;
            }
        }
    }
    path.pop();
    false
}

/// Content hash over the canonical form: JSON with recursively sorted object
/// keys, so key order in the source document does not change the identity.
pub fn spec_hash(spec: &ProtocolSpec) -> Result<String> {
    let value = serde_json::to_value(spec)?;
    Ok(sha256_hex(canonical_json(&value).as_bytes()))
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

/// Create fresh pending step runs for every step in the spec.
pub fn materialize_step_runs(
    protocol_id: &str,
    spec: &ProtocolSpec,
    ids: &IdProvider,
) -> Vec<StepRun> {
    spec.steps
        .iter()
        .map(|step| StepRun::new(ids.new_id(), protocol_id.to_string(), step.step_index))
        .collect()
}

/// Freeze the effective policy at planning time.
pub fn freeze_policy(
    config: &OrchestratorConfig,
    enforcement: Option<EnforcementMode>,
) -> Result<PolicySnapshot> {
    let enforcement = enforcement.unwrap_or(config.default_enforcement_mode);
    let token_budget = config.default_token_budget;
    let serialized = serde_json::to_string(&(enforcement, token_budget))?;
    Ok(PolicySnapshot {
        policy_hash: sha256_hex(serialized.as_bytes()),
        enforcement,
        token_budget,
        frozen_at: chrono::Utc::now(),
    })
}
