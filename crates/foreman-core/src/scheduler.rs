// Runnable-Step Selector
// Dependency- and policy-aware selection over the step DAG, with
// parallel-group batching.

use foreman_types::{ProtocolSpec, StepRun, StepSpec, StepStatus};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Outcome of one selection pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Earliest eligible batch: one singleton, or every member of a
    /// parallel group whose dependencies are satisfied.
    Batch(Vec<u32>),
    /// Pending work exists but every candidate is gated by a clarification
    /// or a policy precondition.
    Blocked { reasons: Vec<(u32, String)> },
    /// Pending steps can never run because a dependency failed or was
    /// cancelled.
    Deadlock { steps: Vec<u32> },
    /// No pending steps remain.
    Done,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StepProgress {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub blocked: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

pub struct StepScheduler;

impl StepScheduler {
    /// Select the next concurrent batch.
    ///
    /// `policy_block` returns a human-readable reason when a step is not
    /// policy-eligible (open blocking clarification, loop limit, budget).
    pub fn select<F>(spec: &ProtocolSpec, steps: &[StepRun], policy_block: F) -> Selection
    where
        F: Fn(&StepSpec, &StepRun) -> Option<String>,
    {
        let specs: HashMap<u32, &StepSpec> =
            spec.steps.iter().map(|s| (s.step_index, s)).collect();

        let satisfied: HashSet<u32> = steps
            .iter()
            .filter(|s| s.status.is_satisfied())
            .map(|s| s.step_index)
            .collect();
        let doomed: HashSet<u32> = steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Cancelled))
            .map(|s| s.step_index)
            .collect();

        // Blocked steps stay candidates: the gate that parked them may have
        // cleared since.
        let candidates: Vec<&StepRun> = steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::Blocked))
            .collect();

        if candidates.is_empty() {
            return if steps.iter().all(|s| s.status.is_satisfied()) {
                Selection::Done
            } else {
                Selection::Deadlock {
                    steps: doomed.iter().copied().collect(),
                }
            };
        }

        let mut eligible: Vec<&StepSpec> = Vec::new();
        let mut blocked_reasons: Vec<(u32, String)> = Vec::new();
        let mut deadlocked: Vec<u32> = Vec::new();

        for run in &candidates {
            let Some(step) = specs.get(&run.step_index) else {
                continue;
            };
            if step.depends_on.iter().any(|dep| doomed.contains(dep)) {
                deadlocked.push(step.step_index);
                continue;
            }
            if !step.depends_on.iter().all(|dep| satisfied.contains(dep)) {
                continue;
            }
            match policy_block(step, run) {
                Some(reason) => blocked_reasons.push((step.step_index, reason)),
                None => eligible.push(step),
            }
        }

        if !eligible.is_empty() {
            // Group by parallel tag; a step without a tag forms its own
            // singleton group keyed by its index.
            let mut groups: BTreeMap<(u32, Option<String>), Vec<u32>> = BTreeMap::new();
            let mut group_min: HashMap<Option<String>, u32> = HashMap::new();
            for step in &eligible {
                if let Some(tag) = &step.parallel_group {
                    let min = group_min
                        .entry(Some(tag.clone()))
                        .or_insert(step.step_index);
                    *min = (*min).min(step.step_index);
                }
            }
            for step in &eligible {
                let key = match &step.parallel_group {
                    Some(tag) => (group_min[&Some(tag.clone())], Some(tag.clone())),
                    None => (step.step_index, None),
                };
                groups.entry(key).or_default().push(step.step_index);
            }

            let (_, mut batch) = groups.into_iter().next().expect("eligible set is non-empty");
            batch.sort_unstable();
            return Selection::Batch(batch);
        }

        if !blocked_reasons.is_empty() {
            blocked_reasons.sort_by_key(|(index, _)| *index);
            return Selection::Blocked {
                reasons: blocked_reasons,
            };
        }

        // Nothing eligible, nothing policy-blocked: remaining candidates
        // wait on failed dependencies.
        deadlocked.sort_unstable();
        Selection::Deadlock { steps: deadlocked }
    }

    pub fn all_satisfied(steps: &[StepRun]) -> bool {
        steps.iter().all(|s| s.status.is_satisfied())
    }

    pub fn progress(steps: &[StepRun]) -> StepProgress {
        let mut progress = StepProgress {
            total: steps.len(),
            ..StepProgress::default()
        };
        for step in steps {
            match step.status {
                StepStatus::Pending => progress.pending += 1,
                StepStatus::Reserved | StepStatus::Running | StepStatus::NeedsQa => {
                    progress.in_flight += 1
                }
                StepStatus::Blocked => progress.blocked += 1,
                StepStatus::Completed => progress.completed += 1,
                StepStatus::Failed => progress.failed += 1,
                StepStatus::Cancelled => progress.cancelled += 1,
                StepStatus::Skipped => progress.skipped += 1,
            }
        }
        progress
    }
}
