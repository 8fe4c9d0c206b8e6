// Feedback Router
// Maps a QA verdict plus step history to exactly one recovery outcome.

use foreman_types::{EnforcementMode, QaAction, QaOutcome, QaVerdict, StepRun, StepSpec};

/// The single outcome of routing one verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackOutcome {
    Complete { with_warnings: bool },
    /// Re-queue the step; consumes one feedback loop
    Retry,
    /// Park the step behind a blocking clarification
    Clarify { key: String, question: String },
    /// Cancel unfinished steps and commit a fresh spec version
    RePlan,
    Fail { reason: String },
}

impl FeedbackOutcome {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Complete { .. } => "complete",
            Self::Retry => "retry",
            Self::Clarify { .. } => "clarify",
            Self::RePlan => "re_plan",
            Self::Fail { .. } => "fail",
        }
    }
}

pub struct FeedbackRouter;

impl FeedbackRouter {
    pub fn route(
        verdict: &QaVerdict,
        step: &StepSpec,
        run: &StepRun,
        enforcement: EnforcementMode,
    ) -> FeedbackOutcome {
        let loops_left = run.loop_count < step.policies.max_loops;
        let action = verdict.prompt_verdict.as_ref().and_then(|p| p.action);
        let rationale = || {
            verdict
                .prompt_verdict
                .as_ref()
                .map(|p| p.rationale.clone())
                .unwrap_or_else(|| "qa gates failed".to_string())
        };

        match verdict.overall {
            QaOutcome::Pass | QaOutcome::Skipped => FeedbackOutcome::Complete {
                with_warnings: false,
            },
            QaOutcome::Warn => match enforcement {
                EnforcementMode::Off | EnforcementMode::Warn => FeedbackOutcome::Complete {
                    with_warnings: true,
                },
                EnforcementMode::Block => {
                    if !loops_left {
                        return FeedbackOutcome::Fail {
                            reason: format!("warnings under block enforcement: {}", rationale()),
                        };
                    }
                    if action == Some(QaAction::Clarify) {
                        FeedbackOutcome::Clarify {
                            key: format!("qa-step-{}", step.step_index),
                            question: rationale(),
                        }
                    } else {
                        FeedbackOutcome::Retry
                    }
                }
            },
            QaOutcome::Fail => {
                if action == Some(QaAction::RePlan) && loops_left {
                    return FeedbackOutcome::RePlan;
                }
                if action == Some(QaAction::Clarify) && loops_left {
                    return FeedbackOutcome::Clarify {
                        key: format!("qa-step-{}", step.step_index),
                        question: rationale(),
                    };
                }
                if loops_left {
                    FeedbackOutcome::Retry
                } else {
                    FeedbackOutcome::Fail {
                        reason: rationale(),
                    }
                }
            }
        }
    }
}
