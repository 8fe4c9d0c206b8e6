use serde::{Deserialize, Serialize};

/// Aggregated QA result for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaOutcome {
    Pass,
    Warn,
    Fail,
    Skipped,
}

impl QaOutcome {
    /// Ordering used when aggregating: fail > warn > pass > skipped.
    pub fn severity_rank(self) -> u8 {
        match self {
            QaOutcome::Skipped => 0,
            QaOutcome::Pass => 1,
            QaOutcome::Warn => 2,
            QaOutcome::Fail => 3,
        }
    }

    pub fn worst(self, other: QaOutcome) -> QaOutcome {
        if other.severity_rank() > self.severity_rank() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
    /// Tool unavailable; carries a reason on the gate result
    Skipped,
}

/// Result of one deterministic gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub status: GateStatus,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Recovery route proposed by the QA prompt agent alongside its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaAction {
    Retry,
    RePlan,
    Clarify,
}

/// Structured verdict returned by the QA prompt agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVerdict {
    pub verdict: QaOutcome,
    pub rationale: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<QaAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaVerdict {
    pub overall: QaOutcome,
    #[serde(default)]
    pub gates: Vec<GateResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_verdict: Option<PromptVerdict>,
}

impl QaVerdict {
    pub fn skipped() -> Self {
        Self {
            overall: QaOutcome::Skipped,
            gates: Vec::new(),
            prompt_verdict: None,
        }
    }
}
