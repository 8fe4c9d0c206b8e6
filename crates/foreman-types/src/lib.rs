pub mod clarification;
pub mod event;
pub mod protocol;
pub mod qa;
pub mod spec;
pub mod step;

pub use clarification::{Clarification, ClarificationScope, ClarificationStatus};
pub use event::{EventCategory, EventRecord};
pub use protocol::{
    BudgetUsage, EnforcementMode, PolicySnapshot, ProtocolRun, ProtocolSnapshot, ProtocolStatus,
};
pub use qa::{
    Finding, GateResult, GateStatus, PromptVerdict, QaAction, QaOutcome, QaVerdict, Severity,
};
pub use spec::{
    OutputSpec, ProtocolSpec, QaPolicy, QaSpec, StepPolicies, StepSpec, SPEC_SCHEMA_VERSION,
};
pub use step::{ArtifactKind, ArtifactRecord, StepRun, StepStatus};
