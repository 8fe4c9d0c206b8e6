use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::ProtocolStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Lifecycle,
    Planning,
    Execution,
    Qa,
    Policy,
    Git,
    Clarification,
}

/// One entry in a protocol's append-only journal. Events for the same
/// protocol are totally ordered by `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub protocol_id: String,
    /// Strictly increasing per protocol
    pub seq: u64,
    pub ts: DateTime<Utc>,
    /// Milliseconds on the journal's monotonic clock; non-decreasing
    pub mono_ms: u64,
    /// Event tag, e.g. `plan_committed`, `step_started`, `qa_verdict`
    pub kind: String,
    pub category: EventCategory,
    /// Protocol status at emission time
    pub status: ProtocolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
}
