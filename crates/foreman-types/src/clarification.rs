use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationScope {
    Project,
    Protocol,
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationStatus {
    Open,
    Answered,
}

/// An externally-answered question. While a blocking clarification is open,
/// steps inside its scope are not runnable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clarification {
    pub id: String,
    pub scope: ClarificationScope,
    /// Project id, protocol id, or `<protocol_id>/<step_index>` per scope
    pub scope_id: String,
    /// Unique within its scope
    pub key: String,
    pub blocking: bool,
    pub status: ClarificationStatus,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
}

impl Clarification {
    pub fn is_open_blocker(&self) -> bool {
        self.blocking && self.status == ClarificationStatus::Open
    }
}
