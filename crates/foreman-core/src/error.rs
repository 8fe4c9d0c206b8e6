// Foreman Error Types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("transient agent error: {0}")]
    TransientAgent(String),

    #[error("permanent agent error: {0}")]
    PermanentAgent(String),

    #[error("policy block: {0}")]
    PolicyBlock(String),

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("system error: {0}")]
    System(String),
}

impl From<foreman_git::GitError> for ForemanError {
    fn from(err: foreman_git::GitError) -> Self {
        match err {
            foreman_git::GitError::RepoMissing(path) => {
                ForemanError::Validation(format!("repository missing at {}", path))
            }
            foreman_git::GitError::WorktreeConflict(detail) => {
                ForemanError::ConcurrencyConflict(detail)
            }
            other => ForemanError::System(other.to_string()),
        }
    }
}

impl From<foreman_agents::AgentAdapterError> for ForemanError {
    fn from(err: foreman_agents::AgentAdapterError) -> Self {
        match err {
            foreman_agents::AgentAdapterError::EngineNotRegistered(engine) => {
                ForemanError::Validation(format!("engine not registered: {}", engine))
            }
            other => ForemanError::System(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ForemanError>;
