pub mod exec;
pub mod worktree;

pub use exec::{GitExecutor, GitOutput, SystemGit};
pub use worktree::{WorktreeConfig, WorktreeCoordinator, WorktreeLease};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {op} failed: {detail}")]
    CommandFailed { op: String, detail: String },

    #[error("repository missing at {0} and auto-clone is disabled")]
    RepoMissing(String),

    #[error("worktree conflict: {0}")]
    WorktreeConflict(String),

    #[error("no worktree lease for protocol {0}")]
    LeaseNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GitError>;
