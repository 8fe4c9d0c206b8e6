use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

use crate::exec::GitExecutor;
use crate::{GitError, Result};

/// How the coordinator locates and prepares repositories.
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Local checkout of the shared repository
    pub repo_root: PathBuf,
    /// Directory under which per-protocol worktrees are created
    pub worktrees_root: PathBuf,
    /// Clone from this URL when the local checkout is missing
    pub remote_url: Option<String>,
    pub auto_clone: bool,
}

/// Exclusive claim on a (branch, worktree path) pair for one protocol.
#[derive(Debug, Clone)]
pub struct WorktreeLease {
    pub protocol_id: String,
    pub branch_name: String,
    pub path: PathBuf,
}

/// Creates, tracks, and releases per-protocol git worktrees.
///
/// Global repository operations (clone, fetch, prune) serialize on a per-repo
/// mutex; operations inside a protocol's own worktree do not.
pub struct WorktreeCoordinator {
    config: WorktreeConfig,
    git: Arc<dyn GitExecutor>,
    repo_lock: Mutex<()>,
    leases: StdMutex<HashMap<String, WorktreeLease>>,
}

impl WorktreeCoordinator {
    pub fn new(config: WorktreeConfig, git: Arc<dyn GitExecutor>) -> Self {
        Self {
            config,
            git,
            repo_lock: Mutex::new(()),
            leases: StdMutex::new(HashMap::new()),
        }
    }

    /// Branch name for a protocol: `NNNN-<short-name>`.
    pub fn branch_name(number: u32, name_hint: &str) -> String {
        format!("{:04}-{}", number, slugify(name_hint))
    }

    pub fn lease_for(&self, protocol_id: &str) -> Option<WorktreeLease> {
        self.leases
            .lock()
            .expect("worktree lease registry poisoned")
            .get(protocol_id)
            .cloned()
    }

    /// Lease lookup that treats a missing registration as an error. The
    /// executor goes through this before touching a worktree, so a released
    /// or never-provisioned protocol cannot run steps.
    pub fn require_lease(&self, protocol_id: &str) -> Result<WorktreeLease> {
        self.lease_for(protocol_id)
            .ok_or_else(|| GitError::LeaseNotFound(protocol_id.to_string()))
    }

    /// Re-register a lease for a worktree that already exists on disk,
    /// e.g. when a protocol is rehydrated after a restart. Enforces the
    /// same branch/path exclusivity as `provision`.
    pub fn adopt(
        &self,
        protocol_id: &str,
        branch_name: &str,
        path: PathBuf,
    ) -> Result<WorktreeLease> {
        self.check_conflicts(protocol_id, branch_name, &path)?;
        let lease = WorktreeLease {
            protocol_id: protocol_id.to_string(),
            branch_name: branch_name.to_string(),
            path,
        };
        self.leases
            .lock()
            .expect("worktree lease registry poisoned")
            .insert(protocol_id.to_string(), lease.clone());
        tracing::info!(protocol_id, branch = %lease.branch_name, "worktree lease adopted");
        Ok(lease)
    }

    /// Create the branch and worktree for a protocol and register the lease.
    ///
    /// Refuses when the local repository is missing (unless auto-clone is on)
    /// and when another live protocol already holds the branch or path.
    pub async fn provision(
        &self,
        protocol_id: &str,
        number: u32,
        name_hint: &str,
        base_branch: &str,
    ) -> Result<WorktreeLease> {
        let branch = Self::branch_name(number, name_hint);
        let path = self.config.worktrees_root.join(protocol_id);

        self.check_conflicts(protocol_id, &branch, &path)?;

        let _repo_guard = self.repo_lock.lock().await;

        self.ensure_repo().await?;

        self.git
            .run_checked(&self.config.repo_root, &["fetch", "origin"])
            .await?;

        let base_ref = format!("origin/{}", base_branch);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_str = path.to_string_lossy().to_string();
        self.git
            .run_checked(
                &self.config.repo_root,
                &["worktree", "add", "-b", &branch, &path_str, &base_ref],
            )
            .await?;

        let lease = WorktreeLease {
            protocol_id: protocol_id.to_string(),
            branch_name: branch,
            path,
        };

        self.leases
            .lock()
            .expect("worktree lease registry poisoned")
            .insert(protocol_id.to_string(), lease.clone());

        tracing::info!(
            protocol_id,
            branch = %lease.branch_name,
            path = %lease.path.display(),
            "worktree provisioned"
        );

        Ok(lease)
    }

    /// Remove the protocol's worktree and prune stale registrations.
    /// Idempotent: releasing a protocol without a lease is a no-op.
    pub async fn release(&self, protocol_id: &str) -> Result<()> {
        let lease = {
            let mut leases = self
                .leases
                .lock()
                .expect("worktree lease registry poisoned");
            leases.remove(protocol_id)
        };

        let Some(lease) = lease else {
            return Ok(());
        };

        let _repo_guard = self.repo_lock.lock().await;

        let path_str = lease.path.to_string_lossy().to_string();
        if let Err(e) = self
            .git
            .run_checked(
                &self.config.repo_root,
                &["worktree", "remove", "--force", &path_str],
            )
            .await
        {
            tracing::warn!(protocol_id, error = %e, "worktree remove failed, pruning anyway");
        }
        self.git
            .run_checked(&self.config.repo_root, &["worktree", "prune"])
            .await?;

        tracing::info!(protocol_id, branch = %lease.branch_name, "worktree released");
        Ok(())
    }

    /// `git status --porcelain` inside a protocol's worktree.
    pub async fn capture_status(&self, worktree: &Path) -> Result<String> {
        let out = self
            .git
            .run_checked(worktree, &["status", "--porcelain"])
            .await?;
        Ok(out.stdout)
    }

    /// Best-effort textual diff of uncommitted changes in a worktree.
    pub async fn capture_diff(&self, worktree: &Path) -> Result<String> {
        match self.git.run(worktree, &["diff"]).await {
            Ok(out) if out.success => Ok(out.stdout),
            Ok(out) => {
                tracing::debug!(stderr = %out.stderr, "diff capture failed");
                Ok(String::new())
            }
            Err(e) => {
                tracing::debug!(error = %e, "diff capture failed");
                Ok(String::new())
            }
        }
    }

    async fn ensure_repo(&self) -> Result<()> {
        if self.config.repo_root.join(".git").exists() {
            return Ok(());
        }

        let remote = match (&self.config.remote_url, self.config.auto_clone) {
            (Some(url), true) => url.clone(),
            _ => {
                return Err(GitError::RepoMissing(
                    self.config.repo_root.display().to_string(),
                ))
            }
        };

        let parent = self
            .config
            .repo_root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&parent).await?;

        let target = self.config.repo_root.to_string_lossy().to_string();
        self.git
            .run_checked(&parent, &["clone", &remote, &target])
            .await?;
        Ok(())
    }

    fn check_conflicts(&self, protocol_id: &str, branch: &str, path: &Path) -> Result<()> {
        let leases = self
            .leases
            .lock()
            .expect("worktree lease registry poisoned");

        if leases.contains_key(protocol_id) {
            return Err(GitError::WorktreeConflict(format!(
                "protocol {} already holds a worktree lease",
                protocol_id
            )));
        }
        for lease in leases.values() {
            if lease.branch_name == branch {
                return Err(GitError::WorktreeConflict(format!(
                    "branch {} is held by protocol {}",
                    branch, lease.protocol_id
                )));
            }
            if lease.path == path {
                return Err(GitError::WorktreeConflict(format!(
                    "worktree path {} is held by protocol {}",
                    path.display(),
                    lease.protocol_id
                )));
            }
        }
        Ok(())
    }
}

/// Lowercase, alphanumeric-and-dash branch fragment from a free-form name.
fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_dash = true;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "protocol".to_string()
    } else {
        slug
    }
}
