//! Per-task isolated workspaces backed by git worktrees.
//!
//! Each task gets its own branch `conductor/<task>` created from the
//! integration branch and checked out in its own worktree directory.
//! Creation and teardown mutate shared repository metadata, so they run one
//! at a time behind a lock; agents working inside distinct worktrees are
//! unaffected by that lock.
//!
//! A process that dies mid-task leaves its worktree and branch behind.
//! [`Workspaces::reclaim`] clears those before the task runs again.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::TaskId;
use crate::git::GitOps;
use crate::util::git_op;
use crate::{Error, Result};

const BRANCH_PREFIX: &str = "conductor";

/// An isolated working copy bound to a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: String,
}

/// How the work inside a workspace ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
    Cancelled,
}

impl ReleaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseOutcome::Success => "success",
            ReleaseOutcome::Failure => "failure",
            ReleaseOutcome::Cancelled => "cancelled",
        }
    }
}

/// Source of isolated workspaces.
#[async_trait]
pub trait Workspaces: Send + Sync {
    /// Create a fresh workspace for `task_id`.
    ///
    /// Fails with [`Error::WorkspaceConflict`] if one already exists.
    async fn acquire(&self, task_id: &TaskId) -> Result<Workspace>;

    /// Reclaim the workspace for `task_id`.
    async fn release(&self, task_id: &TaskId, outcome: ReleaseOutcome) -> Result<()>;

    /// Remove whatever an earlier process left behind for `task_ids`.
    /// Live workspaces are untouched. Returns the ids that had leftovers.
    async fn reclaim(&self, _task_ids: &[TaskId]) -> Result<Vec<TaskId>> {
        Ok(Vec::new())
    }
}

pub fn branch_for(task_id: &TaskId) -> String {
    format!("{}/{}", BRANCH_PREFIX, task_id.slug())
}

/// Git worktree implementation of [`Workspaces`].
pub struct WorkspaceManager {
    git: Arc<GitOps>,
    root: PathBuf,
    integration_branch: String,
    preserve_failed: bool,
    /// Live workspaces; the lock also serializes git structural changes.
    active: Mutex<HashMap<TaskId, Workspace>>,
}

impl WorkspaceManager {
    /// `integration_branch` defaults to the repository's current branch.
    pub fn new(
        repo_path: &Path,
        root: PathBuf,
        integration_branch: Option<String>,
    ) -> Result<Self> {
        let git = GitOps::new(repo_path)?;
        let integration_branch = match integration_branch {
            Some(branch) => branch,
            None => git.current_head()?,
        };
        let existing = git.list_worktrees()?;
        if !existing.is_empty() {
            debug!(worktrees = ?existing, "repository already has linked worktrees");
        }
        info!(
            repo = %git.repo_path().display(),
            root = %root.display(),
            integration_branch = %integration_branch,
            "workspace manager ready"
        );
        Ok(Self {
            git: Arc::new(git),
            root,
            integration_branch,
            preserve_failed: false,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Keep worktree and branch of failed or cancelled tasks for inspection.
    pub fn preserve_failed(mut self, preserve: bool) -> Self {
        self.preserve_failed = preserve;
        self
    }

    pub fn integration_branch(&self) -> &str {
        &self.integration_branch
    }

    pub fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(task_id.slug())
    }

    pub async fn active(&self) -> Vec<Workspace> {
        self.active.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl Workspaces for WorkspaceManager {
    async fn acquire(&self, task_id: &TaskId) -> Result<Workspace> {
        let mut active = self.active.lock().await;
        let path = self.path_for(task_id);
        let branch = branch_for(task_id);

        if active.contains_key(task_id) || path.exists() {
            return Err(Error::WorkspaceConflict(task_id.to_string()));
        }

        let git = Arc::clone(&self.git);
        let (b, base, p) = (branch.clone(), self.integration_branch.clone(), path.clone());
        git_op(move || {
            if git.branch_exists(&b)? {
                return Err(Error::WorkspaceConflict(format!("branch {} already exists", b)));
            }
            git.create_worktree(&b, &base, &p)
        })
        .await?;

        let workspace = Workspace {
            task_id: task_id.clone(),
            path,
            branch,
        };
        debug!(task_id = %task_id, path = %workspace.path.display(), "workspace acquired");
        active.insert(task_id.clone(), workspace.clone());
        Ok(workspace)
    }

    async fn release(&self, task_id: &TaskId, outcome: ReleaseOutcome) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(workspace) = active.remove(task_id) else {
            return Err(Error::Workspace(format!("no workspace for task {}", task_id)));
        };

        if outcome != ReleaseOutcome::Success && self.preserve_failed {
            info!(
                task_id = %task_id,
                path = %workspace.path.display(),
                "preserving workspace for postmortem"
            );
            return Ok(());
        }

        let git = Arc::clone(&self.git);
        let ws = workspace.clone();
        git_op(move || {
            if outcome == ReleaseOutcome::Success && ws.path.exists() && git.is_dirty(&ws.path)? {
                // Uncommitted agent output would vanish with the working copy.
                git.commit_all(&ws.path, &format!("conductor: {}", ws.task_id))?;
            }
            git.remove_worktree(&ws.path)?;
            if outcome != ReleaseOutcome::Success {
                git.delete_branch(&ws.branch)?;
            }
            Ok(())
        })
        .await
        .inspect_err(|e| warn!(task_id = %task_id, error = %e, "workspace release failed"))?;

        debug!(task_id = %task_id, outcome = outcome.as_str(), "workspace released");
        Ok(())
    }

    async fn reclaim(&self, task_ids: &[TaskId]) -> Result<Vec<TaskId>> {
        let active = self.active.lock().await;
        let candidates: Vec<Workspace> = task_ids
            .iter()
            .filter(|id| !active.contains_key(*id))
            .map(|id| Workspace {
                task_id: id.clone(),
                path: self.path_for(id),
                branch: branch_for(id),
            })
            .collect();

        let git = Arc::clone(&self.git);
        let reclaimed = git_op(move || {
            let registered = git.list_worktrees()?;
            let mut reclaimed = Vec::new();
            for ws in candidates {
                let name = ws.path.file_name().and_then(|n| n.to_str());
                let listed = registered.iter().any(|r| Some(r.as_str()) == name);
                if !(listed || ws.path.exists() || git.branch_exists(&ws.branch)?) {
                    continue;
                }
                git.remove_worktree(&ws.path)?;
                git.delete_branch(&ws.branch)?;
                reclaimed.push(ws.task_id);
            }
            Ok(reclaimed)
        })
        .await?;

        for task_id in &reclaimed {
            warn!(task_id = %task_id, "reclaimed workspace left by an earlier run");
        }
        Ok(reclaimed)
    }
}
