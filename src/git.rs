use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, IndexAddOption, Repository, Signature, WorktreePruneOptions};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Thin synchronous wrapper over the git2 operations conductor needs.
///
/// Every method reopens the repository; callers run these on the blocking
/// pool and serialize structural changes themselves.
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "GitOps::new");
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Short name of the checked-out branch, or an abbreviated commit id
    /// when HEAD is detached.
    pub fn current_head(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        let commit = head.peel_to_commit()?;
        Ok(format!("{:.7}", commit.id()))
    }

    /// Create `branch` at the tip of `base` and check it out in a new
    /// worktree at `worktree_path`.
    pub fn create_worktree(&self, branch: &str, base: &str, worktree_path: &Path) -> Result<()> {
        debug!(
            branch,
            base,
            path = %worktree_path.display(),
            "GitOps::create_worktree"
        );
        let repo = self.repo()?;
        let commit = match repo.find_branch(base, BranchType::Local) {
            Ok(b) => b.get().peel_to_commit()?,
            Err(e) if e.code() == ErrorCode::NotFound => repo.revparse_single(base)?.peel_to_commit()?,
            Err(e) => return Err(e.into()),
        };
        let branch_ref = repo.branch(branch, &commit, false)?.into_reference();

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is a valid worktree name.
        let name = worktree_name(worktree_path)?;
        if let Err(e) = repo.worktree(&name, worktree_path, Some(&opts)) {
            // Leave no dangling branch behind a failed checkout.
            if let Ok(mut b) = repo.find_branch(branch, BranchType::Local) {
                let _ = b.delete();
            }
            return Err(e.into());
        }
        debug!(commit = %commit.id(), "worktree created");
        Ok(())
    }

    /// Remove a worktree's directory and its administrative entry.
    ///
    /// The admin directory under `.git/worktrees` must go too, or git keeps
    /// considering the branch checked out and refuses to delete it.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        debug!(path = %worktree_path.display(), "GitOps::remove_worktree");
        let repo = self.repo()?;
        let name = worktree_name(worktree_path)?;

        if let Ok(worktree) = repo.find_worktree(&name) {
            let _ = worktree.unlock();
            if let Err(e) = worktree.prune(Some(
                WorktreePruneOptions::new()
                    .valid(true)
                    .working_tree(true)
                    .locked(true),
            )) {
                warn!(worktree = %name, error = %e, "worktree prune failed");
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        let admin_dir = repo.path().join("worktrees").join(&name);
        if admin_dir.exists() {
            debug!(dir = %admin_dir.display(), "removing worktree admin dir");
            std::fs::remove_dir_all(&admin_dir)?;
        }
        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        Ok(repo
            .worktrees()?
            .iter()
            .flatten()
            .map(String::from)
            .collect())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let found = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        found
    }

    /// Delete a local branch. A missing branch is not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "GitOps::delete_branch");
        let repo = self.repo()?;
        let deleted = match repo.find_branch(branch, BranchType::Local) {
            Ok(mut b) => b.delete().map_err(Error::from),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };
        deleted
    }

    /// Whether the worktree has staged or unstaged changes (untracked included).
    pub fn is_dirty(&self, worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Stage everything in the worktree and commit it on its branch.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<String> {
        debug!(path = %worktree_path.display(), "GitOps::commit_all");
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("conductor", "conductor@localhost"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(commit = %id, "committed workspace changes");
        Ok(id.to_string())
    }
}

fn worktree_name(worktree_path: &Path) -> Result<String> {
    worktree_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Workspace(format!(
                "worktree path has no folder name: {}",
                worktree_path.display()
            ))
        })
}
