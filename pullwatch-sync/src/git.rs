//! The narrow version-control interface the sync engine consumes.

use std::path::Path;

use pullwatch_core::CommitRef;

use crate::error::GitError;

/// Options for [`GitBackend::clone_repo`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneOptions {
    /// Branch to check out instead of the remote's default.
    pub branch: Option<String>,
    /// History depth; `Some(1)` for a single-commit shallow clone.
    pub depth: Option<u32>,
}

impl CloneOptions {
    /// Depth-1 clone of `branch` only.
    pub fn shallow(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            depth: Some(1),
        }
    }
}

/// Version-control primitives. Every repository argument is the working-copy
/// root (the directory containing `.git`).
pub trait GitBackend: Send + Sync {
    fn clone_repo(&self, url: &str, path: &Path, options: &CloneOptions) -> Result<(), GitError>;

    fn list_local_branches(&self, repo: &Path) -> Result<Vec<String>, GitError>;

    /// Check out `reference`; with `new_branch`, create that branch at
    /// `reference` first (`git checkout -b <new_branch> <reference>`).
    fn checkout(
        &self,
        repo: &Path,
        reference: &str,
        new_branch: Option<&str>,
    ) -> Result<(), GitError>;

    fn set_upstream(&self, repo: &Path, branch: &str, upstream: &str) -> Result<(), GitError>;

    fn reset_hard(&self, repo: &Path, reference: &str) -> Result<(), GitError>;

    /// Pull the checked-out branch from its upstream. Returns git's summary.
    fn pull(&self, repo: &Path) -> Result<String, GitError>;

    fn head_commit(&self, repo: &Path) -> Result<CommitRef, GitError>;
}
