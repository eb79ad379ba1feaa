//! # pullwatch-sync
//!
//! Repository convergence for one tracked category at a time.
//!
//! [`RepoSync`] owns the decision logic (clone-if-absent, local/remote head
//! lookup, the reset-then-pull sequence) and talks to git only through the
//! [`GitBackend`] trait. [`GitCli`] is the production backend.

pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod git;
pub mod git_cli;
pub mod repo_sync;

pub use error::{GitError, SyncError};
pub use git::{CloneOptions, GitBackend};
pub use git_cli::GitCli;
pub use repo_sync::{has_vcs_metadata, RepoSync};
