//! Domain types shared by the sync engine and the delivery loop.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Name of an independently tracked branch/directory pairing (`dev`, `master`, …).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Category(pub String);

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque commit identifier (full hex object id).
///
/// Two values are equal iff they name the same commit. Nothing else about the
/// string is interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRef(pub String);

impl CommitRef {
    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(10)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CommitRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitRef {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// Everything needed to converge one category.
///
/// `local_path` and `remote_branch` are never empty; [`crate::config`]
/// rejects such documents before a target is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub category: Category,
    pub local_path: PathBuf,
    pub remote_branch: String,
    pub remote_url: String,
}

impl SyncTarget {
    /// Upstream the local branch tracks, `origin/<remote_branch>`.
    pub fn upstream(&self) -> String {
        format!("origin/{}", self.remote_branch)
    }
}

/// Result of one convergence attempt for a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Local and remote already named the same commit.
    Unchanged,
    /// The pull succeeded; `head` is the local tip afterwards.
    Converged { head: CommitRef },
    /// Reset or pull failed; the working copy may be partially advanced.
    ConvergenceFailed { reason: String },
}

impl SyncOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SyncOutcome::ConvergenceFailed { .. })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
