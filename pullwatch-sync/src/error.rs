//! Error types for pullwatch-sync.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single version-control primitive.
#[derive(Debug, Error)]
pub enum GitError {
    /// The git process could not be started or waited on.
    #[error("failed to run `git {command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// git ran and exited unsuccessfully.
    #[error("`git {command}` failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    /// git did not finish within the configured bound and was killed.
    #[error("`git {command}` timed out after {}s", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },
}

impl GitError {
    pub fn failed(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        GitError::Failed {
            command: command.into(),
            status: "exit status: 1".to_string(),
            stderr: stderr.into(),
        }
    }
}

/// Per-category failures. None of these are fatal to the agent; the delivery
/// loop logs them and retries on the next tick.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Clone (or another network operation) against the remote failed.
    #[error("remote {url} unreachable: {source}")]
    RemoteUnreachable {
        url: String,
        #[source]
        source: GitError,
    },

    /// Checkout, branch listing or head lookup failed on an existing copy.
    #[error("local repository at {path} is unusable: {source}")]
    CorruptLocalRepo {
        path: PathBuf,
        #[source]
        source: GitError,
    },

    /// The working-copy directory has files but no repository metadata.
    #[error("{path} is not empty and holds no repository; refusing to clone into it")]
    OccupiedDirectory { path: PathBuf },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn corrupt(path: impl Into<PathBuf>, source: GitError) -> SyncError {
    SyncError::CorruptLocalRepo {
        path: path.into(),
        source,
    }
}
