use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the agent runtime and its control protocol.
///
/// Per-category sync failures never show up here; the delivery loop contains
/// them and reports them through tick reports and logs.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{task} task failed: {reason}")]
    TaskFailed { task: &'static str, reason: String },

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("agent is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
