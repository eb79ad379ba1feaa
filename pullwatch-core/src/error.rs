//! Error types for pullwatch-core.

use std::path::PathBuf;

use thiserror::Error;

/// Startup-time configuration failures. All of them are fatal: the agent
/// never enters its polling loop with an invalid document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration document does not exist.
    #[error("configuration file not found at {path}")]
    NotFound { path: PathBuf },

    /// Underlying I/O failure other than "not found".
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid INI.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ini::ParseError,
    },

    /// One of `branches`, `directories`, `git` is absent.
    #[error("no `{section}` section in {path}")]
    MissingSection {
        section: &'static str,
        path: PathBuf,
    },

    /// A required category, or one listed under `[directories]`, has no branch.
    #[error("category `{category}` has no entry in `branches` section of {path}")]
    MissingBranch { category: String, path: PathBuf },

    /// The same category key appears twice in one section.
    #[error("category `{category}` appears more than once in `{section}` section of {path}")]
    DuplicateCategory {
        category: String,
        section: &'static str,
        path: PathBuf,
    },

    /// A category has a branch but no (or an empty) directory.
    #[error("category `{category}` has no entry in `directories` section of {path}")]
    MissingDirectory { category: String, path: PathBuf },

    /// A category maps to an empty branch name.
    #[error("category `{category}` has an empty branch name in {path}")]
    EmptyBranch { category: String, path: PathBuf },

    /// `[git] url` is absent or empty.
    #[error("no remote `url` in `git` section of {path}")]
    MissingRemoteUrl { path: PathBuf },

    /// An `[agent]` value could not be interpreted.
    #[error("invalid value `{value}` for `agent.{key}` in {path}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
        path: PathBuf,
    },
}
