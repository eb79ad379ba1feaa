//! pullwatch core library: domain types, configuration loading, errors.
//!
//! - [`types`]: newtypes and the per-category sync target
//! - [`config`]: INI configuration document → [`AgentConfig`]
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{AgentConfig, AgentSettings};
pub use error::ConfigError;
pub use types::{Category, CommitRef, SyncOutcome, SyncTarget};
