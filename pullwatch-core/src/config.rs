//! INI configuration document.
//!
//! # Layout
//!
//! ```text
//! [branches]            category = remote branch (file order = tick order)
//! dev = develop
//! master = master
//!
//! [directories]         category = local working copy
//! dev = /srv/app-dev
//! master = /srv/app
//!
//! [git]
//! url = https://example/repo.git
//!
//! [agent]               optional
//! interval = 30
//! git_timeout = 300
//! reset_before_pull = true
//! dry_run = false
//! ```
//!
//! The document is read once at startup and turned into an immutable
//! [`AgentConfig`]. Categories are the keys of `[branches]`, which must
//! include `dev` and `master`. Every category needs exactly one branch and
//! one directory; a key present in only one of the two sections, or
//! repeated within one, is rejected.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::{Ini, Properties};

use crate::error::ConfigError;
use crate::types::{Category, SyncTarget};

/// File looked up in the current directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "pullwatch.ini";

/// Upper bound on a single git subprocess unless `[agent] git_timeout` says otherwise.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Categories every document must track.
pub const REQUIRED_CATEGORIES: [&str; 2] = ["dev", "master"];

const SECTION_BRANCHES: &str = "branches";
const SECTION_DIRECTORIES: &str = "directories";
const SECTION_GIT: &str = "git";
const SECTION_AGENT: &str = "agent";

/// Optional knobs from the `[agent]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    /// Poll interval; `None` lets the caller pick its own default.
    pub interval: Option<Duration>,
    pub git_timeout: Duration,
    /// Hard-reset to `HEAD~1` before pulling during convergence.
    pub reset_before_pull: bool,
    /// Detect and report divergence without converging.
    pub dry_run: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            interval: None,
            git_timeout: DEFAULT_GIT_TIMEOUT,
            reset_before_pull: true,
            dry_run: false,
        }
    }
}

/// Validated configuration, passed by value or reference into every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Where the document was read from (diagnostics only).
    pub source: PathBuf,
    pub remote_url: String,
    /// One target per category, in `[branches]` order.
    pub targets: Vec<SyncTarget>,
    pub settings: AgentSettings,
}

impl AgentConfig {
    pub fn target(&self, category: &Category) -> Option<&SyncTarget> {
        self.targets.iter().find(|t| &t.category == category)
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.targets.iter().map(|t| &t.category)
    }
}

/// `./pullwatch.ini`
pub fn default_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

/// Read and validate the document at `path`.
pub fn load_at(path: &Path) -> Result<AgentConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(err) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: err,
            })
        }
    };
    parse_str(&contents, path)
}

/// `load_at` convenience wrapper for [`default_path`].
pub fn load() -> Result<AgentConfig, ConfigError> {
    load_at(&default_path())
}

/// Validate an in-memory document. `origin` only appears in diagnostics.
pub fn parse_str(contents: &str, origin: &Path) -> Result<AgentConfig, ConfigError> {
    let ini = Ini::load_from_str(contents).map_err(|source| ConfigError::Parse {
        path: origin.to_path_buf(),
        source,
    })?;

    let branches = required_section(&ini, SECTION_BRANCHES, origin)?;
    let directories = required_section(&ini, SECTION_DIRECTORIES, origin)?;
    let git = required_section(&ini, SECTION_GIT, origin)?;

    let remote_url = git
        .get("url")
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ConfigError::MissingRemoteUrl {
            path: origin.to_path_buf(),
        })?
        .to_string();

    reject_duplicates(branches, SECTION_BRANCHES, origin)?;
    reject_duplicates(directories, SECTION_DIRECTORIES, origin)?;

    let mut targets = Vec::new();
    for (category, branch) in branches.iter() {
        let branch = branch.trim();
        if branch.is_empty() {
            return Err(ConfigError::EmptyBranch {
                category: category.to_string(),
                path: origin.to_path_buf(),
            });
        }
        let directory = directories
            .get(category)
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .ok_or_else(|| ConfigError::MissingDirectory {
                category: category.to_string(),
                path: origin.to_path_buf(),
            })?;
        targets.push(SyncTarget {
            category: Category::from(category),
            local_path: PathBuf::from(directory),
            remote_branch: branch.to_string(),
            remote_url: remote_url.clone(),
        });
    }

    let missing_branch = |category: &str| ConfigError::MissingBranch {
        category: category.to_string(),
        path: origin.to_path_buf(),
    };
    for (category, _) in directories.iter() {
        if branches.get(category).is_none() {
            return Err(missing_branch(category));
        }
    }
    for category in REQUIRED_CATEGORIES {
        if branches.get(category).is_none() {
            return Err(missing_branch(category));
        }
    }

    let settings = match ini.section(Some(SECTION_AGENT)) {
        Some(agent) => parse_settings(agent, origin)?,
        None => AgentSettings::default(),
    };

    Ok(AgentConfig {
        source: origin.to_path_buf(),
        remote_url,
        targets,
        settings,
    })
}

fn required_section<'a>(
    ini: &'a Ini,
    section: &'static str,
    origin: &Path,
) -> Result<&'a Properties, ConfigError> {
    ini.section(Some(section))
        .ok_or_else(|| ConfigError::MissingSection {
            section,
            path: origin.to_path_buf(),
        })
}

fn reject_duplicates(
    section: &Properties,
    name: &'static str,
    origin: &Path,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for (category, _) in section.iter() {
        if !seen.insert(category) {
            return Err(ConfigError::DuplicateCategory {
                category: category.to_string(),
                section: name,
                path: origin.to_path_buf(),
            });
        }
    }
    Ok(())
}

fn parse_settings(agent: &Properties, origin: &Path) -> Result<AgentSettings, ConfigError> {
    let mut settings = AgentSettings::default();
    if let Some(raw) = agent.get("interval") {
        settings.interval = Some(parse_seconds("interval", raw, origin)?);
    }
    if let Some(raw) = agent.get("git_timeout") {
        settings.git_timeout = parse_seconds("git_timeout", raw, origin)?;
    }
    if let Some(raw) = agent.get("reset_before_pull") {
        settings.reset_before_pull = parse_bool("reset_before_pull", raw, origin)?;
    }
    if let Some(raw) = agent.get("dry_run") {
        settings.dry_run = parse_bool("dry_run", raw, origin)?;
    }
    Ok(settings)
}

fn parse_seconds(key: &'static str, raw: &str, origin: &Path) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: reason.to_string(),
        path: origin.to_path_buf(),
    };
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| invalid("expected a number of seconds"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(invalid("must be a positive number of seconds"));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| invalid("out of range"))
}

fn parse_bool(key: &'static str, raw: &str, origin: &Path) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected true/false".to_string(),
            path: origin.to_path_buf(),
        }),
    }
}
