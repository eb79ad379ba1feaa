//! In-memory [`GitBackend`] for tests.
//!
//! Remotes are keyed by URL and hold a linear history per branch; working
//! copies are keyed by path. Clones also create `<path>/.git` on disk so
//! filesystem checks behave as they would against real git. Every call is
//! appended to an operation log that tests use as a spy.
//!
//! Clones of a `FakeGit` share state, so a test can keep one handle while the
//! code under test owns another.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use pullwatch_core::CommitRef;

use crate::error::GitError;
use crate::git::{CloneOptions, GitBackend};

type History = Vec<CommitRef>;

#[derive(Debug, Default)]
struct Remote {
    /// First branch added is the default branch.
    default_branch: Option<String>,
    branches: BTreeMap<String, History>,
}

#[derive(Debug)]
struct WorkingCopy {
    url: String,
    branches: BTreeMap<String, History>,
    current: String,
    upstreams: HashMap<String, String>,
}

impl WorkingCopy {
    fn head(&self) -> Option<&History> {
        self.branches.get(&self.current)
    }
}

#[derive(Debug, Default)]
struct State {
    remotes: HashMap<String, Remote>,
    copies: HashMap<PathBuf, WorkingCopy>,
    unreachable: HashSet<String>,
    failing_pulls: HashSet<PathBuf>,
    operations: Vec<String>,
}

/// Scriptable stand-in for git.
#[derive(Debug, Clone, Default)]
pub struct FakeGit {
    state: Arc<Mutex<State>>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- scripting ---------------------------------------------------------

    /// Create (or replace) `branch` on the remote at `url` with `commits`.
    pub fn add_remote_branch(&self, url: &str, branch: &str, commits: &[&str]) {
        let mut state = self.lock();
        let remote = state.remotes.entry(url.to_string()).or_default();
        if remote.default_branch.is_none() {
            remote.default_branch = Some(branch.to_string());
        }
        remote.branches.insert(
            branch.to_string(),
            commits.iter().map(|c| CommitRef::from(*c)).collect(),
        );
    }

    /// Advance `branch` on the remote by one commit.
    pub fn push(&self, url: &str, branch: &str, commit: &str) {
        let mut state = self.lock();
        let remote = state.remotes.entry(url.to_string()).or_default();
        if remote.default_branch.is_none() {
            remote.default_branch = Some(branch.to_string());
        }
        remote
            .branches
            .entry(branch.to_string())
            .or_default()
            .push(CommitRef::from(commit));
    }

    /// Make every network operation against `url` fail (or succeed again).
    pub fn set_unreachable(&self, url: &str, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(url.to_string());
        } else {
            state.unreachable.remove(url);
        }
    }

    /// Make `pull` fail in the working copy at `path`.
    pub fn fail_pulls_at(&self, path: &Path) {
        self.lock().failing_pulls.insert(path.to_path_buf());
    }

    /// Add a commit to the checked-out branch that the remote does not have.
    pub fn commit_locally(&self, path: &Path, commit: &str) {
        let mut state = self.lock();
        if let Some(copy) = state.copies.get_mut(path) {
            let current = copy.current.clone();
            copy.branches
                .entry(current)
                .or_default()
                .push(CommitRef::from(commit));
        }
    }

    // -- inspection --------------------------------------------------------

    pub fn local_head(&self, path: &Path) -> Option<CommitRef> {
        let state = self.lock();
        state
            .copies
            .get(path)
            .and_then(|copy| copy.head())
            .and_then(|history| history.last().cloned())
    }

    pub fn local_branches(&self, path: &Path) -> Vec<String> {
        let state = self.lock();
        state
            .copies
            .get(path)
            .map(|copy| copy.branches.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn current_branch(&self, path: &Path) -> Option<String> {
        self.lock().copies.get(path).map(|copy| copy.current.clone())
    }

    /// Every call made so far, as git-like command lines.
    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    /// Number of recorded operations starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.lock()
            .operations
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    fn record(&self, op: String) -> MutexGuard<'_, State> {
        let mut state = self.lock();
        state.operations.push(op);
        state
    }
}

fn not_a_repo(command: &str, repo: &Path) -> GitError {
    GitError::failed(
        command,
        format!("fatal: not a git repository: {}", repo.display()),
    )
}

fn unreachable(command: &str, url: &str) -> GitError {
    GitError::failed(
        command,
        format!("fatal: unable to access '{url}': Could not resolve host"),
    )
}

fn parse_ancestor(reference: &str) -> Option<usize> {
    if reference == "HEAD" {
        return Some(0);
    }
    let rest = reference.strip_prefix("HEAD~")?;
    if rest.is_empty() {
        return Some(1);
    }
    rest.parse().ok()
}

fn dir_is_nonempty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

impl GitBackend for FakeGit {
    fn clone_repo(&self, url: &str, path: &Path, options: &CloneOptions) -> Result<(), GitError> {
        let command = match (&options.depth, &options.branch) {
            (Some(depth), Some(branch)) => format!("clone --depth {depth} {branch} {url}"),
            (Some(depth), None) => format!("clone --depth {depth} {url}"),
            (None, Some(branch)) => format!("clone --branch {branch} {url}"),
            (None, None) => format!("clone {url}"),
        };
        let mut state = self.record(command.clone());

        if dir_is_nonempty(path) {
            return Err(GitError::failed(
                &command,
                format!(
                    "fatal: destination path '{}' already exists and is not an empty directory",
                    path.display()
                ),
            ));
        }
        // git leaves the (empty) destination behind when a clone fails.
        std::fs::create_dir_all(path).map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;

        if state.unreachable.contains(url) {
            return Err(unreachable(&command, url));
        }
        let remote = state
            .remotes
            .get(url)
            .ok_or_else(|| GitError::failed(&command, "fatal: repository not found"))?;

        let branch = match (&options.branch, &remote.default_branch) {
            (Some(branch), _) => branch.clone(),
            (None, Some(default)) => default.clone(),
            (None, None) => {
                return Err(GitError::failed(&command, "warning: empty repository"));
            }
        };
        let mut history = remote.branches.get(&branch).cloned().ok_or_else(|| {
            GitError::failed(
                &command,
                format!("fatal: Remote branch {branch} not found in upstream origin"),
            )
        })?;
        if let Some(depth) = options.depth {
            let keep = (depth as usize).min(history.len());
            history = history.split_off(history.len() - keep);
        }

        std::fs::create_dir_all(path.join(".git")).map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;

        let mut upstreams = HashMap::new();
        upstreams.insert(branch.clone(), format!("origin/{branch}"));
        state.copies.insert(
            path.to_path_buf(),
            WorkingCopy {
                url: url.to_string(),
                branches: BTreeMap::from([(branch.clone(), history)]),
                current: branch,
                upstreams,
            },
        );
        Ok(())
    }

    fn list_local_branches(&self, repo: &Path) -> Result<Vec<String>, GitError> {
        let state = self.record("branch".to_string());
        state
            .copies
            .get(repo)
            .map(|copy| copy.branches.keys().cloned().collect())
            .ok_or_else(|| not_a_repo("branch", repo))
    }

    fn checkout(
        &self,
        repo: &Path,
        reference: &str,
        new_branch: Option<&str>,
    ) -> Result<(), GitError> {
        let command = match new_branch {
            Some(branch) => format!("checkout -b {branch} {reference}"),
            None => format!("checkout {reference}"),
        };
        let mut state = self.record(command.clone());
        let State {
            remotes, copies, ..
        } = &mut *state;
        let copy = copies
            .get_mut(repo)
            .ok_or_else(|| not_a_repo(&command, repo))?;

        if let Some(branch) = new_branch {
            if copy.branches.contains_key(branch) {
                return Err(GitError::failed(
                    &command,
                    format!("fatal: a branch named '{branch}' already exists"),
                ));
            }
            let start = match reference {
                "HEAD" => copy.head().cloned(),
                other => copy.branches.get(other).cloned(),
            };
            let start = start.ok_or_else(|| {
                GitError::failed(&command, format!("fatal: invalid reference: {reference}"))
            })?;
            copy.branches.insert(branch.to_string(), start);
            copy.current = branch.to_string();
            return Ok(());
        }

        if copy.branches.contains_key(reference) {
            copy.current = reference.to_string();
            return Ok(());
        }

        // `git checkout <name>` creates a tracking branch when origin has one.
        let remote_history = remotes
            .get(&copy.url)
            .and_then(|remote| remote.branches.get(reference))
            .cloned()
            .ok_or_else(|| {
                GitError::failed(
                    &command,
                    format!("error: pathspec '{reference}' did not match any file(s) known to git"),
                )
            })?;
        copy.branches.insert(reference.to_string(), remote_history);
        copy.upstreams
            .insert(reference.to_string(), format!("origin/{reference}"));
        copy.current = reference.to_string();
        Ok(())
    }

    fn set_upstream(&self, repo: &Path, branch: &str, upstream: &str) -> Result<(), GitError> {
        let command = format!("branch --set-upstream-to={upstream} {branch}");
        let mut state = self.record(command.clone());
        let State {
            remotes, copies, ..
        } = &mut *state;
        let copy = copies
            .get_mut(repo)
            .ok_or_else(|| not_a_repo(&command, repo))?;
        if !copy.branches.contains_key(branch) {
            return Err(GitError::failed(
                &command,
                format!("fatal: branch '{branch}' does not exist"),
            ));
        }
        let remote_branch = upstream.strip_prefix("origin/").unwrap_or(upstream);
        let known = remotes
            .get(&copy.url)
            .map(|remote| remote.branches.contains_key(remote_branch))
            .unwrap_or(false);
        if !known {
            return Err(GitError::failed(
                &command,
                format!("fatal: the requested upstream branch '{upstream}' does not exist"),
            ));
        }
        copy.upstreams
            .insert(branch.to_string(), upstream.to_string());
        Ok(())
    }

    fn reset_hard(&self, repo: &Path, reference: &str) -> Result<(), GitError> {
        let command = format!("reset --hard {reference}");
        let mut state = self.record(command.clone());
        let copy = state
            .copies
            .get_mut(repo)
            .ok_or_else(|| not_a_repo(&command, repo))?;
        let back = parse_ancestor(reference).ok_or_else(|| {
            GitError::failed(&command, format!("fatal: ambiguous argument '{reference}'"))
        })?;
        let current = copy.current.clone();
        let history = copy.branches.entry(current).or_default();
        if back >= history.len() {
            return Err(GitError::failed(
                &command,
                format!("fatal: ambiguous argument '{reference}': unknown revision"),
            ));
        }
        history.truncate(history.len() - back);
        Ok(())
    }

    fn pull(&self, repo: &Path) -> Result<String, GitError> {
        let command = "pull --ff-only";
        let mut state = self.record(command.to_string());
        if state.failing_pulls.contains(repo) {
            return Err(GitError::failed(
                command,
                "fatal: Not possible to fast-forward, aborting.",
            ));
        }
        let State {
            remotes,
            copies,
            unreachable: offline,
            ..
        } = &mut *state;
        let copy = copies
            .get_mut(repo)
            .ok_or_else(|| not_a_repo(command, repo))?;
        if offline.contains(&copy.url) {
            return Err(unreachable(command, &copy.url));
        }
        let upstream = copy.upstreams.get(&copy.current).cloned().ok_or_else(|| {
            GitError::failed(
                command,
                "There is no tracking information for the current branch.",
            )
        })?;
        let remote_branch = upstream.strip_prefix("origin/").unwrap_or(&upstream);
        let remote_history = remotes
            .get(&copy.url)
            .and_then(|remote| remote.branches.get(remote_branch))
            .cloned()
            .ok_or_else(|| {
                GitError::failed(
                    command,
                    format!("fatal: couldn't find remote ref {remote_branch}"),
                )
            })?;

        let current = copy.current.clone();
        let local = copy.branches.entry(current).or_default();
        if local.len() > remote_history.len() || remote_history[..local.len()] != local[..] {
            return Err(GitError::failed(
                command,
                "fatal: Not possible to fast-forward, aborting.",
            ));
        }
        let summary = if local.len() == remote_history.len() {
            "Already up to date.".to_string()
        } else {
            format!("Fast-forward to {}", remote_history[remote_history.len() - 1])
        };
        *local = remote_history;
        Ok(summary)
    }

    fn head_commit(&self, repo: &Path) -> Result<CommitRef, GitError> {
        let command = "rev-parse HEAD";
        let state = self.record(command.to_string());
        let copy = state
            .copies
            .get(repo)
            .ok_or_else(|| not_a_repo(command, repo))?;
        copy.head()
            .and_then(|history| history.last().cloned())
            .ok_or_else(|| {
                GitError::failed(command, "fatal: ambiguous argument 'HEAD': unknown revision")
            })
    }
}
