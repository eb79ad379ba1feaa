//! Convergence of one category's working copy.
//!
//! ## Per-category state machine (one tick)
//!
//! ```text
//! Absent ──clone──▶ Present ──checkout──▶ OnTargetBranch ─┬─▶ Unchanged
//!                                                         └─▶ Converging ─┬─▶ Converged
//!                                                                          └─▶ ConvergenceFailed
//! ```
//!
//! Nothing is persisted between ticks. Every step checks the target branch
//! out again before acting, so [`RepoSync::converge`] can be re-run from
//! whatever partial state an interrupted run left behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use pullwatch_core::{CommitRef, SyncOutcome, SyncTarget};

use crate::error::{corrupt, io_err, SyncError};
use crate::git::{CloneOptions, GitBackend};

/// Drives the git primitives for one category at a time.
#[derive(Debug, Clone)]
pub struct RepoSync<G> {
    git: G,
    scratch_root: Option<PathBuf>,
    reset_before_pull: bool,
}

impl<G: GitBackend> RepoSync<G> {
    pub fn new(git: G) -> Self {
        Self {
            git,
            scratch_root: None,
            reset_before_pull: true,
        }
    }

    /// Create scratch clones under `root` instead of the system temp directory.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// Toggle the `reset --hard HEAD~1` step that precedes the pull.
    pub fn with_reset_before_pull(mut self, enabled: bool) -> Self {
        self.reset_before_pull = enabled;
        self
    }

    pub fn git(&self) -> &G {
        &self.git
    }

    /// Clone the remote unless the local directory already holds a checkout.
    ///
    /// Returns `true` when a clone happened. Calling it again on a present
    /// copy is a no-op.
    pub fn ensure_present(&self, target: &SyncTarget) -> Result<bool, SyncError> {
        if has_vcs_metadata(&target.local_path)? {
            return Ok(false);
        }
        if dir_has_entries(&target.local_path)? {
            return Err(SyncError::OccupiedDirectory {
                path: target.local_path.clone(),
            });
        }

        tracing::info!(
            category = %target.category,
            url = %target.remote_url,
            path = %target.local_path.display(),
            "cloning repository",
        );
        self.git
            .clone_repo(
                &target.remote_url,
                &target.local_path,
                &CloneOptions::default(),
            )
            .map_err(|source| SyncError::RemoteUnreachable {
                url: target.remote_url.clone(),
                source,
            })?;
        Ok(true)
    }

    /// Check out the target branch and return its tip.
    pub fn latest_local_commit(&self, target: &SyncTarget) -> Result<CommitRef, SyncError> {
        let repo = target.local_path.as_path();
        self.git
            .checkout(repo, &target.remote_branch, None)
            .map_err(|e| corrupt(repo, e))?;
        self.git.head_commit(repo).map_err(|e| corrupt(repo, e))
    }

    /// Tip of the remote branch, read from a throwaway depth-1 clone.
    ///
    /// `None` means "could not determine" (network, auth, missing branch, no
    /// scratch space); it never means "no new commit". The scratch directory
    /// is removed before returning on every path.
    pub fn latest_remote_commit(&self, target: &SyncTarget) -> Option<CommitRef> {
        let prefix = format!("pullwatch-{}-", target.category);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let scratch = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        let scratch = match scratch {
            Ok(dir) => dir,
            Err(err) => {
                tracing::warn!(
                    category = %target.category,
                    error = %err,
                    "cannot create scratch directory for remote lookup",
                );
                return None;
            }
        };

        let head = self
            .git
            .clone_repo(
                &target.remote_url,
                scratch.path(),
                &CloneOptions::shallow(&target.remote_branch),
            )
            .and_then(|()| self.git.head_commit(scratch.path()));

        let scratch_path = scratch.path().to_path_buf();
        if let Err(err) = scratch.close() {
            tracing::warn!(
                path = %scratch_path.display(),
                error = %err,
                "failed to remove scratch clone",
            );
        }

        match head {
            Ok(commit) => Some(commit),
            Err(err) => {
                tracing::warn!(
                    category = %target.category,
                    branch = %target.remote_branch,
                    error = %err,
                    "remote head lookup failed",
                );
                None
            }
        }
    }

    /// Destructive sync: bring the local branch to the remote tip.
    ///
    /// Only called after divergence was confirmed. Checkout and upstream
    /// failures are [`SyncError::CorruptLocalRepo`]; a failed pull is reported
    /// as [`SyncOutcome::ConvergenceFailed`].
    pub fn converge(&self, target: &SyncTarget) -> Result<SyncOutcome, SyncError> {
        let repo = target.local_path.as_path();
        let branch = target.remote_branch.as_str();

        let branches = self
            .git
            .list_local_branches(repo)
            .map_err(|e| corrupt(repo, e))?;
        if !branches.iter().any(|b| b == branch) {
            tracing::info!(category = %target.category, branch, "creating local branch from HEAD");
            self.git
                .checkout(repo, "HEAD", Some(branch))
                .map_err(|e| corrupt(repo, e))?;
        }

        self.git
            .checkout(repo, branch, None)
            .map_err(|e| corrupt(repo, e))?;
        self.git
            .set_upstream(repo, branch, &target.upstream())
            .map_err(|e| corrupt(repo, e))?;

        if self.reset_before_pull {
            // Drops one local commit so the pull below cannot hit a merge.
            if let Err(err) = self.git.reset_hard(repo, "HEAD~1") {
                tracing::warn!(
                    category = %target.category,
                    error = %err,
                    "reset to HEAD~1 failed; pulling anyway",
                );
            }
        }

        tracing::info!(category = %target.category, branch, "pulling updates");
        match self.git.pull(repo) {
            Ok(summary) => {
                let summary = summary.trim();
                if !summary.is_empty() {
                    tracing::info!(category = %target.category, "{summary}");
                }
            }
            Err(err) => {
                tracing::error!(category = %target.category, error = %err, "pull failed");
                return Ok(SyncOutcome::ConvergenceFailed {
                    reason: err.to_string(),
                });
            }
        }

        let head = self.git.head_commit(repo).map_err(|e| corrupt(repo, e))?;
        Ok(SyncOutcome::Converged { head })
    }
}

/// `true` when `dir` has at least one hidden directory entry (`<dir>/.*`).
///
/// A missing directory counts as "no checkout".
pub fn has_vcs_metadata(dir: &Path) -> Result<bool, SyncError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(io_err(dir, err)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden && entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn dir_has_entries(dir: &Path) -> Result<bool, SyncError> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(dir, err)),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pullwatch_core::Category;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::fake::FakeGit;

    const URL: &str = "https://example/repo.git";

    fn target(dir: &Path, category: &str, branch: &str) -> SyncTarget {
        SyncTarget {
            category: Category::from(category),
            local_path: dir.join(category),
            remote_branch: branch.to_string(),
            remote_url: URL.to_string(),
        }
    }

    fn setup(branch: &str, commits: &[&str]) -> (TempDir, TempDir, FakeGit) {
        let work = TempDir::new().expect("work");
        let scratch = TempDir::new().expect("scratch");
        let git = FakeGit::new();
        git.add_remote_branch(URL, branch, commits);
        (work, scratch, git)
    }

    fn scratch_entries(root: &Path) -> usize {
        fs::read_dir(root).expect("read scratch root").count()
    }

    #[test]
    fn has_vcs_metadata_only_counts_hidden_directories() {
        let dir = TempDir::new().expect("dir");
        assert!(!has_vcs_metadata(&dir.path().join("missing")).expect("missing"));
        assert!(!has_vcs_metadata(dir.path()).expect("empty"));

        fs::write(dir.path().join(".env"), "x").expect("hidden file");
        fs::write(dir.path().join("README"), "x").expect("file");
        assert!(!has_vcs_metadata(dir.path()).expect("files only"));

        fs::create_dir(dir.path().join(".git")).expect(".git");
        assert!(has_vcs_metadata(dir.path()).expect("git dir"));
    }

    #[test]
    fn ensure_present_is_idempotent() {
        let (work, _scratch, git) = setup("develop", &["h0", "h1"]);
        let sync = RepoSync::new(git.clone());
        let t = target(work.path(), "dev", "develop");

        assert!(sync.ensure_present(&t).expect("first"));
        assert!(!sync.ensure_present(&t).expect("second"));
        assert_eq!(git.count("clone "), 1, "second call must not clone");
    }

    #[test]
    fn ensure_present_reports_unreachable_remote() {
        let (work, _scratch, git) = setup("develop", &["h0"]);
        git.set_unreachable(URL, true);
        let sync = RepoSync::new(git.clone());

        let err = sync
            .ensure_present(&target(work.path(), "dev", "develop"))
            .unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnreachable { .. }), "got: {err}");
    }

    #[test]
    fn ensure_present_refuses_occupied_directory_without_cloning() {
        let (work, _scratch, git) = setup("develop", &["h0"]);
        let t = target(work.path(), "dev", "develop");
        fs::create_dir_all(&t.local_path).expect("dir");
        fs::write(t.local_path.join("stray.txt"), "x").expect("stray file");
        let sync = RepoSync::new(git.clone());

        let err = sync.ensure_present(&t).unwrap_err();
        assert!(matches!(err, SyncError::OccupiedDirectory { .. }), "got: {err}");
        assert!(!err.to_string().contains("unreachable"), "got: {err}");
        assert_eq!(git.count("clone"), 0);
    }

    #[test]
    fn latest_local_commit_checks_out_target_branch() {
        let (work, _scratch, git) = setup("develop", &["h0", "h1"]);
        let sync = RepoSync::new(git.clone());
        let t = target(work.path(), "dev", "develop");
        sync.ensure_present(&t).expect("clone");

        assert_eq!(sync.latest_local_commit(&t).expect("head"), CommitRef::from("h1"));
        assert_eq!(git.current_branch(&t.local_path).as_deref(), Some("develop"));
    }

    #[test]
    fn latest_local_commit_on_missing_copy_is_corrupt() {
        let (work, _scratch, git) = setup("develop", &["h0"]);
        let sync = RepoSync::new(git);
        let err = sync
            .latest_local_commit(&target(work.path(), "dev", "develop"))
            .unwrap_err();
        assert!(matches!(err, SyncError::CorruptLocalRepo { .. }), "got: {err}");
    }

    #[rstest]
    #[case::reachable("develop", false, Some("h1"))]
    #[case::unreachable("develop", true, None)]
    #[case::unknown_branch("no-such-branch", false, None)]
    fn remote_lookup_always_removes_scratch(
        #[case] branch: &str,
        #[case] unreachable: bool,
        #[case] expected: Option<&str>,
    ) {
        let (work, scratch, git) = setup("develop", &["h0", "h1"]);
        git.set_unreachable(URL, unreachable);
        let sync = RepoSync::new(git.clone()).with_scratch_root(scratch.path());

        let head = sync.latest_remote_commit(&target(work.path(), "dev", branch));
        assert_eq!(head, expected.map(CommitRef::from));
        assert_eq!(scratch_entries(scratch.path()), 0, "scratch clone left behind");
        assert_eq!(git.count("clone --depth 1"), 1);
    }

    #[test]
    fn converge_fast_forwards_to_remote_head() {
        let (work, scratch, git) = setup("develop", &["h0", "h1"]);
        let sync = RepoSync::new(git.clone()).with_scratch_root(scratch.path());
        let t = target(work.path(), "dev", "develop");
        sync.ensure_present(&t).expect("clone");
        sync.latest_local_commit(&t).expect("checkout");

        git.push(URL, "develop", "h2");
        let outcome = sync.converge(&t).expect("converge");
        assert_eq!(
            outcome,
            SyncOutcome::Converged {
                head: CommitRef::from("h2")
            }
        );
        assert_eq!(git.local_head(&t.local_path), Some(CommitRef::from("h2")));
    }

    #[test]
    fn converge_bootstraps_missing_branch_from_head() {
        let work = TempDir::new().expect("work");
        let git = FakeGit::new();
        git.add_remote_branch(URL, "main", &["h0", "h1"]);
        git.add_remote_branch(URL, "develop", &["h0", "h1", "h2"]);
        let sync = RepoSync::new(git.clone());
        let t = target(work.path(), "dev", "develop");
        sync.ensure_present(&t).expect("clone");
        assert_eq!(git.local_branches(&t.local_path), ["main"]);

        let outcome = sync.converge(&t).expect("converge");
        assert!(matches!(outcome, SyncOutcome::Converged { .. }), "got {outcome:?}");

        let ops = git.operations();
        let create = ops
            .iter()
            .position(|op| op.starts_with("checkout -b develop HEAD"))
            .expect("branch created from HEAD");
        let switch = ops
            .iter()
            .rposition(|op| op.starts_with("checkout develop"))
            .expect("branch checked out");
        assert!(create < switch, "branch must exist before it is checked out: {ops:?}");

        assert_eq!(sync.latest_local_commit(&t).expect("local head"), CommitRef::from("h2"));
    }

    #[test]
    fn failed_reset_does_not_abort_convergence() {
        let (work, _scratch, git) = setup("develop", &["h0"]);
        let sync = RepoSync::new(git.clone());
        let t = target(work.path(), "dev", "develop");
        sync.ensure_present(&t).expect("clone");

        git.push(URL, "develop", "h1");
        let outcome = sync.converge(&t).expect("converge");
        assert_eq!(git.count("reset --hard HEAD~1"), 1);
        assert_eq!(
            outcome,
            SyncOutcome::Converged {
                head: CommitRef::from("h1")
            },
            "single-commit history cannot be reset but the pull still runs"
        );
    }

    #[test]
    fn failed_pull_is_convergence_failed() {
        let (work, _scratch, git) = setup("develop", &["h0", "h1"]);
        let sync = RepoSync::new(git.clone());
        let t = target(work.path(), "dev", "develop");
        sync.ensure_present(&t).expect("clone");
        git.fail_pulls_at(&t.local_path);

        let outcome = sync.converge(&t).expect("converge");
        assert!(outcome.is_failure(), "got {outcome:?}");
    }

    #[test]
    fn reset_policy_can_be_disabled() {
        let (work, _scratch, git) = setup("develop", &["h0", "h1"]);
        let sync = RepoSync::new(git.clone()).with_reset_before_pull(false);
        let t = target(work.path(), "dev", "develop");
        sync.ensure_present(&t).expect("clone");
        git.push(URL, "develop", "h2");

        sync.converge(&t).expect("converge");
        assert_eq!(git.count("reset"), 0);
        assert_eq!(git.local_head(&t.local_path), Some(CommitRef::from("h2")));
    }

    #[test]
    fn converge_discards_one_divergent_local_commit() {
        let (work, _scratch, git) = setup("develop", &["h0", "h1"]);
        let sync = RepoSync::new(git.clone());
        let t = target(work.path(), "dev", "develop");
        sync.ensure_present(&t).expect("clone");

        git.commit_locally(&t.local_path, "local-only");
        git.push(URL, "develop", "h2");

        let outcome = sync.converge(&t).expect("converge");
        assert_eq!(
            outcome,
            SyncOutcome::Converged {
                head: CommitRef::from("h2")
            }
        );
    }
}
