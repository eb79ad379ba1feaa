//! [`GitBackend`] backed by the `git` executable.
//!
//! Every invocation is bounded by a timeout; a process still running at the
//! deadline is killed and reported as [`GitError::TimedOut`]. Interactive
//! credential prompts are disabled so an auth failure surfaces as an error
//! instead of a hang.

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use pullwatch_core::config::DEFAULT_GIT_TIMEOUT;
use pullwatch_core::CommitRef;

use crate::error::GitError;
use crate::git::{CloneOptions, GitBackend};

const WAIT_POLL: Duration = Duration::from_millis(20);

/// Minimum wait for pipe output once the process has exited, even when the
/// deadline has already passed.
const PIPE_GRACE: Duration = Duration::from_millis(100);

/// Shells out to `git`.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
    timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(DEFAULT_GIT_TIMEOUT)
    }
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: PathBuf::from("git"),
            timeout,
        }
    }

    /// Use a specific git executable instead of the one on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `git --version`, or `None` when no usable executable is found.
    pub fn version(&self) -> Option<String> {
        self.run(None, ["--version"]).ok().map(|v| v.trim().to_string())
    }

    fn run<I, S>(&self, cwd: Option<&Path>, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let command = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        tracing::debug!(command = %command, cwd = ?cwd, "running git");
        let mut child = cmd.spawn().map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;

        // Drain both pipes on their own threads so a chatty process cannot
        // block on a full pipe while we poll for exit.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = match wait_with_deadline(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(GitError::TimedOut {
                    command,
                    timeout: self.timeout,
                });
            }
            Err(source) => return Err(GitError::Spawn { command, source }),
        };

        // A grandchild (ssh ControlPersist, credential helper) may keep the
        // pipes open after git exits; never wait past the deadline for EOF.
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(PIPE_GRACE);
        let Ok(stdout) = stdout.recv_timeout(remaining) else {
            return Err(GitError::TimedOut {
                command,
                timeout: self.timeout,
            });
        };
        let stderr = stderr.recv_timeout(PIPE_GRACE).unwrap_or_default();
        if !status.success() {
            return Err(GitError::Failed {
                command,
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

/// Read `pipe` to EOF on a helper thread; the text arrives on the receiver.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

/// `Ok(None)` when the deadline passed with the child still running.
fn wait_with_deadline(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL);
    }
}

impl GitBackend for GitCli {
    fn clone_repo(&self, url: &str, path: &Path, options: &CloneOptions) -> Result<(), GitError> {
        let mut args: Vec<OsString> = vec!["clone".into(), "--quiet".into()];
        if let Some(depth) = options.depth {
            args.push("--depth".into());
            args.push(depth.to_string().into());
        }
        if let Some(branch) = &options.branch {
            args.push("--branch".into());
            args.push(branch.into());
        }
        args.push("--".into());
        args.push(url.into());
        args.push(path.as_os_str().to_owned());
        self.run(None, args).map(|_| ())
    }

    fn list_local_branches(&self, repo: &Path) -> Result<Vec<String>, GitError> {
        let out = self.run(Some(repo), ["branch", "--format=%(refname:short)"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn checkout(
        &self,
        repo: &Path,
        reference: &str,
        new_branch: Option<&str>,
    ) -> Result<(), GitError> {
        match new_branch {
            Some(branch) => self.run(Some(repo), ["checkout", "--quiet", "-b", branch, reference]),
            None => self.run(Some(repo), ["checkout", "--quiet", reference]),
        }
        .map(|_| ())
    }

    fn set_upstream(&self, repo: &Path, branch: &str, upstream: &str) -> Result<(), GitError> {
        let flag = format!("--set-upstream-to={upstream}");
        self.run(Some(repo), ["branch", flag.as_str(), branch])
            .map(|_| ())
    }

    fn reset_hard(&self, repo: &Path, reference: &str) -> Result<(), GitError> {
        self.run(Some(repo), ["reset", "--hard", "--quiet", reference])
            .map(|_| ())
    }

    fn pull(&self, repo: &Path) -> Result<String, GitError> {
        self.run(Some(repo), ["pull", "--ff-only"])
    }

    fn head_commit(&self, repo: &Path) -> Result<CommitRef, GitError> {
        let out = self.run(Some(repo), ["rev-parse", "HEAD"])?;
        Ok(CommitRef::from(out.trim()))
    }
}
