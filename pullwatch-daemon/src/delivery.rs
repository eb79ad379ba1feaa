//! The delivery loop: one pass over every tracked category per tick.
//!
//! Per category, in configuration order:
//! 1. ensure the working copy exists (clone if absent)
//! 2. read the local and remote tips
//! 3. equal tips → nothing to do; unknown remote → skip this tick
//! 4. otherwise announce the new commit and converge
//!
//! A failure in one category is logged and recorded in that category's
//! report; the pass always continues with the next category.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use pullwatch_core::{AgentConfig, Category, CommitRef, SyncOutcome, SyncTarget};
use pullwatch_sync::{GitBackend, RepoSync};

use crate::error::DaemonError;
use crate::ticker::{TickCause, Ticker};

/// Interval used when neither the caller nor the configuration picks one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Reports and events
// ---------------------------------------------------------------------------

/// What happened to one category during one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CategoryStatus {
    /// Local tip equals remote tip.
    Unchanged { head: CommitRef },
    /// The remote tip could not be read; nothing was done.
    RemoteUnknown { local: CommitRef },
    /// Tips differ but the loop runs in dry-run mode.
    Diverged { local: CommitRef, remote: CommitRef },
    Converged { from: CommitRef, to: CommitRef },
    ConvergenceFailed { reason: String },
    /// Clone, checkout or another pre-convergence step failed.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryReport {
    pub category: Category,
    /// A clone happened during this tick.
    pub cloned: bool,
    #[serde(flatten)]
    pub status: CategoryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub cause: TickCause,
    pub finished_at_unix: u64,
    pub duration_ms: u64,
    pub categories: Vec<CategoryReport>,
}

impl TickReport {
    pub fn status_of(&self, category: &str) -> Option<&CategoryStatus> {
        self.categories
            .iter()
            .find(|r| r.category.0 == category)
            .map(|r| &r.status)
    }

    pub fn failures(&self) -> usize {
        self.categories
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    CategoryStatus::Failed { .. } | CategoryStatus::ConvergenceFailed { .. }
                )
            })
            .count()
    }
}

/// Notifications emitted while a tick runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeliveryEvent {
    NewCommit {
        category: Category,
        local: CommitRef,
        remote: CommitRef,
    },
    Converged {
        category: Category,
        head: CommitRef,
    },
    ConvergenceFailed {
        category: Category,
        reason: String,
    },
}

impl fmt::Display for DeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryEvent::NewCommit { category, .. } => write!(f, "new commit on {category}"),
            DeliveryEvent::Converged { category, head } => {
                write!(f, "{category} converged to {}", head.short())
            }
            DeliveryEvent::ConvergenceFailed { category, reason } => {
                write!(f, "{category} failed to converge: {reason}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOptions {
    pub interval: Duration,
    /// Report divergence without converging.
    pub dry_run: bool,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            dry_run: false,
        }
    }
}

pub struct DeliveryLoop<G> {
    sync: RepoSync<G>,
    targets: Vec<SyncTarget>,
    options: LoopOptions,
    events: broadcast::Sender<DeliveryEvent>,
    reports: watch::Sender<Option<TickReport>>,
    ticks: AtomicU64,
}

impl<G: GitBackend> DeliveryLoop<G> {
    /// Loop over every target in `config`; interval and dry-run come from its
    /// `[agent]` section when present.
    pub fn new(config: &AgentConfig, sync: RepoSync<G>) -> Self {
        let options = LoopOptions {
            interval: config.settings.interval.unwrap_or(DEFAULT_INTERVAL),
            dry_run: config.settings.dry_run,
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (reports, _) = watch::channel(None);
        Self {
            sync,
            targets: config.targets.clone(),
            options,
            events,
            reports,
            ticks: AtomicU64::new(0),
        }
    }

    pub fn with_options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &LoopOptions {
        &self.options
    }

    pub fn targets(&self) -> &[SyncTarget] {
        &self.targets
    }

    pub fn sync(&self) -> &RepoSync<G> {
        &self.sync
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// Latest finished tick, updated at the end of every pass.
    pub fn reports(&self) -> watch::Receiver<Option<TickReport>> {
        self.reports.subscribe()
    }

    pub fn ticks_completed(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Run one full pass. Blocks on git for as long as the pass takes.
    pub fn tick(&self, cause: TickCause) -> TickReport {
        let started = Instant::now();
        let seq = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(tick = seq, ?cause, "tick started");

        let categories = self
            .targets
            .iter()
            .map(|target| self.process(target))
            .collect();

        let report = TickReport {
            tick: seq,
            cause,
            finished_at_unix: unix_seconds_now(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            categories,
        };
        self.reports.send_replace(Some(report.clone()));
        report
    }

    fn process(&self, target: &SyncTarget) -> CategoryReport {
        let category = target.category.clone();
        let report = |cloned: bool, status: CategoryStatus| CategoryReport {
            category: category.clone(),
            cloned,
            status,
        };

        let cloned = match self.sync.ensure_present(target) {
            Ok(cloned) => cloned,
            Err(err) => {
                tracing::error!(category = %target.category, error = %err, "working copy unavailable");
                return report(false, CategoryStatus::Failed {
                    reason: err.to_string(),
                });
            }
        };

        let local = match self.sync.latest_local_commit(target) {
            Ok(local) => local,
            Err(err) => {
                tracing::error!(category = %target.category, error = %err, "cannot read local head");
                return report(cloned, CategoryStatus::Failed {
                    reason: err.to_string(),
                });
            }
        };

        let Some(remote) = self.sync.latest_remote_commit(target) else {
            tracing::warn!(
                category = %target.category,
                local = %local.short(),
                "remote head unknown; skipping this tick",
            );
            return report(cloned, CategoryStatus::RemoteUnknown { local });
        };

        if local == remote {
            tracing::debug!(category = %target.category, head = %local.short(), "no new commit");
            return report(cloned, CategoryStatus::Unchanged { head: local });
        }

        let event = DeliveryEvent::NewCommit {
            category: target.category.clone(),
            local: local.clone(),
            remote: remote.clone(),
        };
        tracing::info!(
            category = %target.category,
            local = %local.short(),
            remote = %remote.short(),
            "{event}",
        );
        self.emit(event);

        if self.options.dry_run {
            return report(cloned, CategoryStatus::Diverged { local, remote });
        }

        match self.sync.converge(target) {
            Ok(SyncOutcome::Converged { head }) => {
                tracing::info!(category = %target.category, head = %head.short(), "converged");
                self.emit(DeliveryEvent::Converged {
                    category: target.category.clone(),
                    head: head.clone(),
                });
                report(cloned, CategoryStatus::Converged {
                    from: local,
                    to: head,
                })
            }
            Ok(SyncOutcome::Unchanged) => report(cloned, CategoryStatus::Unchanged { head: local }),
            Ok(SyncOutcome::ConvergenceFailed { reason }) => {
                tracing::warn!(category = %target.category, "convergence failed; retrying next tick");
                self.emit(DeliveryEvent::ConvergenceFailed {
                    category: target.category.clone(),
                    reason: reason.clone(),
                });
                report(cloned, CategoryStatus::ConvergenceFailed { reason })
            }
            Err(err) => {
                tracing::error!(category = %target.category, error = %err, "convergence abandoned");
                let reason = err.to_string();
                self.emit(DeliveryEvent::ConvergenceFailed {
                    category: target.category.clone(),
                    reason: reason.clone(),
                });
                report(cloned, CategoryStatus::Failed { reason })
            }
        }
    }

    fn emit(&self, event: DeliveryEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.events.send(event);
    }
}

impl<G: GitBackend + 'static> DeliveryLoop<G> {
    /// Run a pass for every tick the ticker yields; returns once it is cancelled.
    ///
    /// Each pass runs on the blocking pool and is awaited before the ticker is
    /// asked for the next tick, so passes never overlap.
    pub async fn run(self: Arc<Self>, mut ticker: Ticker) -> Result<(), DaemonError> {
        tracing::info!(
            categories = self.targets.len(),
            interval_secs = ticker.interval().as_secs_f64(),
            dry_run = self.options.dry_run,
            "starting continuous delivery loop",
        );
        while let Some(tick) = ticker.next().await {
            let this = Arc::clone(&self);
            let report = tokio::task::spawn_blocking(move || this.tick(tick.cause))
                .await
                .map_err(|err| DaemonError::TaskFailed {
                    task: "tick",
                    reason: err.to_string(),
                })?;
            tracing::debug!(
                tick = report.tick,
                duration_ms = report.duration_ms,
                failures = report.failures(),
                "tick finished",
            );
        }
        tracing::info!("delivery loop stopped");
        Ok(())
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
