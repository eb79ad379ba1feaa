//! `pullwatch run`: load the configuration and drive the delivery loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use pullwatch_core::config;
use pullwatch_daemon::{run_once, start_blocking, CategoryStatus, RunOptions, TickReport};

/// Interval used when neither `--interval` nor `[agent] interval` is set.
const DEFAULT_RUN_INTERVAL: Duration = Duration::from_secs(30);

/// Arguments for `pullwatch run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Configuration file [default: ./pullwatch.ini].
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Seconds between passes; overrides `[agent] interval`.
    #[arg(long, value_parser = parse_interval)]
    pub interval: Option<Duration>,

    /// Run a single pass and exit.
    #[arg(long)]
    pub once: bool,

    /// Report new commits without touching working copies.
    #[arg(long)]
    pub dry_run: bool,

    /// With `--once`, print the pass report as JSON.
    #[arg(long, requires = "once")]
    pub json: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Do not serve status/stop/poll on the control socket.
    #[arg(long)]
    pub no_control_socket: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let path = self.config.clone().unwrap_or_else(config::default_path);
        let config = config::load_at(&path).context("failed to load configuration")?;
        let home = dirs::home_dir().context("could not determine home directory")?;

        let options = RunOptions {
            home,
            interval: self
                .interval
                .or(config.settings.interval)
                .unwrap_or(DEFAULT_RUN_INTERVAL),
            dry_run: self.dry_run || config.settings.dry_run,
            control_socket: !self.no_control_socket,
            log_json: self.log_json,
        };

        if !self.once {
            return start_blocking(config, options).context("agent exited with error");
        }

        let report = run_once(&config, &options);
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render report JSON")?
            );
        } else {
            print_table(&report);
        }

        let failures = report.failures();
        if failures > 0 {
            bail!("{failures} of {} categories failed", report.categories.len());
        }
        Ok(())
    }
}

fn parse_interval(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .parse()
        .map_err(|_| format!("`{raw}` is not a number of seconds"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err("interval must be a positive number of seconds".to_string());
    }
    Duration::try_from_secs_f64(secs).map_err(|_| format!("interval `{raw}` is out of range"))
}

#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "category")]
    category: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "detail")]
    detail: String,
}

fn print_table(report: &TickReport) {
    let rows: Vec<ReportRow> = report
        .categories
        .iter()
        .map(|entry| {
            let (status, detail) = describe(&entry.status);
            let detail = if entry.cloned {
                format!("{detail} (cloned)")
            } else {
                detail
            };
            ReportRow {
                category: entry.category.to_string(),
                status,
                detail,
            }
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!("pass {} finished in {} ms", report.tick, report.duration_ms);
}

fn describe(status: &CategoryStatus) -> (String, String) {
    match status {
        CategoryStatus::Unchanged { head } => {
            ("unchanged".green().to_string(), head.short().to_string())
        }
        CategoryStatus::RemoteUnknown { local } => (
            "remote unknown".yellow().to_string(),
            format!("local {}", local.short()),
        ),
        CategoryStatus::Diverged { local, remote } => (
            "new commit".yellow().to_string(),
            format!("{} -> {}", local.short(), remote.short()),
        ),
        CategoryStatus::Converged { from, to } => (
            "converged".cyan().to_string(),
            format!("{} -> {}", from.short(), to.short()),
        ),
        CategoryStatus::ConvergenceFailed { reason } => {
            ("convergence failed".red().to_string(), reason.clone())
        }
        CategoryStatus::Failed { reason } => ("failed".red().to_string(), reason.clone()),
    }
}
