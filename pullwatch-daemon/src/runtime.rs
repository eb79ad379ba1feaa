use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};

use pullwatch_core::{AgentConfig, Category};
use pullwatch_sync::{GitBackend, GitCli, RepoSync};

use crate::delivery::{DeliveryLoop, LoopOptions, TickReport};
use crate::error::{io_err, DaemonError};
use crate::paths::{pullwatch_root, socket_path, AGENT_LABEL};
use crate::protocol::{ControlCommand, DaemonRequest, DaemonResponse};
use crate::ticker::{TickCause, Ticker};

/// How the agent process should run. Interval precedence (flag, config,
/// default) is resolved by the caller.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Home directory; the control socket lives under `<home>/.pullwatch/`.
    pub home: PathBuf,
    pub interval: Duration,
    pub dry_run: bool,
    /// Serve `status` / `stop` / `poll` on the control socket.
    pub control_socket: bool,
    /// Emit logs as JSON lines instead of human-readable text.
    pub log_json: bool,
}

/// Read-only view of the loop handed to socket clients.
#[derive(Clone)]
struct StatusSource {
    reports: watch::Receiver<Option<TickReport>>,
    categories: Vec<Category>,
    interval: Duration,
    dry_run: bool,
    started_at_unix: u64,
}

/// Build the production loop: `git` CLI backend, reset policy and timeout
/// from `[agent]`, interval and dry-run from `options`.
pub fn build_loop(config: &AgentConfig, options: &RunOptions) -> DeliveryLoop<GitCli> {
    let git = GitCli::new(config.settings.git_timeout);
    match git.version() {
        Some(version) => tracing::info!(%version, "using git"),
        None => tracing::warn!("git executable not found on PATH; every category will fail"),
    }
    let sync = RepoSync::new(git).with_reset_before_pull(config.settings.reset_before_pull);
    DeliveryLoop::new(config, sync).with_options(LoopOptions {
        interval: options.interval,
        dry_run: options.dry_run,
    })
}

/// Run exactly one pass and return its report.
pub fn run_once(config: &AgentConfig, options: &RunOptions) -> TickReport {
    init_tracing(options.log_json);
    build_loop(config, options).tick(TickCause::Startup)
}

/// Start the agent and block the current thread until it exits.
pub fn start_blocking(config: AgentConfig, options: RunOptions) -> Result<(), DaemonError> {
    init_tracing(options.log_json);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config, options))
}

/// Run the agent until SIGINT/SIGTERM or a `stop` request.
pub async fn run(config: AgentConfig, options: RunOptions) -> Result<(), DaemonError> {
    tracing::info!(
        config = %config.source.display(),
        remote = %config.remote_url,
        "starting continuous delivery; press CTRL+C to exit",
    );
    let delivery = Arc::new(build_loop(&config, &options));
    serve(delivery, options).await
}

/// Drive `delivery` with a ticker, the control socket and signal handling
/// until any of them requests shutdown.
pub async fn serve<G: GitBackend + 'static>(
    delivery: Arc<DeliveryLoop<G>>,
    options: RunOptions,
) -> Result<(), DaemonError> {
    let root = pullwatch_root(&options.home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (poll_tx, poll_rx) = mpsc::channel::<()>(8);

    let status = StatusSource {
        reports: delivery.reports(),
        categories: delivery.targets().iter().map(|t| t.category.clone()).collect(),
        interval: delivery.options().interval,
        dry_run: delivery.options().dry_run,
        started_at_unix: unix_seconds_now(),
    };
    let ticker = Ticker::new(delivery.options().interval, shutdown_tx.subscribe()).with_poll(poll_rx);

    let delivery_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = delivery.run(ticker).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = options.home.clone();
        let enabled = options.control_socket;
        tokio::spawn(async move {
            if !enabled {
                return Ok(());
            }
            let result = socket_server_task(
                home,
                status,
                poll_tx,
                shutdown.clone(),
                shutdown.subscribe(),
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = shutdown_signal() => {
                    match signal {
                        Ok(name) => {
                            tracing::info!(signal = name, "received signal, shutting down agent");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::TaskFailed {
                            task: "signal_handler",
                            reason: err.to_string(),
                        }),
                    }
                }
            }
        })
    };

    let (delivery_result, socket_result, signal_result) =
        tokio::join!(delivery_handle, socket_handle, signal_handle);

    handle_join("delivery_loop", delivery_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

async fn socket_server_task(
    home: PathBuf,
    status: StatusSource,
    poll_tx: mpsc::Sender<()>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::debug!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let status = status.clone();
                let poll_tx = poll_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, home, status, poll_tx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    status: StatusSource,
    poll_tx: mpsc::Sender<()>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("agent socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let command = match request.cmd.parse::<ControlCommand>() {
            Ok(command) => command,
            Err(reason) => {
                write_response(&mut writer, &DaemonResponse::error(reason)).await?;
                continue;
            }
        };

        let response = match command {
            ControlCommand::Status => DaemonResponse::ok(build_status_payload(&home, &status)),
            ControlCommand::Poll => match poll_tx.try_send(()) {
                // A full queue already holds a pending poll.
                Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {
                    DaemonResponse::ok(json!({ "polled": true }))
                }
                Err(mpsc::error::TrySendError::Closed(())) => {
                    DaemonResponse::error("delivery loop is not running")
                }
            },
            ControlCommand::Stop => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
        };

        write_response(&mut writer, &response).await?;
        if command == ControlCommand::Stop {
            break;
        }
    }

    Ok(())
}

fn build_status_payload(home: &Path, status: &StatusSource) -> Value {
    let last_tick = status.reports.borrow().clone();
    let ticks = last_tick.as_ref().map(|r| r.tick).unwrap_or(0);
    let categories: Vec<&str> = status.categories.iter().map(|c| c.0.as_str()).collect();

    json!({
        "running": true,
        "label": AGENT_LABEL,
        "started_at_unix": status.started_at_unix,
        "interval_secs": status.interval.as_secs_f64(),
        "dry_run": status.dry_run,
        "categories": categories,
        "ticks": ticks,
        "last_tick": last_tick,
        "socket": socket_path(home).display().to_string(),
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "agent socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale agent socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("agent socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("agent socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("agent socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::TaskFailed {
            task,
            reason: err.to_string(),
        }),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pullwatch_core::{CommitRef, SyncTarget};
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::delivery::{CategoryReport, CategoryStatus};

    fn status_source(reports: watch::Receiver<Option<TickReport>>) -> StatusSource {
        StatusSource {
            reports,
            categories: vec![Category::from("dev"), Category::from("master")],
            interval: Duration::from_secs(30),
            dry_run: false,
            started_at_unix: 1_000_000,
        }
    }

    #[test]
    fn status_payload_before_first_tick() {
        let home = TempDir::new().expect("home");
        let (_tx, rx) = watch::channel(None);
        let payload = build_status_payload(home.path(), &status_source(rx));

        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["started_at_unix"], json!(1_000_000u64));
        assert_eq!(payload["ticks"], json!(0u64));
        assert_eq!(payload["last_tick"], Value::Null);
        assert_eq!(payload["categories"], json!(["dev", "master"]));
        assert_eq!(payload["interval_secs"], json!(30.0));
    }

    #[test]
    fn status_payload_includes_last_tick_per_category() {
        let home = TempDir::new().expect("home");
        let report = TickReport {
            tick: 7,
            cause: TickCause::Interval,
            finished_at_unix: 1_000_100,
            duration_ms: 42,
            categories: vec![
                CategoryReport {
                    category: Category::from("dev"),
                    cloned: false,
                    status: CategoryStatus::Converged {
                        from: CommitRef::from("h1"),
                        to: CommitRef::from("h2"),
                    },
                },
                CategoryReport {
                    category: Category::from("master"),
                    cloned: false,
                    status: CategoryStatus::RemoteUnknown {
                        local: CommitRef::from("m1"),
                    },
                },
            ],
        };
        let (_tx, rx) = watch::channel(Some(report));
        let payload = build_status_payload(home.path(), &status_source(rx));

        assert_eq!(payload["ticks"], json!(7u64));
        let categories = payload["last_tick"]["categories"]
            .as_array()
            .expect("categories array");
        assert_eq!(categories.len(), 2);
        assert_eq!(categories[0]["category"], json!("dev"));
        assert_eq!(categories[0]["status"], json!("converged"));
        assert_eq!(categories[0]["to"], json!("h2"));
        assert_eq!(categories[1]["status"], json!("remote_unknown"));
    }

    #[test]
    fn stale_socket_file_is_removed_before_bind() {
        let dir = TempDir::new().expect("dir");
        let socket = dir.path().join("agent.sock");
        fs::write(&socket, b"").expect("stale file");
        prepare_socket_for_bind(&socket).expect("prepare");
        assert!(!socket.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serve_answers_status_and_stops_on_request() {
        use pullwatch_sync::fake::FakeGit;

        let home = TempDir::new().expect("home");
        let work = TempDir::new().expect("work");
        let url = "https://example/repo.git";
        let git = FakeGit::new();
        git.add_remote_branch(url, "develop", &["h0", "h1"]);

        let config = AgentConfig {
            source: PathBuf::from("pullwatch.ini"),
            remote_url: url.to_string(),
            targets: vec![SyncTarget {
                category: Category::from("dev"),
                local_path: work.path().join("dev"),
                remote_branch: "develop".to_string(),
                remote_url: url.to_string(),
            }],
            settings: Default::default(),
        };
        let delivery = Arc::new(DeliveryLoop::new(&config, RepoSync::new(git.clone())));
        let options = RunOptions {
            home: home.path().to_path_buf(),
            interval: Duration::from_secs(3600),
            dry_run: false,
            control_socket: true,
            log_json: false,
        };
        let server = tokio::spawn(serve(delivery, options));

        let home_path = home.path().to_path_buf();
        let status = tokio::task::spawn_blocking(move || {
            for _ in 0..50 {
                if let Ok(status) = crate::protocol::request_status(&home_path) {
                    if status["ticks"].as_u64().unwrap_or(0) >= 1 {
                        return Some(status);
                    }
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            None
        })
        .await
        .expect("join status poller")
        .expect("status after first tick");
        assert_eq!(status["last_tick"]["categories"][0]["status"], json!("unchanged"));
        assert_eq!(status["last_tick"]["categories"][0]["cloned"], json!(true));

        let client = crate::protocol::ControlClient::for_home(home.path());
        let refused = tokio::task::spawn_blocking(move || {
            client.exchange(&DaemonRequest {
                cmd: "reload".to_string(),
            })
        })
        .await
        .expect("join reload")
        .expect("agent answers unknown command");
        assert!(!refused.ok);
        assert_eq!(refused.error.as_deref(), Some("unknown command 'reload'"));

        let home_path = home.path().to_path_buf();
        tokio::task::spawn_blocking(move || crate::protocol::request_stop(&home_path))
            .await
            .expect("join stop")
            .expect("stop request");

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("serve exits after stop")
            .expect("join serve")
            .expect("serve result");
        assert!(!socket_path(home.path()).exists(), "socket removed on shutdown");
    }
}
