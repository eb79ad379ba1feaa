//! `pullwatch status|stop|poll`: talk to a running agent.

use anyhow::{Context, Result};

use pullwatch_daemon::paths::socket_path;
use pullwatch_daemon::{request_poll, request_status, request_stop, DaemonError};

#[derive(Debug, Clone, Copy)]
pub enum AgentCommand {
    Status,
    Stop,
    Poll,
}

pub fn run(command: AgentCommand) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;

    match command {
        AgentCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("agent stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("agent is not running"),
            Err(err) => return Err(err).context("failed to stop agent"),
        },
        AgentCommand::Poll => match request_poll(&home) {
            Ok(_) => println!("poll requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("agent is not running"),
            Err(err) => return Err(err).context("failed to request a poll"),
        },
        AgentCommand::Status => {
            let payload = match request_status(&home) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query agent status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload)
                    .context("failed to render agent status JSON")?
            );
        }
    }

    Ok(())
}
