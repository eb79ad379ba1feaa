//! pullwatch: keep local working copies in step with their remote branches.
//!
//! # Usage
//!
//! ```text
//! pullwatch run [--config PATH] [--interval SECS] [--once] [--dry-run] [--json] [--log-json]
//! pullwatch status
//! pullwatch stop
//! pullwatch poll
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{agent::AgentCommand, run::RunArgs};

#[derive(Parser, Debug)]
#[command(
    name = "pullwatch",
    version,
    about = "Poll git remotes and fast-forward local working copies",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the delivery agent in the foreground.
    Run(RunArgs),

    /// Query a running agent over its control socket.
    Status,

    /// Ask a running agent to shut down gracefully.
    Stop,

    /// Ask a running agent to start a pass now.
    Poll,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Status => commands::agent::run(AgentCommand::Status),
        Commands::Stop => commands::agent::run(AgentCommand::Stop),
        Commands::Poll => commands::agent::run(AgentCommand::Poll),
    }
}
