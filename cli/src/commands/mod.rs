//! CLI command definitions and dispatch.

mod run;
mod version;

use clap::{Parser, Subcommand, ValueEnum};

pub use run::run_command;

/// Run Docker CLI commands against a ferry server in Kubernetes.
#[derive(Parser)]
#[command(name = "ferry", version, about)]
pub struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "FERRY_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Connect to the ferry server and run a command with DOCKER_HOST set
    Run(run::RunArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI and return the process exit code.
pub async fn dispatch(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    match cli.command {
        Command::Run(args) => run::execute(args).await,
        Command::Version(args) => version::execute(args).await.map(|()| 0),
    }
}
