//! CLI for the tally metric store.
//!
//! `tally serve` runs the collector: an HTTP API in front of a repository,
//! with snapshot restore at boot and periodic snapshots. `tally agent`
//! samples the local process and reports to a collector.

mod agent;
mod config;
mod server;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::{AgentArgs, ServeArgs};

/// tally — metric collector and reporting agent.
#[derive(Parser)]
#[command(name = "tally", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the collector HTTP server.
    Serve(ServeArgs),

    /// Sample this process and report to a collector.
    Agent(AgentArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => server::run(args).await,
        Commands::Agent(args) => agent::run(args).await,
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
