//! trackmirror: mirror tasks, notes, and versions between two ftrack servers.
//!
//! # Usage
//!
//! ```text
//! trackmirror run [--memory]
//! trackmirror status [--json]
//! trackmirror stop
//! trackmirror check-config
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{check_config::CheckConfigArgs, run::RunArgs, status::StatusArgs};

#[derive(Parser, Debug)]
#[command(
    name = "trackmirror",
    version,
    about = "Keep the UNDARK and PBV ftrack servers in sync",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon in the foreground.
    Run(RunArgs),

    /// Show counters and echo state of the running daemon.
    Status(StatusArgs),

    /// Ask the running daemon to shut down.
    Stop,

    /// Validate the config file and resolve credentials for both servers.
    CheckConfig(CheckConfigArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Stop => commands::stop::run(),
        Commands::CheckConfig(args) => args.run(),
    }
}
