//! # Sidecar
//!
//! The in-pod helper of the mysql operator, run once as `sidecar init`
//! before mysql starts and for the pod lifetime as `sidecar tail <file>`

use std::{path::PathBuf, process::exit};

use clap::{ArgAction, Parser, Subcommand};
use tracing::error;

use mysql_operator::{
    logging,
    sidecar::{init, tail, Config, Paths},
};

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[command(name = "sidecar", about = "A node-local helper for the mysql operator", version)]
struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', global = true, action = ArgAction::Count)]
    verbosity: u8,
    #[command(subcommand)]
    command: Command,
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// Prepare configuration and host state before mysql starts
    Init,
    /// Follow a log file and print its lines to the standard output
    Tail {
        /// Path of the file to follow
        file: PathBuf,
    },
}

// -----------------------------------------------------------------------------
// main entrypoint

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = logging::initialize(args.verbosity as usize + 2) {
        eprintln!("failed to initialize logging system, {}", err);
        exit(1);
    }

    let config = Config::from_env();

    let result = match &args.command {
        Command::Init => init::run(&config, &Paths::default()),
        Command::Tail { file } => tail::run(file).await,
    };

    if let Err(err) = result {
        error!(
            error = err.to_string(),
            hostname = &config.hostname,
            "sidecar command failed",
        );
        exit(1);
    }
}
