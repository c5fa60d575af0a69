//! Stacker - per-room floor queue for chat.

use clap::Parser;
use std::process::ExitCode;

use stacker::{logging, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    // Keep the guard alive so buffered log lines are flushed on exit.
    let _log_guard = match logging::init() {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Parse command line arguments
    let args = Commands::parse();

    // Run the command
    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
