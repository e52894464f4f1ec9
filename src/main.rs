//! droidgram - Telegram remote control for the Droid CLI.

use clap::Parser;
use std::process::ExitCode;

use droidgram::cli::Commands;
use droidgram::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Commands::parse();

    // Keep the guard alive so the file writer flushes on exit.
    let _guard = match logging::init(logging::resolve_log_dir(args.log_dir.clone()).as_deref()) {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
