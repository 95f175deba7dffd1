//! Tidemark CLI - Main entry point

use clap::Parser;
use std::process;
use std::sync::Arc;
use tidemark_cli::Cli;
use tidemark_engine::RunConfig;
use tracing::{error, info_span, Instrument};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let invocation = match cli.invocation() {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    // Config errors are reported before logging exists, the log directory
    // comes from the config
    let config = match RunConfig::load(&cli.data_config, &cli.env_config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let guard = match tidemark_cli::start_logging(&config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        }
    };

    let span = info_span!("dataset", dataset = %config.dataset_name, phase = %cli.phase);
    let result = tidemark_cli::commands::run(invocation, config.clone())
        .instrument(span)
        .await;

    if let Err(e) = result {
        error!(error = %e, phase = %cli.phase, dataset = %config.dataset_name, "Phase failed");
        eprintln!("Error: {}", e);
        drop(guard);
        process::exit(1);
    }
}
