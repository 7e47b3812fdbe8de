use anyhow::{Context, Result};
use bcast::config::{BroadcastConfig, CliArgs};
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bcast: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = CliArgs::parse();

    setup_logging(args.verbose, args.quiet);

    let config = BroadcastConfig::from_args(args).context("Invalid configuration")?;

    let rank = config.group.rank;
    let report = bcast::broadcast::run(&config)
        .await
        .with_context(|| format!("Rank {} failed", rank))?;

    if let Some(throughput) = report {
        println!("bcast: {}", throughput);
    }
    Ok(())
}

fn setup_logging(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "bcast=info,warn",
        (false, _) => "bcast=debug,warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
