//! keyswap command-line tool
//!
//! Plans and applies online primary-key replacement against a JSON database
//! snapshot, recording progress in a sled ledger so runs can be resumed.

mod commands;
mod config;
mod formatter;

use clap::Parser;
use config::Args;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() {
    // Logs go to stderr so formatted output on stdout stays parseable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyswap=info,keyswap_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let (config, command) = args.into_config();

    tracing::debug!(
        ledger = %config.ledger_path.display(),
        batch_size = config.executor.backfill.batch_size,
        "configuration loaded"
    );

    if let Err(e) = run(&config, command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(config: &config::CliConfig, command: config::Command) -> Result<(), Box<dyn std::error::Error>> {
    let output = commands::run(config, command)?;
    println!("{}", output);
    Ok(())
}
