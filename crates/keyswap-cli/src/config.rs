//! CLI configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keyswap_core::{BackfillConfig, ExecutorConfig, NewKey, PlanOptions};

use crate::formatter::OutputFormat;

/// Default ledger directory.
pub const DEFAULT_LEDGER_PATH: &str = "./keyswap-ledger";

/// Default backfill batch size.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default replacement key column.
pub const DEFAULT_NEW_KEY: &str = "uuid";

/// Resolved CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Ledger sled directory.
    pub ledger_path: PathBuf,
    /// Executor settings.
    pub executor: ExecutorConfig,
    /// Output format.
    pub format: OutputFormat,
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "keyswap")]
#[command(version, about = "Online primary-key replacement", long_about = None)]
pub struct Args {
    /// Ledger directory (sled)
    #[arg(long, default_value = DEFAULT_LEDGER_PATH)]
    pub ledger: PathBuf,

    /// Rows per backfill batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Pause between backfill batches in milliseconds
    #[arg(long, default_value_t = 0)]
    pub batch_delay_ms: u64,

    /// Skip the gap-fill copy before destructive drops
    #[arg(long)]
    pub no_refill: bool,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// What to do.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the phase plan for an entity
    Plan(Target),

    /// Apply the plan to the snapshot, resuming from the ledger
    Apply {
        #[command(flatten)]
        target: Target,

        /// Stop after this phase ordinal
        #[arg(long)]
        through: Option<u32>,

        /// Continue an in-progress migration
        #[arg(long)]
        resume: bool,
    },

    /// Show ledger status for an entity
    Status {
        /// Entity table name
        #[arg(long)]
        entity: String,
    },
}

/// The entity and snapshot a plan or apply works on.
#[derive(clap::Args, Debug, Clone)]
pub struct Target {
    /// Database snapshot (JSON); rewritten in place by `apply`
    #[arg(long)]
    pub snapshot: PathBuf,

    /// Entity table name
    #[arg(long)]
    pub entity: String,

    /// Replacement key column
    #[arg(long, default_value = DEFAULT_NEW_KEY)]
    pub new_key: String,

    /// Restore plain join tables instead of keeping through tables
    #[arg(long)]
    pub no_through: bool,
}

impl Target {
    /// Planner options for this target.
    pub fn plan_options(&self, resume: bool) -> PlanOptions {
        let options =
            PlanOptions::new(NewKey::uuid(&self.new_key)).with_through_model(!self.no_through);
        if resume {
            options.resuming()
        } else {
            options
        }
    }
}

impl Args {
    /// Split into the resolved configuration and the command.
    pub fn into_config(self) -> (CliConfig, Command) {
        let backfill = BackfillConfig::default()
            .with_batch_size(self.batch_size)
            .with_batch_delay_ms(self.batch_delay_ms);
        let executor = ExecutorConfig::default()
            .with_backfill(backfill)
            .with_refill_before_drop(!self.no_refill);

        let config = CliConfig {
            ledger_path: self.ledger,
            executor,
            format: self.format,
        };
        (config, self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_args() {
        let args = Args::parse_from([
            "keyswap",
            "--ledger",
            "/tmp/ledger",
            "--batch-size",
            "50",
            "apply",
            "--snapshot",
            "db.json",
            "--entity",
            "author",
            "--no-through",
            "--through",
            "3",
        ]);
        let (config, command) = args.into_config();

        assert_eq!(config.ledger_path, PathBuf::from("/tmp/ledger"));
        assert_eq!(config.executor.backfill.batch_size, 50);
        assert!(config.executor.refill_before_drop);
        assert_eq!(config.format, OutputFormat::Table);

        let Command::Apply { target, through, resume } = command else {
            panic!("expected apply");
        };
        assert_eq!(through, Some(3));
        assert!(!resume);
        assert_eq!(target.entity, "author");
        let options = target.plan_options(resume);
        assert!(!options.use_through_model);
        assert_eq!(options.new_key.column, "uuid");
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["keyswap", "status", "--entity", "author"]);
        let (config, command) = args.into_config();

        assert_eq!(config.ledger_path, PathBuf::from(DEFAULT_LEDGER_PATH));
        assert_eq!(config.executor.backfill.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.executor.backfill.batch_delay_ms, 0);
        assert!(matches!(command, Command::Status { entity } if entity == "author"));
    }
}
