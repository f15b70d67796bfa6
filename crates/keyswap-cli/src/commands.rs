//! Subcommand execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use keyswap_core::{KeySwap, MemoryStore, MigrationError};
use thiserror::Error;

use crate::config::{CliConfig, Command, Target};
use crate::formatter::create_formatter;

/// CLI errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// Snapshot file could not be read or written.
    #[error("{}: {source}", path.display())]
    Io {
        /// Snapshot path.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot file is not valid snapshot JSON.
    #[error("invalid snapshot {}: {source}", path.display())]
    Snapshot {
        /// Snapshot path.
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Ledger could not be opened.
    #[error("ledger: {0}")]
    Ledger(#[from] sled::Error),

    /// Migration error.
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Run one command and return its formatted output.
pub fn run(config: &CliConfig, command: Command) -> Result<String, CliError> {
    let formatter = create_formatter(config.format);
    let db = sled::open(&config.ledger_path)?;

    let output = match command {
        Command::Plan(target) => {
            let store = load_snapshot(&target.snapshot)?;
            let swap = KeySwap::open(store, &db, config.executor.clone())?;
            let plan = swap.plan(&target.entity, &target.plan_options(false))?;
            formatter.format_plan(&plan)
        }
        Command::Apply { target, through, resume } => {
            let result = apply(config, &db, &target, through, resume)?;
            formatter.format_apply(&result)
        }
        Command::Status { entity } => {
            let swap = KeySwap::open(Arc::new(MemoryStore::new()), &db, config.executor.clone())?;
            formatter.format_status(&swap.status(&entity)?)
        }
    };

    db.flush()?;
    Ok(output)
}

fn apply(
    config: &CliConfig,
    db: &sled::Db,
    target: &Target,
    through: Option<u32>,
    resume: bool,
) -> Result<keyswap_core::ApplyResult, CliError> {
    let store = load_snapshot(&target.snapshot)?;
    let swap = KeySwap::open(store.clone(), db, config.executor.clone())?;
    let plan = swap.plan(&target.entity, &target.plan_options(resume))?;

    tracing::info!(
        entity = %target.entity,
        phases = plan.len(),
        through = ?through,
        "applying plan"
    );
    let outcome = match through {
        Some(ordinal) => swap.apply_through(&plan, ordinal),
        None => swap.apply(&plan),
    };

    // Committed phases are in the ledger even when a later phase fails.
    save_snapshot(&store, &target.snapshot)?;
    db.flush()?;
    Ok(outcome?)
}

fn load_snapshot(path: &Path) -> Result<Arc<MemoryStore>, CliError> {
    let json = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let store = MemoryStore::from_json(&json).map_err(|source| CliError::Snapshot {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Arc::new(store))
}

fn save_snapshot(store: &MemoryStore, path: &Path) -> Result<(), CliError> {
    let json = store.to_json().map_err(|source| CliError::Snapshot {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}
