//! Batched, resumable data copy.
//!
//! Each batch is committed on its own so concurrent writers are never blocked
//! for longer than one batch. The cursor is the last row id of the source table
//! that was processed; it is checkpointed after every batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::condition::KeyResolution;
use crate::error::MigrationError;
use crate::phase::CopySpec;
use crate::store::{LiveStore, Row, RowId, RowWrite, Value};

/// Configuration for backfill execution.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Number of source rows per batch.
    pub batch_size: usize,
    /// Delay between batches in milliseconds (for yielding to writes).
    pub batch_delay_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            batch_delay_ms: 10,
        }
    }
}

impl BackfillConfig {
    /// Set the batch size. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the delay between batches.
    pub fn with_batch_delay_ms(mut self, batch_delay_ms: u64) -> Self {
        self.batch_delay_ms = batch_delay_ms;
        self
    }
}

/// Cooperative cancellation flag, checked between batches and between phases.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress report for one copy run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillProgress {
    /// Source rows read.
    pub rows_scanned: u64,
    /// Target rows changed or inserted.
    pub rows_written: u64,
    /// Batches committed.
    pub batches: u64,
    /// Last processed source row id.
    pub cursor: Option<RowId>,
    /// Whether the source was exhausted.
    pub completed: bool,
}

impl BackfillProgress {
    /// Fold another run's counters into this one.
    pub fn absorb(&mut self, other: &BackfillProgress) {
        self.rows_scanned += other.rows_scanned;
        self.rows_written += other.rows_written;
        self.batches += other.batches;
    }
}

/// Executes [`CopySpec`]s against a live store.
pub struct BackfillCopier {
    store: Arc<dyn LiveStore>,
    config: BackfillConfig,
}

impl BackfillCopier {
    /// Create a new copier.
    pub fn new(store: Arc<dyn LiveStore>, config: BackfillConfig) -> Self {
        Self { store, config }
    }

    /// Configuration in use.
    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// Run a copy from `start_after` until the source is exhausted or
    /// cancellation is requested.
    ///
    /// `checkpoint` is called with the new cursor after each committed batch.
    /// Every write is idempotent, so re-running over already copied rows is safe.
    pub fn copy(
        &self,
        spec: &CopySpec,
        start_after: Option<RowId>,
        cancel: &CancelToken,
        checkpoint: &mut dyn FnMut(RowId) -> Result<(), MigrationError>,
    ) -> Result<BackfillProgress, MigrationError> {
        let mut progress = BackfillProgress {
            cursor: start_after,
            ..Default::default()
        };
        let source = spec.source_table();
        let target = spec.target_table();

        loop {
            if cancel.is_cancelled() {
                tracing::info!(
                    source,
                    cursor = ?progress.cursor,
                    batches = progress.batches,
                    "backfill cancelled"
                );
                return Ok(progress);
            }

            let rows = self
                .store
                .scan(source, progress.cursor, self.config.batch_size)?;
            let Some(last) = rows.last().map(|r| r.id) else {
                progress.completed = true;
                break;
            };

            let writes = self.writes_for(spec, &rows)?;
            let written = if writes.is_empty() {
                0
            } else {
                self.store.commit(target, writes)?
            };

            progress.rows_scanned += rows.len() as u64;
            progress.rows_written += written as u64;
            progress.batches += 1;
            progress.cursor = Some(last);
            checkpoint(last)?;

            tracing::debug!(
                source,
                target,
                cursor = last,
                rows = rows.len(),
                written,
                "backfill batch committed"
            );

            if rows.len() < self.config.batch_size {
                progress.completed = true;
                break;
            }
            if self.config.batch_delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.config.batch_delay_ms));
            }
        }

        tracing::info!(
            source,
            target,
            rows_scanned = progress.rows_scanned,
            rows_written = progress.rows_written,
            batches = progress.batches,
            "backfill complete"
        );
        Ok(progress)
    }

    fn writes_for(&self, spec: &CopySpec, rows: &[Row]) -> Result<Vec<RowWrite>, MigrationError> {
        let mut resolved = ResolutionCache::default();
        let mut writes = Vec::new();

        match spec {
            CopySpec::GenerateKeys { column, generator, .. } => {
                for row in rows.iter().filter(|r| r.get(column).is_null()) {
                    writes.push(RowWrite::Fill {
                        row: row.id,
                        column: column.clone(),
                        value: generator.generate(),
                    });
                }
            }
            CopySpec::RepointReferences {
                old_column,
                new_column,
                resolve,
                ..
            } => {
                for row in rows {
                    let Some(value) = resolved.get(self.store.as_ref(), resolve, row.get(old_column))?
                    else {
                        continue;
                    };
                    if row.get(new_column) != &value {
                        writes.push(RowWrite::Update {
                            row: row.id,
                            column: new_column.clone(),
                            value,
                        });
                    }
                }
            }
            CopySpec::CopyPairings {
                owner_column,
                entity_column,
                resolve,
                ..
            } => {
                for row in rows {
                    let entity_value = match resolve {
                        Some(resolution) => {
                            match resolved.get(self.store.as_ref(), resolution, row.get(entity_column))? {
                                Some(v) => v,
                                None => continue,
                            }
                        }
                        None => row.get(entity_column).clone(),
                    };
                    let values: BTreeMap<String, Value> = [
                        (owner_column.clone(), row.get(owner_column).clone()),
                        (entity_column.clone(), entity_value),
                    ]
                    .into_iter()
                    .collect();
                    writes.push(RowWrite::InsertIfAbsent { values });
                }
            }
        }

        Ok(writes)
    }
}

/// Per-batch cache of old-key to new-key lookups.
#[derive(Default)]
struct ResolutionCache {
    values: HashMap<Value, Option<Value>>,
}

impl ResolutionCache {
    fn get(
        &mut self,
        store: &dyn LiveStore,
        resolution: &KeyResolution,
        value: &Value,
    ) -> Result<Option<Value>, MigrationError> {
        if value.is_null() {
            return Ok(None);
        }
        if let Some(hit) = self.values.get(value) {
            return Ok(hit.clone());
        }
        let resolved = resolution.resolve(store, value)?;
        self.values.insert(value.clone(), resolved.clone());
        Ok(resolved)
    }
}
