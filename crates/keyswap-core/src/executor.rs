//! Phase executor.
//!
//! Applies a validated plan one phase at a time, strictly in order, starting
//! after the last ledger-confirmed phase. Each phase runs under the entity lock:
//!
//! 1. re-read the ledger; skip phases another executor already applied
//! 2. if the postconditions already hold, record the phase without re-running it
//! 3. for a DROP phase, re-run its idempotent gap-fill copy
//! 4. check preconditions; refuse without mutating anything
//! 5. run the action
//! 6. check postconditions; mark the phase failed and halt if unmet
//! 7. append the phase to the ledger

use std::sync::Arc;
use std::time::Duration;

use crate::backfill::{BackfillConfig, BackfillCopier, BackfillProgress, CancelToken};
use crate::condition::{first_unmet, first_unmet_structural};
use crate::error::{MigrationError, StoreError};
use crate::ledger::{MigrationLedger, PlanHeader};
use crate::lock::EntityLocks;
use crate::phase::{CopySpec, Phase, PhaseAction, PhaseKind};
use crate::plan::PhasePlan;
use crate::store::{CountFilter, LiveStore, RowId, SchemaOp};

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Backfill configuration.
    pub backfill: BackfillConfig,
    /// Re-run the matching copy right before each DROP phase, catching rows
    /// written with only the old reference during the backfill window.
    pub refill_before_drop: bool,
    /// How long to wait for another executor to release the entity.
    pub lock_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backfill: BackfillConfig::default(),
            refill_before_drop: true,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    /// Set the backfill configuration.
    pub fn with_backfill(mut self, backfill: BackfillConfig) -> Self {
        self.backfill = backfill;
        self
    }

    /// Enable or disable the pre-drop gap fill.
    pub fn with_refill_before_drop(mut self, refill_before_drop: bool) -> Self {
        self.refill_before_drop = refill_before_drop;
        self
    }

    /// Set the entity lock timeout.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

/// How an apply run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    /// Every phase is applied and the ledger is archived.
    Complete,
    /// Stopped at the requested ordinal.
    Partial,
    /// Stopped by the cancel token; resumable.
    Cancelled,
}

impl std::fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyStatus::Complete => write!(f, "complete"),
            ApplyStatus::Partial => write!(f, "partial"),
            ApplyStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of an apply run.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// Entity table.
    pub entity: String,
    /// Highest applied ordinal.
    pub applied_through: u32,
    /// Number of phases in the plan.
    pub total_phases: u32,
    /// How the run ended.
    pub status: ApplyStatus,
    /// Ordinals whose action ran (or was confirmed) during this run.
    pub phases_run: Vec<u32>,
    /// Progress of each copy performed during this run.
    pub backfill: Vec<BackfillProgress>,
}

impl ApplyResult {
    fn new(plan: &PhasePlan) -> Self {
        Self {
            entity: plan.entity_name().to_string(),
            applied_through: 0,
            total_phases: plan.last_ordinal(),
            status: ApplyStatus::Partial,
            phases_run: Vec::new(),
            backfill: Vec::new(),
        }
    }

    /// Whether every phase is applied.
    pub fn is_complete(&self) -> bool {
        self.status == ApplyStatus::Complete
    }
}

enum PhaseOutcome {
    /// Recorded by an earlier run or another executor.
    AlreadyApplied,
    /// Postconditions held; recorded without running.
    Confirmed,
    /// Action ran and was recorded.
    Applied,
}

/// Snapshot of the value count a rename must preserve.
struct RenameBaseline {
    table: String,
    column: Option<String>,
    count: u64,
}

/// Drives phases against a live store and a ledger.
pub struct PhaseExecutor {
    store: Arc<dyn LiveStore>,
    ledger: Arc<dyn MigrationLedger>,
    locks: Arc<EntityLocks>,
    copier: BackfillCopier,
    config: ExecutorConfig,
}

impl PhaseExecutor {
    /// Create a new executor.
    pub fn new(
        store: Arc<dyn LiveStore>,
        ledger: Arc<dyn MigrationLedger>,
        locks: Arc<EntityLocks>,
        config: ExecutorConfig,
    ) -> Self {
        let copier = BackfillCopier::new(Arc::clone(&store), config.backfill.clone());
        Self {
            store,
            ledger,
            locks,
            copier,
            config,
        }
    }

    /// Apply every remaining phase.
    pub fn apply(&self, plan: &PhasePlan, cancel: &CancelToken) -> Result<ApplyResult, MigrationError> {
        self.apply_until(plan, None, cancel)
    }

    /// Apply remaining phases up to and including `through`.
    pub fn apply_until(
        &self,
        plan: &PhasePlan,
        through: Option<u32>,
        cancel: &CancelToken,
    ) -> Result<ApplyResult, MigrationError> {
        plan.validate()?;
        let entity = plan.entity_name();
        let checksum = plan.checksum()?;
        let mut result = ApplyResult::new(plan);

        // Registration and the archived check happen under the entity lock so a
        // run another engine is finishing cannot be registered again.
        {
            let _guard = self.locks.acquire(entity, self.config.lock_timeout)?;
            match self.ledger.plan_header(entity)? {
                Some(header) if header.checksum != checksum => {
                    return Err(MigrationError::LedgerInconsistency {
                        entity: entity.to_string(),
                        reason: format!(
                            "ledger is applying plan {} but plan {} was given",
                            header.checksum, checksum
                        ),
                    });
                }
                Some(_) => {}
                None => {
                    if self.completed(entity, &checksum)? {
                        tracing::info!(entity, "plan already applied");
                        result.applied_through = result.total_phases;
                        result.status = ApplyStatus::Complete;
                        return Ok(result);
                    }
                    self.ledger.register_plan(&PlanHeader::for_plan(plan)?)?;
                }
            }
        }

        let stop = through.unwrap_or(result.total_phases).min(result.total_phases);
        let mut verified = false;

        for phase in plan.phases.iter().take_while(|p| p.ordinal <= stop) {
            if cancel.is_cancelled() {
                result.status = ApplyStatus::Cancelled;
                break;
            }
            match self.run_phase(plan, phase, cancel, &mut verified, &mut result) {
                Ok(PhaseOutcome::AlreadyApplied) => {}
                Ok(PhaseOutcome::Confirmed) | Ok(PhaseOutcome::Applied) => {
                    result.phases_run.push(phase.ordinal);
                }
                Err(MigrationError::Cancelled { ordinal }) => {
                    tracing::info!(entity, ordinal, "apply cancelled");
                    result.status = ApplyStatus::Cancelled;
                    break;
                }
                Err(e) => {
                    tracing::warn!(entity, ordinal = phase.ordinal, error = %e, "phase failed");
                    return Err(e);
                }
            }
        }

        let _guard = self.locks.acquire(entity, self.config.lock_timeout)?;
        let registered = self.ledger.plan_header(entity)?.is_some();
        result.applied_through = if registered {
            self.ledger.last_applied(entity)?.unwrap_or(0)
        } else if self.completed(entity, &checksum)? {
            result.total_phases
        } else {
            0
        };
        if result.status != ApplyStatus::Cancelled && result.applied_through == result.total_phases {
            if registered {
                self.ledger.archive(entity)?;
            }
            result.status = ApplyStatus::Complete;
            tracing::info!(entity, phases = result.total_phases, "key replacement complete");
        }

        Ok(result)
    }

    /// Whether the ledger archived this exact plan as complete.
    fn completed(&self, entity: &str, checksum: &str) -> Result<bool, MigrationError> {
        Ok(self
            .ledger
            .archived(entity)?
            .is_some_and(|run| run.header.checksum == checksum))
    }

    fn run_phase(
        &self,
        plan: &PhasePlan,
        phase: &Phase,
        cancel: &CancelToken,
        verified: &mut bool,
        result: &mut ApplyResult,
    ) -> Result<PhaseOutcome, MigrationError> {
        let entity = plan.entity_name();
        let _guard = self.locks.acquire(entity, self.config.lock_timeout)?;

        // Another engine on this ledger may have finished and archived the run.
        if self.ledger.plan_header(entity)?.is_none() && self.completed(entity, &plan.checksum()?)? {
            return Ok(PhaseOutcome::AlreadyApplied);
        }

        let last = self.ledger.last_applied(entity)?.unwrap_or(0);
        if phase.ordinal <= last {
            return Ok(PhaseOutcome::AlreadyApplied);
        }
        if phase.ordinal != last + 1 {
            return Err(MigrationError::LedgerInconsistency {
                entity: entity.to_string(),
                reason: format!("phase {} reached but last applied is {}", phase.ordinal, last),
            });
        }
        if !*verified {
            self.verify_resume_point(plan, last)?;
            *verified = true;
        }

        if first_unmet(self.store.as_ref(), &phase.postconditions)?.is_none() {
            self.ledger.record_applied(entity, phase.ordinal)?;
            if matches!(phase.action, PhaseAction::Copy(_)) {
                self.ledger.clear_cursor(entity, phase.ordinal)?;
            }
            tracing::info!(entity, phase = %phase, "phase already in effect, recorded");
            return Ok(PhaseOutcome::Confirmed);
        }

        if phase.kind == PhaseKind::Drop && self.config.refill_before_drop {
            if let Some(spec) = &phase.gap_fill {
                let progress = self.copy(entity, phase.ordinal, spec, None, cancel, false)?;
                tracing::debug!(
                    entity,
                    ordinal = phase.ordinal,
                    rows_written = progress.rows_written,
                    "gap fill before drop"
                );
                result.backfill.push(progress);
            }
        }

        if let Some(reason) = first_unmet(self.store.as_ref(), &phase.preconditions)? {
            return Err(MigrationError::PreconditionFailed {
                ordinal: phase.ordinal,
                reason,
            });
        }

        self.ledger.record_pending(entity, phase.ordinal)?;
        tracing::info!(entity, phase = %phase, "applying phase");

        let baseline = self.rename_baseline(phase)?;
        if let Err(e) = self.run_action(phase, cancel, result) {
            if !matches!(e, MigrationError::Cancelled { .. }) {
                self.ledger.record_failed(entity, phase.ordinal, &e.to_string())?;
            }
            return Err(e);
        }

        let unmet = match first_unmet(self.store.as_ref(), &phase.postconditions)? {
            Some(reason) => Some(reason),
            None => self.check_rename(baseline)?,
        };
        if let Some(reason) = unmet {
            self.ledger.record_failed(entity, phase.ordinal, &reason)?;
            return Err(MigrationError::PostconditionFailed {
                ordinal: phase.ordinal,
                reason,
            });
        }

        self.ledger.record_applied(entity, phase.ordinal)?;
        if matches!(phase.action, PhaseAction::Copy(_)) {
            self.ledger.clear_cursor(entity, phase.ordinal)?;
        }
        Ok(PhaseOutcome::Applied)
    }

    /// The last applied phase's schema effects must still be present, or the
    /// next phase's (it committed but was never recorded).
    fn verify_resume_point(&self, plan: &PhasePlan, last: u32) -> Result<(), MigrationError> {
        if last == 0 {
            return Ok(());
        }
        let entity = plan.entity_name();
        let applied = plan.phase(last).ok_or_else(|| MigrationError::LedgerInconsistency {
            entity: entity.to_string(),
            reason: format!("ledger records phase {} but the plan has {}", last, plan.len()),
        })?;
        let Some(reason) = first_unmet_structural(self.store.as_ref(), &applied.postconditions)? else {
            return Ok(());
        };
        if let Some(next) = plan.phase(last + 1) {
            if first_unmet_structural(self.store.as_ref(), &next.postconditions)?.is_none() {
                return Ok(());
            }
        }
        Err(MigrationError::LedgerInconsistency {
            entity: entity.to_string(),
            reason: format!("phase {} is recorded applied but {}", last, reason),
        })
    }

    fn run_action(
        &self,
        phase: &Phase,
        cancel: &CancelToken,
        result: &mut ApplyResult,
    ) -> Result<(), MigrationError> {
        match &phase.action {
            PhaseAction::Schema(op) => self
                .store
                .execute(op)
                .map_err(|e| MigrationError::from_action(phase.ordinal, e)),
            PhaseAction::Copy(spec) => {
                let entity = result.entity.clone();
                let start = self.ledger.load_cursor(&entity, phase.ordinal)?;
                let mut progress = self.copy(&entity, phase.ordinal, spec, start, cancel, true)?;

                // Rows behind a resumed cursor may have changed since they were copied.
                if start.is_some() && first_unmet(self.store.as_ref(), &phase.postconditions)?.is_some() {
                    tracing::debug!(entity = %entity, ordinal = phase.ordinal, "re-copying from the start");
                    let rerun = self.copy(&entity, phase.ordinal, spec, None, cancel, true)?;
                    progress.absorb(&rerun);
                    progress.cursor = rerun.cursor;
                }
                result.backfill.push(progress);
                Ok(())
            }
        }
    }

    fn copy(
        &self,
        entity: &str,
        ordinal: u32,
        spec: &CopySpec,
        start: Option<RowId>,
        cancel: &CancelToken,
        checkpoint: bool,
    ) -> Result<BackfillProgress, MigrationError> {
        let ledger = &self.ledger;
        let progress = self
            .copier
            .copy(spec, start, cancel, &mut |cursor| {
                if checkpoint {
                    ledger.save_cursor(entity, ordinal, cursor)
                } else {
                    Ok(())
                }
            })
            .map_err(|e| match e {
                MigrationError::Store(err) => MigrationError::from_action(ordinal, err),
                other => other,
            })?;
        if !progress.completed {
            return Err(MigrationError::Cancelled { ordinal });
        }
        Ok(progress)
    }

    fn rename_baseline(&self, phase: &Phase) -> Result<Option<RenameBaseline>, MigrationError> {
        if phase.kind != PhaseKind::Rename {
            return Ok(None);
        }
        let baseline = match &phase.action {
            PhaseAction::Schema(SchemaOp::RenameColumn { table, from, to }) => RenameBaseline {
                table: table.clone(),
                column: Some(to.clone()),
                count: self.count(table, &CountFilter::present(from.clone()), phase.ordinal)?,
            },
            PhaseAction::Schema(SchemaOp::RenameTable { from, to }) => RenameBaseline {
                table: to.clone(),
                column: None,
                count: self.count(from, &CountFilter::all(), phase.ordinal)?,
            },
            _ => return Ok(None),
        };
        Ok(Some(baseline))
    }

    fn check_rename(&self, baseline: Option<RenameBaseline>) -> Result<Option<String>, MigrationError> {
        let Some(baseline) = baseline else {
            return Ok(None);
        };
        let filter = match &baseline.column {
            Some(column) => CountFilter::present(column.clone()),
            None => CountFilter::all(),
        };
        let after = self.store.count(&baseline.table, &filter)?;
        if after == baseline.count {
            return Ok(None);
        }
        let target = match &baseline.column {
            Some(column) => format!("{}.{}", baseline.table, column),
            None => baseline.table.clone(),
        };
        Ok(Some(format!(
            "rename changed the value count of {} from {} to {}",
            target, baseline.count, after
        )))
    }

    fn count(&self, table: &str, filter: &CountFilter, ordinal: u32) -> Result<u64, MigrationError> {
        self.store
            .count(table, filter)
            .map_err(|e: StoreError| MigrationError::from_action(ordinal, e))
    }
}
