//! Engine facade: reflect, plan, apply, and report.

use std::sync::Arc;

use crate::backfill::CancelToken;
use crate::error::MigrationError;
use crate::executor::{ApplyResult, ExecutorConfig, PhaseExecutor};
use crate::ledger::{LedgerStatus, MigrationLedger, SledLedger};
use crate::plan::{PhasePlan, PlanBuilder, PlanOptions};
use crate::reflect::discover_entity;
use crate::store::{LiveStore, SchemaReflector};

/// Where an entity's migration stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    /// No plan registered and nothing archived.
    NotStarted,
    /// Some phases applied, more remain.
    InProgress,
    /// The most recent attempt of a phase failed.
    Failed {
        /// Failed phase.
        ordinal: u32,
        /// Recorded reason.
        reason: String,
    },
    /// Every phase applied; ledger archived.
    Complete,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::NotStarted => write!(f, "not started"),
            MigrationState::InProgress => write!(f, "in progress"),
            MigrationState::Failed { ordinal, reason } => {
                write!(f, "failed at phase {}: {}", ordinal, reason)
            }
            MigrationState::Complete => write!(f, "complete"),
        }
    }
}

/// Status of one entity.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Entity table.
    pub entity: String,
    /// Highest applied ordinal.
    pub last_applied: Option<u32>,
    /// Number of phases in the registered plan.
    pub total_phases: Option<u32>,
    /// Ordinals still to apply.
    pub pending: Vec<u32>,
    /// Overall state.
    pub state: MigrationState,
    /// The plan being applied (or last completed).
    pub plan: Option<PhasePlan>,
}

/// Primary-key replacement engine.
#[derive(Clone)]
pub struct KeySwap {
    store: Arc<dyn LiveStore>,
    ledger: Arc<dyn MigrationLedger>,
    executor: Arc<PhaseExecutor>,
}

impl KeySwap {
    /// Create an engine over a store and a ledger.
    ///
    /// Phases run under the ledger's apply locks, so engines sharing a ledger
    /// serialize their work on each entity.
    pub fn new(store: Arc<dyn LiveStore>, ledger: Arc<dyn MigrationLedger>, config: ExecutorConfig) -> Self {
        let executor = PhaseExecutor::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            ledger.apply_locks(),
            config,
        );
        Self {
            store,
            ledger,
            executor: Arc::new(executor),
        }
    }

    /// Create an engine with a sled-backed ledger.
    pub fn open(store: Arc<dyn LiveStore>, db: &sled::Db, config: ExecutorConfig) -> Result<Self, MigrationError> {
        let ledger = SledLedger::open(db)?;
        Ok(Self::new(store, Arc::new(ledger), config))
    }

    /// The ledger in use.
    pub fn ledger(&self) -> &Arc<dyn MigrationLedger> {
        &self.ledger
    }

    /// Reflect the entity and build its plan.
    ///
    /// With `options.resume`, an in-progress entity gets its registered plan
    /// back. An entity whose archived plan already promoted the requested key
    /// gets that plan back, so applying it again is a no-op.
    pub fn plan(&self, entity: &str, options: &PlanOptions) -> Result<PhasePlan, MigrationError> {
        if let Some(header) = self.ledger.plan_header(entity)? {
            if !options.resume {
                return Err(MigrationError::MigrationInProgress {
                    entity: entity.to_string(),
                });
            }
            return header.plan();
        }

        if let Some(run) = self.ledger.archived(entity)? {
            let plan = run.header.plan()?;
            let promoted = self
                .store
                .describe(entity)?
                .and_then(|d| d.primary_key)
                .is_some_and(|pk| pk == options.new_key.column);
            if promoted && plan.entity.new_key == options.new_key {
                return Ok(plan);
            }
        }

        let topology = discover_entity(self.store.as_ref(), entity, options.new_key.clone())?;
        PlanBuilder::build(&topology, options, self.ledger.as_ref())
    }

    /// Apply every remaining phase.
    pub fn apply(&self, plan: &PhasePlan) -> Result<ApplyResult, MigrationError> {
        self.executor.apply(plan, &CancelToken::new())
    }

    /// Apply remaining phases up to and including `ordinal`.
    pub fn apply_through(&self, plan: &PhasePlan, ordinal: u32) -> Result<ApplyResult, MigrationError> {
        self.executor.apply_until(plan, Some(ordinal), &CancelToken::new())
    }

    /// Apply every remaining phase, stopping early if `cancel` fires.
    pub fn apply_with_cancel(&self, plan: &PhasePlan, cancel: &CancelToken) -> Result<ApplyResult, MigrationError> {
        self.executor.apply(plan, cancel)
    }

    /// Report where an entity's migration stands.
    pub fn status(&self, entity: &str) -> Result<StatusReport, MigrationError> {
        let Some(header) = self.ledger.plan_header(entity)? else {
            return Ok(match self.ledger.archived(entity)? {
                Some(run) => StatusReport {
                    entity: entity.to_string(),
                    last_applied: Some(run.header.total_phases),
                    total_phases: Some(run.header.total_phases),
                    pending: Vec::new(),
                    state: MigrationState::Complete,
                    plan: Some(run.header.plan()?),
                },
                None => StatusReport {
                    entity: entity.to_string(),
                    last_applied: None,
                    total_phases: None,
                    pending: Vec::new(),
                    state: MigrationState::NotStarted,
                    plan: None,
                },
            });
        };

        let entries = self.ledger.entries(entity)?;
        let last_applied = self.ledger.last_applied(entity)?;
        let done = last_applied.unwrap_or(0);
        let state = match entries.last() {
            Some(entry) if entry.status == LedgerStatus::Failed && entry.ordinal > done => {
                MigrationState::Failed {
                    ordinal: entry.ordinal,
                    reason: entry.reason.clone().unwrap_or_default(),
                }
            }
            _ => MigrationState::InProgress,
        };

        Ok(StatusReport {
            entity: entity.to_string(),
            last_applied,
            total_phases: Some(header.total_phases),
            pending: (done + 1..=header.total_phases).collect(),
            state,
            plan: Some(header.plan()?),
        })
    }
}
