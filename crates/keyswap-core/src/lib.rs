//! keyswap core - online primary-key replacement.
//!
//! Replaces the primary key of a live table (for example an integer id with a
//! UUID) without downtime and without losing any relationship that points at
//! it. The work is split into small ordered phases, each guarded by pre- and
//! postconditions and recorded in a durable ledger so an interrupted migration
//! resumes where it stopped.
//!
//! ```text
//! SchemaReflector ──► discover_entity ──► PlanBuilder ──► PhasePlan
//!                                                             │
//!        LiveStore ◄── PhaseExecutor ◄── KeySwap ◄────────────┘
//!                          │      │
//!               BackfillCopier  MigrationLedger (sled)
//! ```

pub mod backfill;
pub mod condition;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod lock;
pub mod phase;
pub mod plan;
pub mod reflect;
pub mod store;
pub mod topology;

pub use backfill::{BackfillConfig, BackfillCopier, BackfillProgress, CancelToken};
pub use condition::{Condition, KeyResolution};
pub use engine::{KeySwap, MigrationState, StatusReport};
pub use error::{MigrationError, StoreError};
pub use executor::{ApplyResult, ApplyStatus, ExecutorConfig, PhaseExecutor};
pub use ledger::{
    CompletedRun, LedgerEntry, LedgerStatus, MigrationLedger, PlanHeader, SledLedger,
};
pub use lock::EntityLocks;
pub use phase::{CopySpec, Phase, PhaseAction, PhaseKind};
pub use plan::{PhasePlan, PlanBuilder, PlanOptions};
pub use reflect::discover_entity;
pub use store::{
    ColumnDef, ForeignKeyDef, KeyGenerator, LiveStore, MemoryStore, Row, RowId, SchemaOp,
    SchemaReflector, Snapshot, TableDef, TableDescription, TableRole, Value,
};
pub use topology::{Dependent, Entity, ForeignKeyDependent, ManyToManyDependent, NewKey};
