//! Error types for the store seam and the migration core.

use thiserror::Error;

/// Errors reported by a live store implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Table or column does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Table or column already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The store rejected the operation to protect a constraint.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The operation is malformed for the current schema.
    #[error("invalid operation: {0}")]
    Invalid(String),
}

/// Migration errors.
///
/// Every error raised while a phase is running names the phase ordinal.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A phase's required prior state is absent. Nothing was mutated.
    #[error("phase {ordinal}: precondition failed: {reason}")]
    PreconditionFailed {
        /// Ordinal of the phase that was refused.
        ordinal: u32,
        /// Which condition was unmet.
        reason: String,
    },

    /// The action ran but the expected end state was not reached.
    #[error("phase {ordinal}: postcondition failed: {reason}")]
    PostconditionFailed {
        /// Ordinal of the failed phase.
        ordinal: u32,
        /// Which condition was unmet.
        reason: String,
    },

    /// The store rejected a uniqueness, non-null, or referential constraint.
    #[error("phase {ordinal}: constraint violation: {reason}")]
    ConstraintViolation {
        /// Ordinal of the failed phase.
        ordinal: u32,
        /// Store message.
        reason: String,
    },

    /// The store failed the action for a reason other than a constraint.
    #[error("phase {ordinal}: action failed: {source}")]
    ActionFailed {
        /// Ordinal of the failed phase.
        ordinal: u32,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// Ledger and live schema disagree. Requires manual reconciliation.
    #[error("ledger inconsistency for {entity}: {reason}")]
    LedgerInconsistency {
        /// Entity whose ledger is inconsistent.
        entity: String,
        /// Description of the disagreement.
        reason: String,
    },

    /// A plan would substitute a drop/add pair for a rename.
    #[error("phase {ordinal}: {name} is dropped by phase {dropped_by} and re-added; renames must not be drop+add")]
    DestructiveRename {
        /// Ordinal of the phase re-adding the name.
        ordinal: u32,
        /// Ordinal of the phase that dropped the name.
        dropped_by: u32,
        /// The table or table.column name.
        name: String,
    },

    /// The plan violates the ordering contract.
    #[error("invalid plan: {reason}")]
    InvalidPlan {
        /// Description of the violation.
        reason: String,
    },

    /// A migration for this entity already has ledger entries.
    #[error("migration already in progress for {entity}; pass resume to continue it")]
    MigrationInProgress {
        /// Entity with an in-progress ledger.
        entity: String,
    },

    /// The entity table does not exist.
    #[error("entity not found: {entity}")]
    EntityNotFound {
        /// Requested entity.
        entity: String,
    },

    /// Another executor holds the apply role for this entity.
    #[error("entity {entity} is locked by another executor")]
    EntityLocked {
        /// Locked entity.
        entity: String,
    },

    /// The run was cancelled at a batch or phase boundary.
    #[error("cancelled during phase {ordinal}")]
    Cancelled {
        /// Phase that was interrupted or about to start.
        ordinal: u32,
    },

    /// Store error outside of a phase action.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Ledger storage error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// Ordinal of the phase this error belongs to, if any.
    pub fn ordinal(&self) -> Option<u32> {
        match self {
            MigrationError::PreconditionFailed { ordinal, .. }
            | MigrationError::PostconditionFailed { ordinal, .. }
            | MigrationError::ConstraintViolation { ordinal, .. }
            | MigrationError::ActionFailed { ordinal, .. }
            | MigrationError::DestructiveRename { ordinal, .. }
            | MigrationError::Cancelled { ordinal } => Some(*ordinal),
            _ => None,
        }
    }

    /// Map a store error raised by a phase action.
    pub(crate) fn from_action(ordinal: u32, err: StoreError) -> Self {
        match err {
            StoreError::ConstraintViolation(reason) => {
                MigrationError::ConstraintViolation { ordinal, reason }
            }
            source => MigrationError::ActionFailed { ordinal, source },
        }
    }
}
