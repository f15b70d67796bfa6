//! Phase descriptors.

use serde::{Deserialize, Serialize};

use crate::condition::{Condition, KeyResolution};
use crate::store::{KeyGenerator, SchemaOp};

/// What a phase does, as a structural tag.
///
/// Renames are their own kind so a plan can be checked for drop/add pairs
/// standing in for a rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Introduce a column or relation.
    Add,
    /// Populate generated values.
    Backfill,
    /// Enforce uniqueness.
    Constrain,
    /// Copy references onto the new key.
    Repoint,
    /// Remove an old column or relation.
    Drop,
    /// Stop enforcing a reference.
    Relax,
    /// Make the new key the primary key.
    Promote,
    /// Rename in place.
    Rename,
    /// Re-enable enforcement or restore naming.
    Restore,
    /// Drop the retired key column.
    Cleanup,
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseKind::Add => write!(f, "ADD"),
            PhaseKind::Backfill => write!(f, "BACKFILL"),
            PhaseKind::Constrain => write!(f, "CONSTRAIN"),
            PhaseKind::Repoint => write!(f, "REPOINT"),
            PhaseKind::Drop => write!(f, "DROP"),
            PhaseKind::Relax => write!(f, "RELAX"),
            PhaseKind::Promote => write!(f, "PROMOTE"),
            PhaseKind::Rename => write!(f, "RENAME"),
            PhaseKind::Restore => write!(f, "RESTORE"),
            PhaseKind::Cleanup => write!(f, "CLEANUP"),
        }
    }
}

/// Data movement performed by the backfill copier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "copy", rename_all = "snake_case")]
pub enum CopySpec {
    /// Give every row lacking a value a freshly generated one.
    GenerateKeys {
        /// Entity table.
        table: String,
        /// New key column.
        column: String,
        /// Generator.
        generator: KeyGenerator,
    },
    /// Write the new-key reference next to each old reference.
    RepointReferences {
        /// Dependent table.
        table: String,
        /// Old reference column.
        old_column: String,
        /// New reference column.
        new_column: String,
        /// How an old reference maps to the new key.
        resolve: KeyResolution,
    },
    /// Copy pairings from one join table to another.
    CopyPairings {
        /// Source join table.
        source: String,
        /// Target join table.
        target: String,
        /// Owner-side column (same name on both sides).
        owner_column: String,
        /// Entity-side column (same name on both sides).
        entity_column: String,
        /// Maps the source entity value to the target's, if keys differ.
        resolve: Option<KeyResolution>,
    },
}

impl CopySpec {
    /// Table scanned by the copier; the cursor refers to its row ids.
    pub fn source_table(&self) -> &str {
        match self {
            CopySpec::GenerateKeys { table, .. } => table,
            CopySpec::RepointReferences { table, .. } => table,
            CopySpec::CopyPairings { source, .. } => source,
        }
    }

    /// Table written by the copier.
    pub fn target_table(&self) -> &str {
        match self {
            CopySpec::GenerateKeys { table, .. } => table,
            CopySpec::RepointReferences { table, .. } => table,
            CopySpec::CopyPairings { target, .. } => target,
        }
    }

    /// Condition that holds once the copy is complete.
    pub fn completion(&self) -> Condition {
        match self {
            CopySpec::GenerateKeys { table, column, .. } => Condition::NoMissingValues {
                table: table.clone(),
                column: column.clone(),
            },
            CopySpec::RepointReferences { table, old_column, new_column, .. } => {
                Condition::ReferencesResolved {
                    table: table.clone(),
                    old_column: old_column.clone(),
                    new_column: new_column.clone(),
                }
            }
            CopySpec::CopyPairings {
                source,
                target,
                owner_column,
                entity_column,
                resolve,
            } => Condition::PairingsCovered {
                source: source.clone(),
                target: target.clone(),
                owner_column: owner_column.clone(),
                entity_column: entity_column.clone(),
                resolve: resolve.clone(),
            },
        }
    }
}

/// Forward action of a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "spec", rename_all = "snake_case")]
pub enum PhaseAction {
    /// One atomic DDL operation.
    Schema(SchemaOp),
    /// Batched data copy.
    Copy(CopySpec),
}

/// One atomic, ordered, checked transformation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// 1-based position in the plan.
    pub ordinal: u32,
    /// Structural kind.
    pub kind: PhaseKind,
    /// What the phase touches, e.g. `book.author`.
    pub target: String,
    /// Forward action.
    pub action: PhaseAction,
    /// Must hold before the action runs.
    pub preconditions: Vec<Condition>,
    /// Must hold after the action commits.
    pub postconditions: Vec<Condition>,
    /// Whether the action can be mechanically undone.
    pub reversible: bool,
    /// Idempotent copy re-run right before a destructive drop.
    pub gap_fill: Option<CopySpec>,
}

impl Phase {
    /// One-line summary for logs and listings.
    pub fn summary(&self) -> String {
        match &self.action {
            PhaseAction::Schema(op) => op.to_string(),
            PhaseAction::Copy(spec) => match spec {
                CopySpec::GenerateKeys { table, column, .. } => {
                    format!("GENERATE {}.{}", table, column)
                }
                CopySpec::RepointReferences { table, old_column, new_column, .. } => {
                    format!("COPY {}.{} -> {}", table, old_column, new_column)
                }
                CopySpec::CopyPairings { source, target, .. } => {
                    format!("COPY PAIRINGS {} -> {}", source, target)
                }
            },
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {} {}", self.ordinal, self.kind, self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_completion_condition() {
        let spec = CopySpec::RepointReferences {
            table: "book".to_string(),
            old_column: "author".to_string(),
            new_column: "author_new".to_string(),
            resolve: KeyResolution {
                table: "author".to_string(),
                from_column: "id".to_string(),
                to_column: "uuid".to_string(),
            },
        };
        assert_eq!(spec.source_table(), "book");
        assert!(matches!(
            spec.completion(),
            Condition::ReferencesResolved { ref new_column, .. } if new_column == "author_new"
        ));
    }

    #[test]
    fn test_phase_display() {
        let phase = Phase {
            ordinal: 9,
            kind: PhaseKind::Rename,
            target: "book.author".to_string(),
            action: PhaseAction::Schema(SchemaOp::RenameColumn {
                table: "book".to_string(),
                from: "author_new".to_string(),
                to: "author".to_string(),
            }),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            reversible: true,
            gap_fill: None,
        };
        assert_eq!(phase.to_string(), "#9 RENAME RENAME COLUMN book.author_new TO author");
    }
}
