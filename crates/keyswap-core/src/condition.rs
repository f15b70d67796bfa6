//! Phase pre- and postcondition predicates.
//!
//! Conditions are data, not closures: they are serialized into the plan (and
//! therefore into its checksum) and evaluated against the live store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::{CountFilter, LiveStore, RowId, SchemaReflector, TableRole, Value};

/// Rows scanned per round while checking pairing coverage.
const COVERAGE_SCAN_BATCH: usize = 1000;

/// Maps a value of one entity column to the same row's value in another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyResolution {
    /// Entity table.
    pub table: String,
    /// Column the source value is matched against.
    pub from_column: String,
    /// Column whose value is written.
    pub to_column: String,
}

impl KeyResolution {
    /// Resolve `value` through the entity table.
    pub fn resolve(&self, store: &dyn LiveStore, value: &Value) -> Result<Option<Value>, StoreError> {
        if value.is_null() {
            return Ok(None);
        }
        Ok(store
            .lookup(&self.table, &self.from_column, value)?
            .map(|row| row.get(&self.to_column).clone())
            .filter(|v| !v.is_null()))
    }
}

/// A checkable predicate over live schema and data state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Condition {
    /// Table exists.
    TableExists { table: String },
    /// Table does not exist.
    TableAbsent { table: String },
    /// Table has the given role.
    TableRoleIs { table: String, role: TableRole },
    /// Column exists.
    ColumnExists { table: String, column: String },
    /// Column does not exist.
    ColumnAbsent { table: String, column: String },
    /// Column exists and is declared NOT NULL.
    ColumnRequired { table: String, column: String },
    /// Every row has a non-NULL value in the column.
    NoMissingValues { table: String, column: String },
    /// Column is the primary key or carries a unique constraint.
    UniqueEnforced { table: String, column: String },
    /// Column is the primary key.
    PrimaryKeyIs { table: String, column: String },
    /// Every row with an old reference also has a new one.
    ReferencesResolved {
        table: String,
        old_column: String,
        new_column: String,
    },
    /// Every pairing in `source` has its counterpart in `target`.
    PairingsCovered {
        source: String,
        target: String,
        owner_column: String,
        entity_column: String,
        resolve: Option<KeyResolution>,
    },
    /// Foreign key exists, is enforced, and points at the given column.
    ForeignKeyEnforced {
        table: String,
        column: String,
        ref_table: String,
        ref_column: String,
    },
    /// Foreign key exists and is not enforced.
    ForeignKeyRelaxed { table: String, column: String },
    /// Foreign key carries the given related name.
    RelatedNameIs {
        table: String,
        column: String,
        related_name: Option<String>,
    },
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::TableExists { table } => write!(f, "table {} exists", table),
            Condition::TableAbsent { table } => write!(f, "table {} is absent", table),
            Condition::TableRoleIs { table, role } => write!(f, "table {} is {}", table, role),
            Condition::ColumnExists { table, column } => write!(f, "{}.{} exists", table, column),
            Condition::ColumnAbsent { table, column } => write!(f, "{}.{} is absent", table, column),
            Condition::ColumnRequired { table, column } => {
                write!(f, "{}.{} is NOT NULL", table, column)
            }
            Condition::NoMissingValues { table, column } => {
                write!(f, "every {}.{} has a value", table, column)
            }
            Condition::UniqueEnforced { table, column } => write!(f, "{}.{} is unique", table, column),
            Condition::PrimaryKeyIs { table, column } => {
                write!(f, "{}.{} is the primary key", table, column)
            }
            Condition::ReferencesResolved { table, old_column, new_column } => write!(
                f,
                "every {}.{} reference has a {} counterpart",
                table, old_column, new_column
            ),
            Condition::PairingsCovered { source, target, .. } => {
                write!(f, "every pairing of {} is present in {}", source, target)
            }
            Condition::ForeignKeyEnforced { table, column, ref_table, ref_column } => write!(
                f,
                "{}.{} enforces a reference to {}.{}",
                table, column, ref_table, ref_column
            ),
            Condition::ForeignKeyRelaxed { table, column } => {
                write!(f, "{}.{} reference is relaxed", table, column)
            }
            Condition::RelatedNameIs { table, column, related_name } => write!(
                f,
                "{}.{} related name is {}",
                table,
                column,
                related_name.as_deref().unwrap_or("-")
            ),
        }
    }
}

impl Condition {
    /// Whether the condition reads schema only.
    ///
    /// Data conditions can be invalidated by ordinary application writes after
    /// the phase that established them, so they are not used to detect ledger
    /// drift.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            Condition::NoMissingValues { .. }
                | Condition::ReferencesResolved { .. }
                | Condition::PairingsCovered { .. }
        )
    }

    /// Evaluate against the store. Returns `Some(reason)` when unmet.
    ///
    /// Missing tables or columns make data conditions unmet rather than failing.
    pub fn check(&self, store: &dyn LiveStore) -> Result<Option<String>, StoreError> {
        match self.evaluate(store) {
            Ok(true) => Ok(None),
            Ok(false) => Ok(Some(format!("expected {}", self))),
            Err(StoreError::NotFound(what)) => Ok(Some(format!("expected {} ({} not found)", self, what))),
            Err(e) => Err(e),
        }
    }

    fn evaluate(&self, store: &dyn LiveStore) -> Result<bool, StoreError> {
        match self {
            Condition::TableExists { table } => Ok(store.describe(table)?.is_some()),
            Condition::TableAbsent { table } => Ok(store.describe(table)?.is_none()),
            Condition::TableRoleIs { table, role } => {
                Ok(store.describe(table)?.map(|d| d.role == *role).unwrap_or(false))
            }
            Condition::ColumnExists { table, column } => Ok(store
                .describe(table)?
                .map(|d| d.column(column).is_some())
                .unwrap_or(false)),
            Condition::ColumnAbsent { table, column } => Ok(store
                .describe(table)?
                .map(|d| d.column(column).is_none())
                .unwrap_or(true)),
            Condition::ColumnRequired { table, column } => Ok(store
                .describe(table)?
                .and_then(|d| d.column(column).map(|c| !c.nullable))
                .unwrap_or(false)),
            Condition::NoMissingValues { table, column } => {
                Ok(store.count(table, &CountFilter::missing(column.clone()))? == 0)
            }
            Condition::UniqueEnforced { table, column } => Ok(store
                .describe(table)?
                .map(|d| d.is_unique(column))
                .unwrap_or(false)),
            Condition::PrimaryKeyIs { table, column } => Ok(store
                .describe(table)?
                .map(|d| d.primary_key.as_deref() == Some(column.as_str()))
                .unwrap_or(false)),
            Condition::ReferencesResolved { table, old_column, new_column } => {
                let filter = CountFilter::present(old_column.clone()).and_missing(new_column.clone());
                Ok(store.count(table, &filter)? == 0)
            }
            Condition::PairingsCovered {
                source,
                target,
                owner_column,
                entity_column,
                resolve,
            } => pairings_covered(
                store,
                source,
                target,
                owner_column,
                entity_column,
                resolve.as_ref(),
            ),
            Condition::ForeignKeyEnforced { table, column, ref_table, ref_column } => Ok(store
                .describe(table)?
                .and_then(|d| d.foreign_key(column).cloned())
                .map(|fk| fk.enforced && &fk.ref_table == ref_table && &fk.ref_column == ref_column)
                .unwrap_or(false)),
            Condition::ForeignKeyRelaxed { table, column } => Ok(store
                .describe(table)?
                .and_then(|d| d.foreign_key(column).cloned())
                .map(|fk| !fk.enforced)
                .unwrap_or(false)),
            Condition::RelatedNameIs { table, column, related_name } => Ok(store
                .describe(table)?
                .and_then(|d| d.foreign_key(column).cloned())
                .map(|fk| &fk.related_name == related_name)
                .unwrap_or(false)),
        }
    }
}

fn pairings_covered(
    store: &dyn LiveStore,
    source: &str,
    target: &str,
    owner_column: &str,
    entity_column: &str,
    resolve: Option<&KeyResolution>,
) -> Result<bool, StoreError> {
    let mut cursor: Option<RowId> = None;
    loop {
        let rows = store.scan(source, cursor, COVERAGE_SCAN_BATCH)?;
        let Some(last) = rows.last() else {
            return Ok(true);
        };
        cursor = Some(last.id);

        for row in &rows {
            let entity_value = match resolve {
                Some(resolution) => match resolution.resolve(store, row.get(entity_column))? {
                    Some(v) => v,
                    None => return Ok(false),
                },
                None => row.get(entity_column).clone(),
            };
            let pairing: BTreeMap<String, Value> = [
                (owner_column.to_string(), row.get(owner_column).clone()),
                (entity_column.to_string(), entity_value),
            ]
            .into_iter()
            .collect();
            if !store.contains(target, &pairing)? {
                return Ok(false);
            }
        }
    }
}

/// First unmet condition, if any.
pub fn first_unmet(
    store: &dyn LiveStore,
    conditions: &[Condition],
) -> Result<Option<String>, StoreError> {
    for condition in conditions {
        if let Some(reason) = condition.check(store)? {
            return Ok(Some(reason));
        }
    }
    Ok(None)
}

/// First unmet structural condition, if any.
pub fn first_unmet_structural(
    store: &dyn LiveStore,
    conditions: &[Condition],
) -> Result<Option<String>, StoreError> {
    for condition in conditions.iter().filter(|c| c.is_structural()) {
        if let Some(reason) = condition.check(store)? {
            return Ok(Some(reason));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ColumnDef, ForeignKeyDef, MemoryStore, SchemaOp, TableDef};

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_table(TableDef::new("author", "id").with_column(ColumnDef::nullable("uuid")))
            .unwrap();
        store.insert("author", [("id", Value::Int(1)), ("uuid", "a".into())]).unwrap();
        store.insert("author", [("id", Value::Int(2))]).unwrap();
        store
    }

    #[test]
    fn test_missing_values_reported() {
        let store = store();
        let cond = Condition::NoMissingValues {
            table: "author".to_string(),
            column: "uuid".to_string(),
        };
        let reason = cond.check(&store).unwrap().unwrap();
        assert!(reason.contains("author.uuid"));

        store.update("author", 2, "uuid", "b".into()).unwrap();
        assert!(cond.check(&store).unwrap().is_none());
    }

    #[test]
    fn test_column_required_follows_declaration() {
        let store = store();
        let cond = Condition::ColumnRequired {
            table: "author".to_string(),
            column: "uuid".to_string(),
        };
        assert!(cond.is_structural());
        assert!(cond.check(&store).unwrap().is_some());

        store.update("author", 2, "uuid", "b".into()).unwrap();
        store
            .execute(&SchemaOp::SetNullable {
                table: "author".to_string(),
                column: "uuid".to_string(),
                nullable: false,
            })
            .unwrap();
        assert!(cond.check(&store).unwrap().is_none());
    }

    #[test]
    fn test_missing_column_is_unmet_not_error() {
        let store = store();
        let cond = Condition::NoMissingValues {
            table: "author".to_string(),
            column: "code".to_string(),
        };
        assert!(cond.check(&store).unwrap().is_some());
    }

    #[test]
    fn test_pairings_covered_with_resolution() {
        let store = store();
        store.update("author", 2, "uuid", "b".into()).unwrap();
        store.create_table(TableDef::new("club", "id")).unwrap();
        store.insert("club", [("id", Value::Int(7))]).unwrap();
        store
            .execute(&SchemaOp::CreateTable(TableDef::join(
                "members",
                TableRole::AutoJoin,
                ForeignKeyDef::new("club_id", "club", "id"),
                ForeignKeyDef::new("author_id", "author", "id"),
            )))
            .unwrap();
        store
            .create_table(TableDef {
                name: "members_copy".to_string(),
                role: TableRole::Through,
                primary_key: None,
                columns: vec![ColumnDef::required("club_id"), ColumnDef::required("author_id")],
                foreign_keys: Vec::new(),
            })
            .unwrap();
        store.insert("members", [("club_id", Value::Int(7)), ("author_id", Value::Int(2))]).unwrap();

        let cond = Condition::PairingsCovered {
            source: "members".to_string(),
            target: "members_copy".to_string(),
            owner_column: "club_id".to_string(),
            entity_column: "author_id".to_string(),
            resolve: Some(KeyResolution {
                table: "author".to_string(),
                from_column: "id".to_string(),
                to_column: "uuid".to_string(),
            }),
        };
        assert!(cond.check(&store).unwrap().is_some());

        store
            .insert("members_copy", [("club_id", Value::Int(7)), ("author_id", "b".into())])
            .unwrap();
        assert!(cond.check(&store).unwrap().is_none());
    }
}
