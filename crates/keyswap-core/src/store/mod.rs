//! Live store seam.
//!
//! The migration core never speaks a SQL dialect. It drives the live database
//! through two narrow traits:
//!
//! - [`SchemaReflector`] reports tables, columns, keys, and constraints.
//! - [`LiveStore`] executes one [`SchemaOp`] at a time and moves rows in
//!   independently committed batches.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and by the
//! rehearsal CLI.

pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use memory::{MemoryStore, Snapshot};

/// Store-assigned row identifier. Monotonic per table, used as the backfill cursor.
pub type RowId = u64;

/// A column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Integer value (legacy keys are usually these).
    Int(i64),
    /// Text value (generated UUID keys are stored in text form).
    Text(String),
}

static NULL: Value = Value::Null;

impl Value {
    /// Check if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Generator for new key values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyGenerator {
    /// Random version 4 UUID, stored as text.
    UuidV4,
}

impl KeyGenerator {
    /// Produce a fresh value.
    pub fn generate(&self) -> Value {
        match self {
            KeyGenerator::UuidV4 => Value::Text(uuid::Uuid::new_v4().to_string()),
        }
    }
}

/// A row read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Row identifier.
    pub id: RowId,
    /// Column values. Absent columns read as NULL.
    pub values: BTreeMap<String, Value>,
}

impl Row {
    /// Get a column value, NULL when absent.
    pub fn get(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&NULL)
    }
}

/// What a table is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableRole {
    /// Ordinary entity table.
    #[default]
    Regular,
    /// Join table managed implicitly by a many-to-many declaration.
    AutoJoin,
    /// Explicit join entity mediating a many-to-many relation.
    Through,
}

impl std::fmt::Display for TableRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableRole::Regular => write!(f, "regular"),
            TableRole::AutoJoin => write!(f, "auto_join"),
            TableRole::Through => write!(f, "through"),
        }
    }
}

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Whether NULL is allowed.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Standalone uniqueness constraint.
    #[serde(default)]
    pub unique: bool,
    /// Value generator applied to inserts that omit this column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<KeyGenerator>,
}

fn default_true() -> bool {
    true
}

impl ColumnDef {
    /// Create a nullable column.
    pub fn nullable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: true,
            unique: false,
            default: None,
        }
    }

    /// Create a NOT NULL column.
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            nullable: false,
            ..Self::nullable(name)
        }
    }

    /// Set a generator default.
    pub fn with_default(mut self, generator: KeyGenerator) -> Self {
        self.default = Some(generator);
        self
    }

    /// Mark unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Foreign-key constraint definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub ref_table: String,
    /// Referenced column (primary key or unique).
    pub ref_column: String,
    /// Whether the store checks referencing values.
    #[serde(default = "default_true")]
    pub enforced: bool,
    /// Reverse accessor name exposed on the referenced side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_name: Option<String>,
}

impl ForeignKeyDef {
    /// Create an enforced foreign key.
    pub fn new(
        column: impl Into<String>,
        ref_table: impl Into<String>,
        ref_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            ref_table: ref_table.into(),
            ref_column: ref_column.into(),
            enforced: true,
            related_name: None,
        }
    }

    /// Set the related name.
    pub fn with_related_name(mut self, related_name: impl Into<String>) -> Self {
        self.related_name = Some(related_name.into());
        self
    }
}

/// Table definition for [`SchemaOp::CreateTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Table role.
    #[serde(default)]
    pub role: TableRole,
    /// Primary-key column. Join tables are keyed by row id only.
    pub primary_key: Option<String>,
    /// Columns.
    pub columns: Vec<ColumnDef>,
    /// Foreign keys.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl TableDef {
    /// Create a regular table keyed by `primary_key`.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        let primary_key = primary_key.into();
        Self {
            name: name.into(),
            role: TableRole::Regular,
            columns: vec![ColumnDef::required(primary_key.clone())],
            primary_key: Some(primary_key),
            foreign_keys: Vec::new(),
        }
    }

    /// Create a join table holding two references.
    pub fn join(name: impl Into<String>, role: TableRole, left: ForeignKeyDef, right: ForeignKeyDef) -> Self {
        Self {
            name: name.into(),
            role,
            primary_key: None,
            columns: vec![
                ColumnDef::required(left.column.clone()),
                ColumnDef::required(right.column.clone()),
            ],
            foreign_keys: vec![left, right],
        }
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a foreign-key column.
    pub fn with_foreign_key(mut self, column: ColumnDef, foreign_key: ForeignKeyDef) -> Self {
        self.columns.push(column);
        self.foreign_keys.push(foreign_key);
        self
    }
}

/// Reflected state of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    /// Table name.
    pub name: String,
    /// Table role.
    pub role: TableRole,
    /// Primary-key column.
    pub primary_key: Option<String>,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Foreign keys declared on this table.
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl TableDescription {
    /// Look up a column.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up the foreign key declared on a column.
    pub fn foreign_key(&self, column: &str) -> Option<&ForeignKeyDef> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }

    /// Whether a column is the primary key or carries a unique constraint.
    pub fn is_unique(&self, column: &str) -> bool {
        self.primary_key.as_deref() == Some(column)
            || self.column(column).map(|c| c.unique).unwrap_or(false)
    }
}

/// A single DDL operation. Each one is atomic in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaOp {
    /// Create a table.
    CreateTable(TableDef),
    /// Drop a table.
    DropTable {
        /// Table to drop.
        table: String,
    },
    /// Rename a table, carrying referencing foreign keys along.
    RenameTable {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Add a column, optionally with its foreign key.
    AddColumn {
        /// Target table.
        table: String,
        /// Column definition.
        column: ColumnDef,
        /// Foreign key declared together with the column.
        foreign_key: Option<ForeignKeyDef>,
    },
    /// Drop a column and any foreign key declared on it.
    DropColumn {
        /// Target table.
        table: String,
        /// Column to drop.
        column: String,
    },
    /// Rename a column in place.
    RenameColumn {
        /// Target table.
        table: String,
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Enforce uniqueness and NOT NULL on a column.
    AddUnique {
        /// Target table.
        table: String,
        /// Column.
        column: String,
    },
    /// Make a unique column the primary key, demoting the previous one.
    SetPrimaryKey {
        /// Target table.
        table: String,
        /// New primary-key column.
        column: String,
    },
    /// Turn enforcement of an existing foreign key on or off.
    SetForeignKeyEnforced {
        /// Referencing table.
        table: String,
        /// Referencing column.
        column: String,
        /// Desired enforcement.
        enforced: bool,
    },
    /// Allow or forbid NULL in an existing column.
    SetNullable {
        /// Target table.
        table: String,
        /// Column.
        column: String,
        /// Whether NULL is allowed.
        nullable: bool,
    },
    /// Set the related name of an existing foreign key.
    SetRelatedName {
        /// Referencing table.
        table: String,
        /// Referencing column.
        column: String,
        /// Related name.
        related_name: Option<String>,
    },
}

impl std::fmt::Display for SchemaOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaOp::CreateTable(def) => write!(f, "CREATE TABLE {} ({})", def.name, def.role),
            SchemaOp::DropTable { table } => write!(f, "DROP TABLE {}", table),
            SchemaOp::RenameTable { from, to } => write!(f, "RENAME TABLE {} TO {}", from, to),
            SchemaOp::AddColumn { table, column, foreign_key } => {
                write!(f, "ADD COLUMN {}.{}", table, column.name)?;
                if let Some(fk) = foreign_key {
                    write!(f, " REFERENCES {}.{}", fk.ref_table, fk.ref_column)?;
                }
                Ok(())
            }
            SchemaOp::DropColumn { table, column } => write!(f, "DROP COLUMN {}.{}", table, column),
            SchemaOp::RenameColumn { table, from, to } => {
                write!(f, "RENAME COLUMN {}.{} TO {}", table, from, to)
            }
            SchemaOp::AddUnique { table, column } => write!(f, "ADD UNIQUE {}.{}", table, column),
            SchemaOp::SetPrimaryKey { table, column } => {
                write!(f, "SET PRIMARY KEY {}.{}", table, column)
            }
            SchemaOp::SetForeignKeyEnforced { table, column, enforced } => {
                let mode = if *enforced { "ENFORCE" } else { "RELAX" };
                write!(f, "{} FOREIGN KEY {}.{}", mode, table, column)
            }
            SchemaOp::SetNullable { table, column, nullable } => {
                let mode = if *nullable { "DROP" } else { "SET" };
                write!(f, "{} NOT NULL {}.{}", mode, table, column)
            }
            SchemaOp::SetRelatedName { table, column, related_name } => write!(
                f,
                "SET RELATED NAME {}.{} = {}",
                table,
                column,
                related_name.as_deref().unwrap_or("-")
            ),
        }
    }
}

/// Row filter for [`LiveStore::count`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountFilter {
    /// Columns that must be non-NULL.
    pub present: Vec<String>,
    /// Columns that must be NULL.
    pub missing: Vec<String>,
}

impl CountFilter {
    /// Count every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Rows where `column` is non-NULL.
    pub fn present(column: impl Into<String>) -> Self {
        Self {
            present: vec![column.into()],
            missing: Vec::new(),
        }
    }

    /// Rows where `column` is NULL.
    pub fn missing(column: impl Into<String>) -> Self {
        Self {
            present: Vec::new(),
            missing: vec![column.into()],
        }
    }

    /// Also require `column` to be NULL.
    pub fn and_missing(mut self, column: impl Into<String>) -> Self {
        self.missing.push(column.into());
        self
    }
}

/// A row mutation inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    /// Set a column only if it is currently NULL.
    Fill {
        /// Row to update.
        row: RowId,
        /// Column to fill.
        column: String,
        /// Value to write.
        value: Value,
    },
    /// Set a column unconditionally.
    Update {
        /// Row to update.
        row: RowId,
        /// Column to set.
        column: String,
        /// Value to write.
        value: Value,
    },
    /// Insert a row unless an identical one exists (set semantics).
    InsertIfAbsent {
        /// Column values.
        values: BTreeMap<String, Value>,
    },
}

/// Schema introspection, consumed by the plan builder and the condition checks.
pub trait SchemaReflector: Send + Sync {
    /// List table names in a stable order.
    fn tables(&self) -> Result<Vec<String>, StoreError>;

    /// Describe a table, `None` if absent.
    fn describe(&self, table: &str) -> Result<Option<TableDescription>, StoreError>;
}

/// DDL/DML execution against the live store.
pub trait LiveStore: SchemaReflector {
    /// Execute one DDL operation atomically.
    fn execute(&self, op: &SchemaOp) -> Result<(), StoreError>;

    /// Read up to `limit` rows with id greater than `after`, in id order.
    fn scan(&self, table: &str, after: Option<RowId>, limit: usize) -> Result<Vec<Row>, StoreError>;

    /// Find the row whose `column` equals `value`.
    fn lookup(&self, table: &str, column: &str, value: &Value) -> Result<Option<Row>, StoreError>;

    /// Whether a row with exactly these column values exists.
    fn contains(&self, table: &str, values: &BTreeMap<String, Value>) -> Result<bool, StoreError>;

    /// Count rows matching a filter.
    fn count(&self, table: &str, filter: &CountFilter) -> Result<u64, StoreError>;

    /// Apply a batch of writes as one commit. Returns the number of rows changed.
    fn commit(&self, table: &str, writes: Vec<RowWrite>) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_json_is_untagged() {
        let row: BTreeMap<String, Value> =
            serde_json::from_str(r#"{"id": 7, "name": "Ada", "note": null}"#).unwrap();
        assert_eq!(row["id"], Value::Int(7));
        assert_eq!(row["name"], Value::from("Ada"));
        assert!(row["note"].is_null());
    }

    #[test]
    fn test_uuid_generator_produces_distinct_text() {
        let a = KeyGenerator::UuidV4.generate();
        let b = KeyGenerator::UuidV4.generate();
        assert!(matches!(a, Value::Text(ref s) if s.len() == 36));
        assert_ne!(a, b);
    }

    #[test]
    fn test_description_uniqueness() {
        let desc = TableDescription {
            name: "author".to_string(),
            role: TableRole::Regular,
            primary_key: Some("id".to_string()),
            columns: vec![
                ColumnDef::required("id"),
                ColumnDef::nullable("uuid").unique(),
                ColumnDef::nullable("name"),
            ],
            foreign_keys: Vec::new(),
        };
        assert!(desc.is_unique("id"));
        assert!(desc.is_unique("uuid"));
        assert!(!desc.is_unique("name"));
    }

    #[test]
    fn test_schema_op_display() {
        let op = SchemaOp::SetForeignKeyEnforced {
            table: "book".to_string(),
            column: "author_new".to_string(),
            enforced: false,
        };
        assert_eq!(op.to_string(), "RELAX FOREIGN KEY book.author_new");
    }
}
