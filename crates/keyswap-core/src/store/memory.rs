//! In-memory relational store.
//!
//! Implements [`LiveStore`] with the constraint behavior a real database
//! shows during a key swap:
//!
//! - unique and NOT NULL checks on every write
//! - enforced foreign keys are validated on write, on creation, and when
//!   enforcement is turned back on
//! - a unique constraint cannot be folded into a primary key while an enforced
//!   foreign key still references it
//! - a referenced column or table cannot be dropped
//! - renames carry referencing foreign keys along
//!
//! Each batch commit is atomic: a failing write rolls back the batch.
//! Primary-key and unique columns keep a value index, so uniqueness checks,
//! reference checks, and key lookups do not scan the table.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{
    ColumnDef, CountFilter, ForeignKeyDef, LiveStore, Row, RowId, RowWrite, SchemaOp,
    SchemaReflector, TableDef, TableDescription, TableRole, Value,
};
use crate::error::StoreError;

/// Persisted state of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableState {
    /// Table role.
    #[serde(default)]
    pub role: TableRole,
    /// Primary-key column.
    #[serde(default)]
    pub primary_key: Option<String>,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Foreign keys declared on this table.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
    /// Rows by id.
    #[serde(default)]
    pub rows: BTreeMap<RowId, BTreeMap<String, Value>>,
    /// Next row id to assign.
    #[serde(default)]
    pub next_row_id: RowId,
    /// Row id by value for each primary-key and unique column.
    #[serde(skip)]
    index: BTreeMap<String, BTreeMap<Value, RowId>>,
}

impl TableState {
    fn from_def(def: TableDef) -> Self {
        Self {
            role: def.role,
            primary_key: def.primary_key,
            columns: def.columns,
            foreign_keys: def.foreign_keys,
            rows: BTreeMap::new(),
            next_row_id: 1,
            index: BTreeMap::new(),
        }
    }

    fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn column_mut(&mut self, name: &str) -> Option<&mut ColumnDef> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    fn foreign_key(&self, column: &str) -> Option<&ForeignKeyDef> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }

    fn is_key(&self, column: &str) -> bool {
        self.primary_key.as_deref() == Some(column)
            || self.column(column).map(|c| c.unique).unwrap_or(false)
    }

    /// Rebuild the value index after a schema change.
    fn reindex(&mut self) {
        let keys: Vec<String> = self
            .columns
            .iter()
            .filter(|c| self.is_key(&c.name))
            .map(|c| c.name.clone())
            .collect();
        let mut index = BTreeMap::new();
        for column in keys {
            let values: BTreeMap<Value, RowId> = self
                .rows
                .iter()
                .filter_map(|(id, row)| {
                    row.get(&column)
                        .filter(|v| !v.is_null())
                        .map(|v| (v.clone(), *id))
                })
                .collect();
            index.insert(column, values);
        }
        self.index = index;
    }

    /// Move one row's entry in a column index from `previous` to `current`.
    fn reindex_value(
        &mut self,
        row: RowId,
        column: &str,
        previous: Option<&Value>,
        current: Option<&Value>,
    ) {
        let Some(values) = self.index.get_mut(column) else {
            return;
        };
        if let Some(previous) = previous {
            if values.get(previous) == Some(&row) {
                values.remove(previous);
            }
        }
        if let Some(current) = current.filter(|v| !v.is_null()) {
            values.insert(current.clone(), row);
        }
    }

    fn unindex_row(&mut self, row: RowId) {
        let Some(values) = self.rows.get(&row).cloned() else {
            return;
        };
        for (column, value) in &values {
            self.reindex_value(row, column, Some(value), None);
        }
    }

    fn index_row(&mut self, row: RowId) {
        let Some(values) = self.rows.get(&row).cloned() else {
            return;
        };
        for (column, value) in &values {
            self.reindex_value(row, column, None, Some(value));
        }
    }

    /// Row holding `value` in `column`. Indexed columns answer without a scan.
    fn find_row(&self, column: &str, value: &Value) -> Option<RowId> {
        if !value.is_null() {
            if let Some(values) = self.index.get(column) {
                return values.get(value).copied();
            }
        }
        self.rows
            .iter()
            .find(|(_, row)| TableState::value(row, column) == value)
            .map(|(id, _)| *id)
    }

    fn has_value(&self, column: &str, value: &Value, except: Option<RowId>) -> bool {
        if let Some(values) = self.index.get(column) {
            return values.get(value).is_some_and(|id| Some(*id) != except);
        }
        self.rows
            .iter()
            .any(|(id, row)| Some(*id) != except && row.get(column) == Some(value))
    }

    fn value<'a>(row: &'a BTreeMap<String, Value>, column: &str) -> &'a Value {
        static NULL: Value = Value::Null;
        row.get(column).unwrap_or(&NULL)
    }

    fn describe(&self, name: &str) -> TableDescription {
        TableDescription {
            name: name.to_string(),
            role: self.role,
            primary_key: self.primary_key.clone(),
            columns: self.columns.clone(),
            foreign_keys: self.foreign_keys.clone(),
        }
    }
}

/// Serializable image of the whole database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Tables by name.
    pub tables: BTreeMap<String, TableState>,
}

enum Undo {
    Restore {
        row: RowId,
        column: String,
        previous: Option<Value>,
    },
    Remove {
        row: RowId,
    },
}

impl Snapshot {
    fn table(&self, name: &str) -> Result<&TableState, StoreError> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("table {}", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableState, StoreError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("table {}", name)))
    }

    fn require_column(&self, table: &str, column: &str) -> Result<&ColumnDef, StoreError> {
        self.table(table)?
            .column(column)
            .ok_or_else(|| StoreError::NotFound(format!("column {}.{}", table, column)))
    }

    fn normalize(&mut self) {
        for table in self.tables.values_mut() {
            let floor = table.rows.keys().next_back().map(|id| id + 1).unwrap_or(1);
            table.next_row_id = table.next_row_id.max(floor);
            table.reindex();
        }
    }

    /// Foreign keys anywhere in the database that reference `table.column`.
    fn referencing(&self, table: &str, column: &str) -> Vec<(String, ForeignKeyDef)> {
        self.tables
            .iter()
            .flat_map(|(name, state)| {
                state
                    .foreign_keys
                    .iter()
                    .filter(|fk| fk.ref_table == table && fk.ref_column == column)
                    .map(move |fk| (name.clone(), fk.clone()))
            })
            .collect()
    }

    fn resolves(&self, fk: &ForeignKeyDef, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        self.tables
            .get(&fk.ref_table)
            .map(|t| t.has_value(&fk.ref_column, value, None))
            .unwrap_or(false)
    }

    fn require_key_target(&self, fk: &ForeignKeyDef) -> Result<(), StoreError> {
        let target = self.table(&fk.ref_table)?;
        if !target.is_key(&fk.ref_column) {
            return Err(StoreError::Invalid(format!(
                "{}.{} is neither primary key nor unique",
                fk.ref_table, fk.ref_column
            )));
        }
        Ok(())
    }

    fn check_value(
        &self,
        table: &str,
        column: &str,
        value: &Value,
        row: Option<RowId>,
    ) -> Result<(), StoreError> {
        let state = self.table(table)?;
        let def = state
            .column(column)
            .ok_or_else(|| StoreError::NotFound(format!("column {}.{}", table, column)))?;

        if value.is_null() {
            if !def.nullable {
                return Err(StoreError::ConstraintViolation(format!(
                    "{}.{} is NOT NULL",
                    table, column
                )));
            }
            return Ok(());
        }

        if state.is_key(column) && state.has_value(column, value, row) {
            return Err(StoreError::ConstraintViolation(format!(
                "duplicate value {} in {}.{}",
                value, table, column
            )));
        }

        if let Some(fk) = state.foreign_key(column) {
            if fk.enforced && !self.resolves(fk, value) {
                return Err(StoreError::ConstraintViolation(format!(
                    "{}.{} = {} does not reference a row in {}.{}",
                    table, column, value, fk.ref_table, fk.ref_column
                )));
            }
        }

        Ok(())
    }

    fn check_all_resolve(&self, table: &str, fk: &ForeignKeyDef) -> Result<(), StoreError> {
        let state = self.table(table)?;
        for (id, row) in &state.rows {
            let value = TableState::value(row, &fk.column);
            if !self.resolves(fk, value) {
                return Err(StoreError::ConstraintViolation(format!(
                    "{}.{} row {} = {} does not reference a row in {}.{}",
                    table, fk.column, id, value, fk.ref_table, fk.ref_column
                )));
            }
        }
        Ok(())
    }

    fn insert_row(
        &mut self,
        table: &str,
        mut values: BTreeMap<String, Value>,
    ) -> Result<RowId, StoreError> {
        let state = self.table(table)?;
        for column in values.keys() {
            if state.column(column).is_none() {
                return Err(StoreError::NotFound(format!("column {}.{}", table, column)));
            }
        }
        for column in &state.columns {
            if !values.contains_key(&column.name) {
                if let Some(generator) = column.default {
                    values.insert(column.name.clone(), generator.generate());
                }
            }
        }
        let columns: Vec<String> = state.columns.iter().map(|c| c.name.clone()).collect();
        for column in &columns {
            let value = TableState::value(&values, column);
            self.check_value(table, column, value, None)?;
        }

        let state = self.table_mut(table)?;
        let id = state.next_row_id;
        state.next_row_id += 1;
        state.rows.insert(id, values);
        state.index_row(id);
        Ok(id)
    }

    fn set_value(
        &mut self,
        table: &str,
        row: RowId,
        column: &str,
        value: Value,
        only_if_null: bool,
        undo: &mut Vec<Undo>,
    ) -> Result<bool, StoreError> {
        let current = self
            .table(table)?
            .rows
            .get(&row)
            .ok_or_else(|| StoreError::NotFound(format!("row {} in {}", row, table)))?
            .get(column)
            .cloned();

        let current_is_null = current.as_ref().map(|v| v.is_null()).unwrap_or(true);
        if only_if_null && !current_is_null {
            return Ok(false);
        }
        if current.as_ref() == Some(&value) {
            return Ok(false);
        }

        self.check_value(table, column, &value, Some(row))?;
        let state = self.table_mut(table)?;
        if let Some(values) = state.rows.get_mut(&row) {
            values.insert(column.to_string(), value.clone());
        }
        state.reindex_value(row, column, current.as_ref(), Some(&value));
        undo.push(Undo::Restore {
            row,
            column: column.to_string(),
            previous: current,
        });
        Ok(true)
    }

    fn apply_write(
        &mut self,
        table: &str,
        write: RowWrite,
        undo: &mut Vec<Undo>,
    ) -> Result<bool, StoreError> {
        match write {
            RowWrite::Fill { row, column, value } => {
                self.set_value(table, row, &column, value, true, undo)
            }
            RowWrite::Update { row, column, value } => {
                self.set_value(table, row, &column, value, false, undo)
            }
            RowWrite::InsertIfAbsent { values } => {
                if self.contains(table, &values)? {
                    return Ok(false);
                }
                let row = self.insert_row(table, values)?;
                undo.push(Undo::Remove { row });
                Ok(true)
            }
        }
    }

    fn rollback(&mut self, table: &str, undo: Vec<Undo>) {
        let Some(state) = self.tables.get_mut(table) else {
            return;
        };
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Restore { row, column, previous } => {
                    let Some(values) = state.rows.get_mut(&row) else {
                        continue;
                    };
                    let current = match &previous {
                        Some(v) => values.insert(column.clone(), v.clone()),
                        None => values.remove(&column),
                    };
                    state.reindex_value(row, &column, current.as_ref(), previous.as_ref());
                }
                Undo::Remove { row } => {
                    state.unindex_row(row);
                    state.rows.remove(&row);
                }
            }
        }
    }

    fn contains(&self, table: &str, values: &BTreeMap<String, Value>) -> Result<bool, StoreError> {
        let state = self.table(table)?;
        Ok(state.rows.values().any(|row| {
            values
                .iter()
                .all(|(column, value)| TableState::value(row, column) == value)
        }))
    }

    fn execute(&mut self, op: &SchemaOp) -> Result<(), StoreError> {
        self.execute_op(op)?;
        let table = match op {
            SchemaOp::DropTable { .. } => return Ok(()),
            SchemaOp::CreateTable(def) => &def.name,
            SchemaOp::RenameTable { to, .. } => to,
            SchemaOp::AddColumn { table, .. }
            | SchemaOp::DropColumn { table, .. }
            | SchemaOp::RenameColumn { table, .. }
            | SchemaOp::AddUnique { table, .. }
            | SchemaOp::SetPrimaryKey { table, .. }
            | SchemaOp::SetForeignKeyEnforced { table, .. }
            | SchemaOp::SetNullable { table, .. }
            | SchemaOp::SetRelatedName { table, .. } => table,
        };
        if let Some(state) = self.tables.get_mut(table) {
            state.reindex();
        }
        Ok(())
    }

    fn execute_op(&mut self, op: &SchemaOp) -> Result<(), StoreError> {
        match op {
            SchemaOp::CreateTable(def) => self.create_table(def.clone()),
            SchemaOp::DropTable { table } => {
                self.table(table)?;
                let blocking: Vec<String> = self
                    .tables
                    .iter()
                    .filter(|(name, _)| *name != table)
                    .flat_map(|(name, state)| {
                        state
                            .foreign_keys
                            .iter()
                            .filter(|fk| &fk.ref_table == table)
                            .map(move |fk| format!("{}.{}", name, fk.column))
                    })
                    .collect();
                if !blocking.is_empty() {
                    return Err(StoreError::ConstraintViolation(format!(
                        "table {} is referenced by {}",
                        table,
                        blocking.join(", ")
                    )));
                }
                self.tables.remove(table);
                Ok(())
            }
            SchemaOp::RenameTable { from, to } => {
                if self.tables.contains_key(to) {
                    return Err(StoreError::AlreadyExists(format!("table {}", to)));
                }
                let state = self
                    .tables
                    .remove(from)
                    .ok_or_else(|| StoreError::NotFound(format!("table {}", from)))?;
                self.tables.insert(to.clone(), state);
                for state in self.tables.values_mut() {
                    for fk in state.foreign_keys.iter_mut() {
                        if &fk.ref_table == from {
                            fk.ref_table = to.clone();
                        }
                    }
                }
                Ok(())
            }
            SchemaOp::AddColumn { table, column, foreign_key } => {
                self.add_column(table, column.clone(), foreign_key.clone())
            }
            SchemaOp::DropColumn { table, column } => {
                let state = self.table(table)?;
                if state.column(column).is_none() {
                    return Err(StoreError::NotFound(format!("column {}.{}", table, column)));
                }
                if state.primary_key.as_deref() == Some(column.as_str()) {
                    return Err(StoreError::ConstraintViolation(format!(
                        "{}.{} is the primary key",
                        table, column
                    )));
                }
                let referencing = self.referencing(table, column);
                if let Some((from, fk)) = referencing.first() {
                    return Err(StoreError::ConstraintViolation(format!(
                        "{}.{} is referenced by {}.{}",
                        table, column, from, fk.column
                    )));
                }
                let state = self.table_mut(table)?;
                state.columns.retain(|c| &c.name != column);
                state.foreign_keys.retain(|fk| &fk.column != column);
                for row in state.rows.values_mut() {
                    row.remove(column);
                }
                Ok(())
            }
            SchemaOp::RenameColumn { table, from, to } => {
                let state = self.table(table)?;
                if state.column(from).is_none() {
                    return Err(StoreError::NotFound(format!("column {}.{}", table, from)));
                }
                if state.column(to).is_some() {
                    return Err(StoreError::AlreadyExists(format!("column {}.{}", table, to)));
                }
                let state = self.table_mut(table)?;
                if let Some(column) = state.column_mut(from) {
                    column.name = to.clone();
                }
                if state.primary_key.as_deref() == Some(from.as_str()) {
                    state.primary_key = Some(to.clone());
                }
                for fk in state.foreign_keys.iter_mut() {
                    if &fk.column == from {
                        fk.column = to.clone();
                    }
                }
                for row in state.rows.values_mut() {
                    if let Some(value) = row.remove(from) {
                        row.insert(to.clone(), value);
                    }
                }
                for state in self.tables.values_mut() {
                    for fk in state.foreign_keys.iter_mut() {
                        if &fk.ref_table == table && &fk.ref_column == from {
                            fk.ref_column = to.clone();
                        }
                    }
                }
                Ok(())
            }
            SchemaOp::AddUnique { table, column } => {
                self.require_column(table, column)?;
                let state = self.table(table)?;
                let mut seen = std::collections::HashSet::new();
                for (id, row) in &state.rows {
                    let value = TableState::value(row, column);
                    if value.is_null() {
                        return Err(StoreError::ConstraintViolation(format!(
                            "{}.{} is NULL in row {}",
                            table, column, id
                        )));
                    }
                    if !seen.insert(value.clone()) {
                        return Err(StoreError::ConstraintViolation(format!(
                            "duplicate value {} in {}.{}",
                            value, table, column
                        )));
                    }
                }
                if let Some(def) = self.table_mut(table)?.column_mut(column) {
                    def.unique = true;
                    def.nullable = false;
                }
                Ok(())
            }
            SchemaOp::SetPrimaryKey { table, column } => self.set_primary_key(table, column),
            SchemaOp::SetForeignKeyEnforced { table, column, enforced } => {
                let fk = self
                    .table(table)?
                    .foreign_key(column)
                    .cloned()
                    .ok_or_else(|| {
                        StoreError::NotFound(format!("foreign key on {}.{}", table, column))
                    })?;
                if *enforced {
                    self.require_key_target(&fk)
                        .map_err(|e| StoreError::ConstraintViolation(e.to_string()))?;
                    self.check_all_resolve(table, &fk)?;
                }
                let state = self.table_mut(table)?;
                if let Some(fk) = state.foreign_keys.iter_mut().find(|fk| &fk.column == column) {
                    fk.enforced = *enforced;
                }
                Ok(())
            }
            SchemaOp::SetNullable { table, column, nullable } => {
                self.require_column(table, column)?;
                let state = self.table(table)?;
                if *nullable && state.primary_key.as_deref() == Some(column.as_str()) {
                    return Err(StoreError::ConstraintViolation(format!(
                        "{}.{} is the primary key",
                        table, column
                    )));
                }
                if !*nullable {
                    let missing = state
                        .rows
                        .iter()
                        .find(|(_, row)| TableState::value(row, column).is_null())
                        .map(|(id, _)| *id);
                    if let Some(id) = missing {
                        return Err(StoreError::ConstraintViolation(format!(
                            "{}.{} is NULL in row {}",
                            table, column, id
                        )));
                    }
                }
                if let Some(def) = self.table_mut(table)?.column_mut(column) {
                    def.nullable = *nullable;
                }
                Ok(())
            }
            SchemaOp::SetRelatedName { table, column, related_name } => {
                let state = self.table_mut(table)?;
                let fk = state
                    .foreign_keys
                    .iter_mut()
                    .find(|fk| &fk.column == column)
                    .ok_or_else(|| {
                        StoreError::NotFound(format!("foreign key on {}.{}", table, column))
                    })?;
                fk.related_name = related_name.clone();
                Ok(())
            }
        }
    }

    fn create_table(&mut self, def: TableDef) -> Result<(), StoreError> {
        if self.tables.contains_key(&def.name) {
            return Err(StoreError::AlreadyExists(format!("table {}", def.name)));
        }
        let mut names = std::collections::HashSet::new();
        for column in &def.columns {
            if !names.insert(column.name.as_str()) {
                return Err(StoreError::Invalid(format!(
                    "duplicate column {}.{}",
                    def.name, column.name
                )));
            }
        }
        if let Some(pk) = &def.primary_key {
            if !names.contains(pk.as_str()) {
                return Err(StoreError::Invalid(format!(
                    "primary key {}.{} is not a column",
                    def.name, pk
                )));
            }
        }
        for fk in &def.foreign_keys {
            if !names.contains(fk.column.as_str()) {
                return Err(StoreError::Invalid(format!(
                    "foreign key column {}.{} is not a column",
                    def.name, fk.column
                )));
            }
            if fk.ref_table == def.name {
                let self_key = def.primary_key.as_deref() == Some(fk.ref_column.as_str())
                    || def
                        .columns
                        .iter()
                        .any(|c| c.name == fk.ref_column && c.unique);
                if !self_key {
                    return Err(StoreError::Invalid(format!(
                        "{}.{} is neither primary key nor unique",
                        fk.ref_table, fk.ref_column
                    )));
                }
            } else {
                self.require_key_target(fk)?;
            }
        }
        let name = def.name.clone();
        self.tables.insert(name, TableState::from_def(def));
        Ok(())
    }

    fn add_column(
        &mut self,
        table: &str,
        column: ColumnDef,
        foreign_key: Option<ForeignKeyDef>,
    ) -> Result<(), StoreError> {
        let state = self.table(table)?;
        if state.column(&column.name).is_some() {
            return Err(StoreError::AlreadyExists(format!("column {}.{}", table, column.name)));
        }
        if !column.nullable && column.default.is_none() && !state.rows.is_empty() {
            return Err(StoreError::ConstraintViolation(format!(
                "NOT NULL column {}.{} needs a default on a populated table",
                table, column.name
            )));
        }
        if let Some(fk) = &foreign_key {
            if fk.column != column.name {
                return Err(StoreError::Invalid(format!(
                    "foreign key column {} does not match {}",
                    fk.column, column.name
                )));
            }
            self.require_key_target(fk)?;
        }

        let state = self.table_mut(table)?;
        // Existing rows read as NULL; a NOT NULL column is filled from its generator.
        if !column.nullable {
            if let Some(generator) = column.default {
                for row in state.rows.values_mut() {
                    row.insert(column.name.clone(), generator.generate());
                }
            }
        }
        state.columns.push(column);
        if let Some(fk) = foreign_key {
            state.foreign_keys.push(fk);
        }
        Ok(())
    }

    fn set_primary_key(&mut self, table: &str, column: &str) -> Result<(), StoreError> {
        let def = self.require_column(table, column)?.clone();
        let state = self.table(table)?;
        if state.primary_key.as_deref() == Some(column) {
            return Ok(());
        }
        if !def.unique || def.nullable {
            return Err(StoreError::ConstraintViolation(format!(
                "{}.{} must be unique and NOT NULL before it can become the primary key",
                table, column
            )));
        }
        let blocking: Vec<String> = self
            .referencing(table, column)
            .into_iter()
            .chain(
                state
                    .primary_key
                    .as_deref()
                    .map(|old| self.referencing(table, old))
                    .unwrap_or_default(),
            )
            .filter(|(_, fk)| fk.enforced)
            .map(|(from, fk)| format!("{}.{}", from, fk.column))
            .collect();
        if !blocking.is_empty() {
            return Err(StoreError::ConstraintViolation(format!(
                "key constraints on {} are referenced by enforced foreign keys: {}",
                table,
                blocking.join(", ")
            )));
        }

        let state = self.table_mut(table)?;
        if let Some(old) = state.primary_key.take() {
            if let Some(old_def) = state.column_mut(&old) {
                old_def.nullable = true;
                old_def.unique = false;
            }
        }
        if let Some(new_def) = state.column_mut(column) {
            new_def.unique = false;
            new_def.nullable = false;
        }
        state.primary_key = Some(column.to_string());
        Ok(())
    }
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    db: RwLock<Snapshot>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from a snapshot.
    pub fn from_snapshot(mut snapshot: Snapshot) -> Self {
        snapshot.normalize();
        Self {
            db: RwLock::new(snapshot),
        }
    }

    /// Load a store from snapshot JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::from_snapshot(serde_json::from_str(json)?))
    }

    /// Copy out the current state.
    pub fn snapshot(&self) -> Snapshot {
        self.db.read().clone()
    }

    /// Serialize the current state as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&*self.db.read())
    }

    /// Create a table.
    pub fn create_table(&self, def: TableDef) -> Result<(), StoreError> {
        self.execute(&SchemaOp::CreateTable(def))
    }

    /// Insert a row as the application would, applying generator defaults.
    pub fn insert<'a>(
        &self,
        table: &str,
        values: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<RowId, StoreError> {
        let values = values
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.db.write().insert_row(table, values)
    }

    /// Update one column of one row.
    pub fn update(&self, table: &str, row: RowId, column: &str, value: Value) -> Result<(), StoreError> {
        self.commit(
            table,
            vec![RowWrite::Update {
                row,
                column: column.to_string(),
                value,
            }],
        )
        .map(|_| ())
    }

    /// All rows of a table in id order.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        self.scan(table, None, usize::MAX)
    }
}

impl SchemaReflector for MemoryStore {
    fn tables(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.db.read().tables.keys().cloned().collect())
    }

    fn describe(&self, table: &str) -> Result<Option<TableDescription>, StoreError> {
        Ok(self.db.read().tables.get(table).map(|t| t.describe(table)))
    }
}

impl LiveStore for MemoryStore {
    fn execute(&self, op: &SchemaOp) -> Result<(), StoreError> {
        self.db.write().execute(op)
    }

    fn scan(&self, table: &str, after: Option<RowId>, limit: usize) -> Result<Vec<Row>, StoreError> {
        let db = self.db.read();
        let state = db.table(table)?;
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(state
            .rows
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(id, values)| Row {
                id: *id,
                values: values.clone(),
            })
            .collect())
    }

    fn lookup(&self, table: &str, column: &str, value: &Value) -> Result<Option<Row>, StoreError> {
        let db = self.db.read();
        db.require_column(table, column)?;
        let state = db.table(table)?;
        Ok(state.find_row(column, value).and_then(|id| {
            state.rows.get(&id).map(|values| Row {
                id,
                values: values.clone(),
            })
        }))
    }

    fn contains(&self, table: &str, values: &BTreeMap<String, Value>) -> Result<bool, StoreError> {
        self.db.read().contains(table, values)
    }

    fn count(&self, table: &str, filter: &CountFilter) -> Result<u64, StoreError> {
        let db = self.db.read();
        for column in filter.present.iter().chain(filter.missing.iter()) {
            db.require_column(table, column)?;
        }
        let state = db.table(table)?;
        let count = state
            .rows
            .values()
            .filter(|row| {
                filter
                    .present
                    .iter()
                    .all(|c| !TableState::value(row, c).is_null())
                    && filter
                        .missing
                        .iter()
                        .all(|c| TableState::value(row, c).is_null())
            })
            .count();
        Ok(count as u64)
    }

    fn commit(&self, table: &str, writes: Vec<RowWrite>) -> Result<usize, StoreError> {
        let mut db = self.db.write();
        db.table(table)?;
        let mut undo = Vec::new();
        let mut changed = 0;
        for write in writes {
            match db.apply_write(table, write, &mut undo) {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    db.rollback(table, undo);
                    return Err(e);
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyGenerator;

    fn library() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_table(TableDef::new("author", "id").with_column(ColumnDef::nullable("name")))
            .unwrap();
        store
            .create_table(TableDef::new("book", "id").with_foreign_key(
                ColumnDef::required("author"),
                ForeignKeyDef::new("author", "author", "id").with_related_name("books"),
            ))
            .unwrap();
        store
            .insert("author", [("id", Value::Int(1)), ("name", "Ada".into())])
            .unwrap();
        store
            .insert("book", [("id", Value::Int(10)), ("author", Value::Int(1))])
            .unwrap();
        store
    }

    #[test]
    fn test_enforced_foreign_key_rejects_dangling_insert() {
        let store = library();
        let err = store
            .insert("book", [("id", Value::Int(11)), ("author", Value::Int(99))])
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[test]
    fn test_generator_default_applies_to_new_rows_only() {
        let store = library();
        store
            .execute(&SchemaOp::AddColumn {
                table: "author".to_string(),
                column: ColumnDef::nullable("uuid").with_default(KeyGenerator::UuidV4),
                foreign_key: None,
            })
            .unwrap();

        let existing = store.rows("author").unwrap();
        assert!(existing[0].get("uuid").is_null());

        let id = store.insert("author", [("id", Value::Int(2))]).unwrap();
        let row = store.lookup("author", "id", &Value::Int(2)).unwrap().unwrap();
        assert_eq!(row.id, id);
        assert!(!row.get("uuid").is_null());
    }

    #[test]
    fn test_add_unique_rejects_nulls() {
        let store = library();
        store
            .execute(&SchemaOp::AddColumn {
                table: "author".to_string(),
                column: ColumnDef::nullable("uuid"),
                foreign_key: None,
            })
            .unwrap();
        let err = store
            .execute(&SchemaOp::AddUnique {
                table: "author".to_string(),
                column: "uuid".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[test]
    fn test_promotion_blocked_by_enforced_reference() {
        let store = library();
        store
            .execute(&SchemaOp::AddColumn {
                table: "author".to_string(),
                column: ColumnDef::nullable("uuid"),
                foreign_key: None,
            })
            .unwrap();
        store.update("author", 1, "uuid", "u-1".into()).unwrap();
        store
            .execute(&SchemaOp::AddUnique {
                table: "author".to_string(),
                column: "uuid".to_string(),
            })
            .unwrap();

        // book.author still references author.id (the current primary key).
        let err = store
            .execute(&SchemaOp::SetPrimaryKey {
                table: "author".to_string(),
                column: "uuid".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        store
            .execute(&SchemaOp::SetForeignKeyEnforced {
                table: "book".to_string(),
                column: "author".to_string(),
                enforced: false,
            })
            .unwrap();
        store
            .execute(&SchemaOp::SetPrimaryKey {
                table: "author".to_string(),
                column: "uuid".to_string(),
            })
            .unwrap();

        let desc = store.describe("author").unwrap().unwrap();
        assert_eq!(desc.primary_key.as_deref(), Some("uuid"));
        assert!(desc.column("id").unwrap().nullable);
    }

    #[test]
    fn test_rename_column_carries_references() {
        let store = library();
        store
            .execute(&SchemaOp::RenameColumn {
                table: "author".to_string(),
                from: "id".to_string(),
                to: "legacy_id".to_string(),
            })
            .unwrap();
        let book = store.describe("book").unwrap().unwrap();
        assert_eq!(book.foreign_key("author").unwrap().ref_column, "legacy_id");
        let author = store.describe("author").unwrap().unwrap();
        assert_eq!(author.primary_key.as_deref(), Some("legacy_id"));
    }

    #[test]
    fn test_batch_commit_is_atomic() {
        let store = library();
        let err = store
            .commit(
                "book",
                vec![
                    RowWrite::InsertIfAbsent {
                        values: [
                            ("id".to_string(), Value::Int(20)),
                            ("author".to_string(), Value::Int(1)),
                        ]
                        .into_iter()
                        .collect(),
                    },
                    RowWrite::InsertIfAbsent {
                        values: [
                            ("id".to_string(), Value::Int(21)),
                            ("author".to_string(), Value::Int(42)),
                        ]
                        .into_iter()
                        .collect(),
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        assert_eq!(store.count("book", &CountFilter::all()).unwrap(), 1);
    }

    #[test]
    fn test_insert_if_absent_has_set_semantics() {
        let store = library();
        let pair: BTreeMap<String, Value> = [
            ("id".to_string(), Value::Int(10)),
            ("author".to_string(), Value::Int(1)),
        ]
        .into_iter()
        .collect();
        let changed = store
            .commit("book", vec![RowWrite::InsertIfAbsent { values: pair }])
            .unwrap();
        assert_eq!(changed, 0);
    }

    #[test]
    fn test_snapshot_json_roundtrip_keeps_row_ids() {
        let store = library();
        let json = store.to_json().unwrap();
        let restored = MemoryStore::from_json(&json).unwrap();
        assert_eq!(restored.snapshot(), store.snapshot());
        let id = restored.insert("author", [("id", Value::Int(3))]).unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_key_index_follows_updates_and_rollback() {
        let store = library();
        store
            .execute(&SchemaOp::AddColumn {
                table: "author".to_string(),
                column: ColumnDef::nullable("code").unique(),
                foreign_key: None,
            })
            .unwrap();
        store.insert("author", [("id", Value::Int(2))]).unwrap();
        store.update("author", 1, "code", "a".into()).unwrap();
        store.update("author", 1, "code", "b".into()).unwrap();

        assert!(store.lookup("author", "code", &"a".into()).unwrap().is_none());
        assert_eq!(store.lookup("author", "code", &"b".into()).unwrap().unwrap().id, 1);

        // The second write collides, so the first is undone along with its index entry.
        let err = store
            .commit(
                "author",
                vec![
                    RowWrite::Update {
                        row: 2,
                        column: "code".to_string(),
                        value: "c".into(),
                    },
                    RowWrite::Update {
                        row: 2,
                        column: "code".to_string(),
                        value: "b".into(),
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        assert!(store.lookup("author", "code", &"c".into()).unwrap().is_none());
        store.update("author", 2, "code", "c".into()).unwrap();
        assert_eq!(store.lookup("author", "code", &"c".into()).unwrap().unwrap().id, 2);
    }

    #[test]
    fn test_key_index_survives_rename_and_reload() {
        let store = library();
        store
            .execute(&SchemaOp::RenameColumn {
                table: "author".to_string(),
                from: "id".to_string(),
                to: "legacy_id".to_string(),
            })
            .unwrap();
        let err = store.insert("author", [("legacy_id", Value::Int(1))]).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        let restored = MemoryStore::from_json(&store.to_json().unwrap()).unwrap();
        let row = restored.lookup("author", "legacy_id", &Value::Int(1)).unwrap().unwrap();
        assert_eq!(row.get("name"), &Value::from("Ada"));
        // Non-key columns still answer by scanning.
        let row = restored.lookup("author", "name", &"Ada".into()).unwrap().unwrap();
        assert_eq!(row.id, 1);
    }

    #[test]
    fn test_set_not_null_rejects_missing_values() {
        let store = library();
        let op = SchemaOp::SetNullable {
            table: "author".to_string(),
            column: "name".to_string(),
            nullable: false,
        };
        store.insert("author", [("id", Value::Int(2))]).unwrap();
        let err = store.execute(&op).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        store.update("author", 2, "name", "Bo".into()).unwrap();
        store.execute(&op).unwrap();
        let err = store.insert("author", [("id", Value::Int(3))]).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[test]
    fn test_drop_referenced_column_is_refused() {
        let store = library();
        store
            .execute(&SchemaOp::AddColumn {
                table: "author".to_string(),
                column: ColumnDef::nullable("code").unique(),
                foreign_key: None,
            })
            .unwrap();
        store
            .execute(&SchemaOp::AddColumn {
                table: "book".to_string(),
                column: ColumnDef::nullable("author_code"),
                foreign_key: Some(ForeignKeyDef::new("author_code", "author", "code")),
            })
            .unwrap();
        let err = store
            .execute(&SchemaOp::DropColumn {
                table: "author".to_string(),
                column: "code".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }
}
