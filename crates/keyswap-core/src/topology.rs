//! Relationship topology of an entity undergoing key replacement.

use serde::{Deserialize, Serialize};

use crate::store::{ForeignKeyDef, KeyGenerator};

/// Suffix of the transitional reference column added next to each foreign key.
pub const TRANSITIONAL_SUFFIX: &str = "_new";

/// Suffix of the through relation that mediates a many-to-many during the swap.
pub const THROUGH_SUFFIX: &str = "_through";

/// Suffix of the parallel join table used to drop the through relation again.
pub const LEGACY_SUFFIX: &str = "_old";

/// The replacement key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewKey {
    /// Column name.
    pub column: String,
    /// Value generator, also installed as the column default.
    pub generator: KeyGenerator,
}

impl NewKey {
    /// A UUID key column.
    pub fn uuid(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            generator: KeyGenerator::UuidV4,
        }
    }
}

/// A table holding one reference to the entity per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDependent {
    /// Referencing table.
    pub table: String,
    /// Referencing column.
    pub column: String,
    /// Related name of the reference.
    pub related_name: Option<String>,
    /// Whether the referencing column accepted NULL before the swap.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Whether the reference was enforced before the swap.
    #[serde(default = "default_true")]
    pub enforced: bool,
}

fn default_true() -> bool {
    true
}

impl ForeignKeyDependent {
    /// Create a nullable, enforced foreign-key dependent.
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            related_name: None,
            nullable: true,
            enforced: true,
        }
    }

    /// Set the related name.
    pub fn with_related_name(mut self, related_name: impl Into<String>) -> Self {
        self.related_name = Some(related_name.into());
        self
    }

    /// Mark the referencing column NOT NULL.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark the reference as not checked by the store.
    pub fn unenforced(mut self) -> Self {
        self.enforced = false;
        self
    }

    /// Column holding the new-key reference until the rename phase.
    pub fn transitional_column(&self) -> String {
        format!("{}{}", self.column, TRANSITIONAL_SUFFIX)
    }
}

/// A set of references to the entity held through an auto-managed join table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManyToManyDependent {
    /// Table declaring the many-to-many field.
    pub owner_table: String,
    /// Primary-key column of the owner table.
    pub owner_key: String,
    /// Join table.
    pub join_table: String,
    /// Join column referencing the owner.
    pub owner_column: String,
    /// Join column referencing the entity.
    pub entity_column: String,
    /// Related name of the entity-side reference.
    pub related_name: Option<String>,
    /// Whether the entity-side reference was enforced before the swap.
    #[serde(default = "default_true")]
    pub enforced: bool,
    /// Related name of the owner-side reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_related_name: Option<String>,
    /// Whether the owner-side reference was enforced.
    #[serde(default = "default_true")]
    pub owner_enforced: bool,
}

impl ManyToManyDependent {
    /// Create a many-to-many dependent.
    pub fn new(
        owner_table: impl Into<String>,
        owner_key: impl Into<String>,
        join_table: impl Into<String>,
        owner_column: impl Into<String>,
        entity_column: impl Into<String>,
    ) -> Self {
        Self {
            owner_table: owner_table.into(),
            owner_key: owner_key.into(),
            join_table: join_table.into(),
            owner_column: owner_column.into(),
            entity_column: entity_column.into(),
            related_name: None,
            enforced: true,
            owner_related_name: None,
            owner_enforced: true,
        }
    }

    /// Set the related name.
    pub fn with_related_name(mut self, related_name: impl Into<String>) -> Self {
        self.related_name = Some(related_name.into());
        self
    }

    /// Set the related name of the owner-side reference.
    pub fn with_owner_related_name(mut self, related_name: impl Into<String>) -> Self {
        self.owner_related_name = Some(related_name.into());
        self
    }

    /// Owner-side foreign key of the join table, as originally declared.
    pub fn owner_foreign_key(&self) -> ForeignKeyDef {
        ForeignKeyDef {
            column: self.owner_column.clone(),
            ref_table: self.owner_table.clone(),
            ref_column: self.owner_key.clone(),
            enforced: self.owner_enforced,
            related_name: self.owner_related_name.clone(),
        }
    }

    /// Through relation created during the swap.
    pub fn through_table(&self) -> String {
        format!("{}{}", self.join_table, THROUGH_SUFFIX)
    }

    /// Parallel auto join table used when the through relation is not kept.
    pub fn legacy_table(&self) -> String {
        format!("{}{}", self.join_table, LEGACY_SUFFIX)
    }
}

/// A table related to the entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dependent {
    /// Many-to-one reference.
    ForeignKey(ForeignKeyDependent),
    /// Many-to-many reference.
    ManyToMany(ManyToManyDependent),
}

impl Dependent {
    /// Human-readable target, `table.column` or the join table.
    pub fn target(&self) -> String {
        match self {
            Dependent::ForeignKey(fk) => format!("{}.{}", fk.table, fk.column),
            Dependent::ManyToMany(m2m) => m2m.join_table.clone(),
        }
    }
}

/// The table whose primary key is being replaced, with its dependents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Table name. Also the ledger key.
    pub table: String,
    /// Current primary-key column.
    pub key_column: String,
    /// Replacement key.
    pub new_key: NewKey,
    /// Dependents in discovery order.
    pub dependents: Vec<Dependent>,
}

impl Entity {
    /// Create an entity with no dependents.
    pub fn new(table: impl Into<String>, key_column: impl Into<String>, new_key: NewKey) -> Self {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            new_key,
            dependents: Vec::new(),
        }
    }

    /// Add a foreign-key dependent.
    pub fn with_foreign_key(mut self, dependent: ForeignKeyDependent) -> Self {
        self.dependents.push(Dependent::ForeignKey(dependent));
        self
    }

    /// Add a many-to-many dependent.
    pub fn with_many_to_many(mut self, dependent: ManyToManyDependent) -> Self {
        self.dependents.push(Dependent::ManyToMany(dependent));
        self
    }

    /// Foreign-key dependents.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &ForeignKeyDependent> {
        self.dependents.iter().filter_map(|d| match d {
            Dependent::ForeignKey(fk) => Some(fk),
            Dependent::ManyToMany(_) => None,
        })
    }

    /// Many-to-many dependents.
    pub fn many_to_many(&self) -> impl Iterator<Item = &ManyToManyDependent> {
        self.dependents.iter().filter_map(|d| match d {
            Dependent::ManyToMany(m2m) => Some(m2m),
            Dependent::ForeignKey(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitional_names() {
        let fk = ForeignKeyDependent::new("book", "author");
        assert_eq!(fk.transitional_column(), "author_new");

        let m2m = ManyToManyDependent::new("book", "id", "book_authors", "book_id", "author_id");
        assert_eq!(m2m.through_table(), "book_authors_through");
        assert_eq!(m2m.legacy_table(), "book_authors_old");
    }

    #[test]
    fn test_dependent_partitioning() {
        let entity = Entity::new("author", "id", NewKey::uuid("uuid"))
            .with_foreign_key(ForeignKeyDependent::new("book", "author"))
            .with_many_to_many(ManyToManyDependent::new(
                "prize", "id", "prize_winners", "prize_id", "author_id",
            ))
            .with_foreign_key(ForeignKeyDependent::new("essay", "writer"));

        assert_eq!(entity.foreign_keys().count(), 2);
        assert_eq!(entity.many_to_many().count(), 1);
        assert_eq!(entity.dependents[1].target(), "prize_winners");
    }

    #[test]
    fn test_owner_foreign_key_keeps_declaration() {
        let mut m2m = ManyToManyDependent::new("prize", "id", "prize_winners", "prize_id", "author_id")
            .with_owner_related_name("winners");
        m2m.owner_enforced = false;

        let owner = m2m.owner_foreign_key();
        assert_eq!(owner.column, "prize_id");
        assert_eq!(owner.ref_table, "prize");
        assert_eq!(owner.related_name.as_deref(), Some("winners"));
        assert!(!owner.enforced);
    }

    #[test]
    fn test_dependent_defaults_for_older_plans() {
        let fk: ForeignKeyDependent =
            serde_json::from_str(r#"{"table":"book","column":"author","related_name":null}"#).unwrap();
        assert!(fk.nullable);
        assert!(fk.enforced);
    }
}
