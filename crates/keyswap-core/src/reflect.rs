//! Entity discovery from reflected schema state.

use crate::error::MigrationError;
use crate::store::{SchemaReflector, TableRole};
use crate::topology::{Entity, ForeignKeyDependent, ManyToManyDependent, NewKey};

/// Build the topology of `table` by scanning every table for references to its key.
///
/// - A foreign key on a regular table becomes a [`ForeignKeyDependent`].
/// - A foreign key on an explicit through table is also a [`ForeignKeyDependent`]:
///   the existing join entity is reused and re-pointed in place.
/// - A foreign key on an auto join table becomes a [`ManyToManyDependent`]; the
///   join table's other foreign key identifies the owner.
///
/// Nullability, enforcement, and the owner-side foreign key are captured so the
/// plan can put them back once the references point at the new key. A join table
/// whose two sides both reference the entity's key is refused.
pub fn discover_entity(
    reflector: &dyn SchemaReflector,
    table: &str,
    new_key: NewKey,
) -> Result<Entity, MigrationError> {
    let desc = reflector
        .describe(table)?
        .ok_or_else(|| MigrationError::EntityNotFound {
            entity: table.to_string(),
        })?;
    let key_column = desc.primary_key.clone().ok_or_else(|| MigrationError::InvalidPlan {
        reason: format!("{} has no primary key", table),
    })?;
    if key_column == new_key.column {
        return Err(MigrationError::InvalidPlan {
            reason: format!("{}.{} is already the primary key", table, key_column),
        });
    }

    let mut entity = Entity::new(table, key_column.clone(), new_key);

    for name in reflector.tables()? {
        let Some(other) = reflector.describe(&name)? else {
            continue;
        };
        for fk in &other.foreign_keys {
            if fk.ref_table != table || fk.ref_column != key_column {
                continue;
            }
            match other.role {
                TableRole::AutoJoin => {
                    let owner = other
                        .foreign_keys
                        .iter()
                        .find(|o| o.column != fk.column)
                        .ok_or_else(|| MigrationError::InvalidPlan {
                            reason: format!("join table {} has no owner reference", name),
                        })?;
                    if owner.ref_table == table && owner.ref_column == key_column {
                        return Err(MigrationError::InvalidPlan {
                            reason: format!(
                                "join table {} references {}.{} from both sides",
                                name, table, key_column
                            ),
                        });
                    }
                    let mut m2m = ManyToManyDependent::new(
                        owner.ref_table.clone(),
                        owner.ref_column.clone(),
                        name.clone(),
                        owner.column.clone(),
                        fk.column.clone(),
                    );
                    m2m.related_name = fk.related_name.clone();
                    m2m.enforced = fk.enforced;
                    m2m.owner_related_name = owner.related_name.clone();
                    m2m.owner_enforced = owner.enforced;
                    entity = entity.with_many_to_many(m2m);
                }
                TableRole::Regular | TableRole::Through => {
                    let mut dependent = ForeignKeyDependent::new(name.clone(), fk.column.clone());
                    dependent.related_name = fk.related_name.clone();
                    dependent.enforced = fk.enforced;
                    dependent.nullable = other.column(&fk.column).map(|c| c.nullable).unwrap_or(true);
                    entity = entity.with_foreign_key(dependent);
                }
            }
        }
    }

    tracing::debug!(
        entity = table,
        key = %key_column,
        dependents = entity.dependents.len(),
        "discovered entity topology"
    );

    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ColumnDef, ForeignKeyDef, MemoryStore, TableDef};
    use crate::topology::Dependent;

    fn library() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_table(TableDef::new("author", "id")).unwrap();
        store
            .create_table(TableDef::new("book", "id").with_foreign_key(
                ColumnDef::required("author"),
                ForeignKeyDef::new("author", "author", "id").with_related_name("books"),
            ))
            .unwrap();
        store.create_table(TableDef::new("prize", "id")).unwrap();
        store
            .create_table(TableDef::join(
                "prize_winners",
                TableRole::AutoJoin,
                ForeignKeyDef::new("prize_id", "prize", "id").with_related_name("winners"),
                ForeignKeyDef::new("author_id", "author", "id").with_related_name("prizes"),
            ))
            .unwrap();
        store
    }

    #[test]
    fn test_discovers_both_multiplicities() {
        let store = library();
        let entity = discover_entity(&store, "author", NewKey::uuid("uuid")).unwrap();

        assert_eq!(entity.key_column, "id");
        assert_eq!(entity.dependents.len(), 2);
        assert_eq!(
            entity.dependents[0],
            Dependent::ForeignKey(
                ForeignKeyDependent::new("book", "author")
                    .with_related_name("books")
                    .required()
            )
        );
        assert_eq!(
            entity.dependents[1],
            Dependent::ManyToMany(
                ManyToManyDependent::new("prize", "id", "prize_winners", "prize_id", "author_id")
                    .with_related_name("prizes")
                    .with_owner_related_name("winners")
            )
        );
    }

    #[test]
    fn test_captures_unenforced_nullable_reference() {
        let store = library();
        let mut reviewer = ForeignKeyDef::new("reviewer", "author", "id");
        reviewer.enforced = false;
        store
            .create_table(
                TableDef::new("review", "id").with_foreign_key(ColumnDef::nullable("reviewer"), reviewer),
            )
            .unwrap();

        let entity = discover_entity(&store, "author", NewKey::uuid("uuid")).unwrap();
        let review = entity.foreign_keys().find(|fk| fk.table == "review").unwrap();
        assert!(review.nullable);
        assert!(!review.enforced);
    }

    #[test]
    fn test_self_referencing_join_table_is_refused() {
        let store = library();
        store
            .create_table(TableDef::join(
                "author_friends",
                TableRole::AutoJoin,
                ForeignKeyDef::new("from_author", "author", "id"),
                ForeignKeyDef::new("to_author", "author", "id"),
            ))
            .unwrap();

        let err = discover_entity(&store, "author", NewKey::uuid("uuid")).unwrap_err();
        assert!(
            matches!(err, MigrationError::InvalidPlan { ref reason } if reason.contains("author_friends"))
        );
    }

    #[test]
    fn test_explicit_through_table_is_reused_as_foreign_key() {
        let store = library();
        store
            .create_table(TableDef::join(
                "membership",
                TableRole::Through,
                ForeignKeyDef::new("club", "prize", "id"),
                ForeignKeyDef::new("member", "author", "id"),
            ))
            .unwrap();

        let entity = discover_entity(&store, "author", NewKey::uuid("uuid")).unwrap();
        assert!(entity
            .foreign_keys()
            .any(|fk| fk.table == "membership" && fk.column == "member"));
    }

    #[test]
    fn test_missing_entity() {
        let store = library();
        let err = discover_entity(&store, "publisher", NewKey::uuid("uuid")).unwrap_err();
        assert!(matches!(err, MigrationError::EntityNotFound { .. }));
    }
}
