//! Phase plan generation.
//!
//! Turns an entity topology into the fixed, topologically ordered phase
//! sequence for a primary-key swap:
//!
//! | Step | Kind | Per |
//! |------|------|-----|
//! | 1 | ADD new key column (nullable, generator default) | entity |
//! | 2 | BACKFILL generated values | entity |
//! | 3 | CONSTRAIN unique + NOT NULL | entity |
//! | 4 | ADD `{column}_new`, REPOINT through the old reference | foreign key |
//! | 5 | ADD through relation, REPOINT pairings into it | many-to-many |
//! | 6 | DROP old reference / old join table | dependent |
//! | 7 | RELAX new references | dependent |
//! | 8 | PROMOTE new key, demote old key | entity |
//! | 9 | RENAME new references to the original names | dependent |
//! | 10 | RESTORE enforcement, NOT NULL, then related names | dependent |
//! | 11 | ADD/REPOINT/DROP/RENAME/RESTORE a plain join table | many-to-many, without through model |
//! | 12 | CLEANUP the old key column | entity |

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::condition::{Condition, KeyResolution};
use crate::error::MigrationError;
use crate::ledger::{current_timestamp, MigrationLedger};
use crate::phase::{CopySpec, Phase, PhaseAction, PhaseKind};
use crate::store::{ColumnDef, ForeignKeyDef, SchemaOp, TableDef, TableRole};
use crate::topology::{Dependent, Entity, ForeignKeyDependent, ManyToManyDependent, NewKey};

/// Options recognized by the plan builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Replacement key column.
    pub new_key: NewKey,
    /// Keep the through relation for many-to-many dependents. When false the
    /// plan appends steps that swap it back for a plain join table.
    pub use_through_model: bool,
    /// Allow building while a ledger for the entity is in progress.
    pub resume: bool,
}

impl PlanOptions {
    /// Options for a new key column, keeping through relations.
    pub fn new(new_key: NewKey) -> Self {
        Self {
            new_key,
            use_through_model: true,
            resume: false,
        }
    }

    /// Set whether to keep through relations.
    pub fn with_through_model(mut self, use_through_model: bool) -> Self {
        self.use_through_model = use_through_model;
        self
    }

    /// Allow resuming an in-progress migration.
    pub fn resuming(mut self) -> Self {
        self.resume = true;
        self
    }
}

/// An ordered, validated phase sequence for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasePlan {
    /// Entity topology the plan was built from.
    pub entity: Entity,
    /// Whether through relations are kept.
    pub use_through_model: bool,
    /// Phases in execution order.
    pub phases: Vec<Phase>,
    /// When the plan was built (microseconds since epoch).
    pub created_at: u64,
}

impl PhasePlan {
    /// Entity table, the ledger key.
    pub fn entity_name(&self) -> &str {
        &self.entity.table
    }

    /// Number of phases.
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    /// Check if the plan has no phases.
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Highest ordinal.
    pub fn last_ordinal(&self) -> u32 {
        self.phases.last().map(|p| p.ordinal).unwrap_or(0)
    }

    /// Phase by ordinal.
    pub fn phase(&self, ordinal: u32) -> Option<&Phase> {
        ordinal
            .checked_sub(1)
            .and_then(|idx| self.phases.get(idx as usize))
    }

    /// Phases of one kind.
    pub fn phases_of_kind(&self, kind: PhaseKind) -> Vec<&Phase> {
        self.phases.iter().filter(|p| p.kind == kind).collect()
    }

    /// Blake3 checksum (hex) over the entity and phases.
    pub fn checksum(&self) -> Result<String, MigrationError> {
        let mut hasher = blake3::Hasher::new();
        let entity = serde_json::to_vec(&self.entity)
            .map_err(|e| MigrationError::Serialization(e.to_string()))?;
        let phases = serde_json::to_vec(&self.phases)
            .map_err(|e| MigrationError::Serialization(e.to_string()))?;
        hasher.update(&entity);
        hasher.update(&phases);
        Ok(hex::encode(hasher.finalize().as_bytes()))
    }

    /// Serialize the plan for storage alongside the ledger.
    pub fn to_json(&self) -> Result<String, MigrationError> {
        serde_json::to_string(self).map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a stored plan.
    pub fn from_json(json: &str) -> Result<Self, MigrationError> {
        serde_json::from_str(json).map_err(|e| MigrationError::Deserialization(e.to_string()))
    }

    /// Check the structural ordering contract.
    ///
    /// - ordinals run 1..=n
    /// - RENAME phases only rename
    /// - no name is dropped and later re-added
    /// - exactly one PROMOTE, preceded by CONSTRAIN and every RELAX
    /// - every DROP carries a gap-fill copy that an earlier REPOINT performs
    pub fn validate(&self) -> Result<(), MigrationError> {
        for (idx, phase) in self.phases.iter().enumerate() {
            if phase.ordinal as usize != idx + 1 {
                return Err(MigrationError::InvalidPlan {
                    reason: format!("phase at position {} has ordinal {}", idx + 1, phase.ordinal),
                });
            }
        }

        let mut dropped: HashMap<String, u32> = HashMap::new();
        for phase in &self.phases {
            let PhaseAction::Schema(op) = &phase.action else {
                if phase.kind == PhaseKind::Rename {
                    return Err(MigrationError::InvalidPlan {
                        reason: format!("phase {} is a rename but copies data", phase.ordinal),
                    });
                }
                continue;
            };

            if phase.kind == PhaseKind::Rename
                && !matches!(op, SchemaOp::RenameColumn { .. } | SchemaOp::RenameTable { .. })
            {
                return Err(MigrationError::InvalidPlan {
                    reason: format!("phase {} is a rename but runs {}", phase.ordinal, op),
                });
            }

            match op {
                SchemaOp::DropColumn { table, column } => {
                    dropped.insert(format!("{}.{}", table, column), phase.ordinal);
                }
                SchemaOp::DropTable { table } => {
                    dropped.insert(table.clone(), phase.ordinal);
                }
                SchemaOp::AddColumn { table, column, .. } => {
                    let name = format!("{}.{}", table, column.name);
                    if let Some(&dropped_by) = dropped.get(&name) {
                        return Err(MigrationError::DestructiveRename {
                            ordinal: phase.ordinal,
                            dropped_by,
                            name,
                        });
                    }
                }
                SchemaOp::CreateTable(def) => {
                    if let Some(&dropped_by) = dropped.get(&def.name) {
                        return Err(MigrationError::DestructiveRename {
                            ordinal: phase.ordinal,
                            dropped_by,
                            name: def.name.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        let promotes = self.phases_of_kind(PhaseKind::Promote);
        let [promote] = promotes.as_slice() else {
            return Err(MigrationError::InvalidPlan {
                reason: format!("expected one PROMOTE phase, found {}", promotes.len()),
            });
        };
        let constrained = self
            .phases
            .iter()
            .any(|p| p.kind == PhaseKind::Constrain && p.ordinal < promote.ordinal);
        if !constrained {
            return Err(MigrationError::InvalidPlan {
                reason: "uniqueness must be enforced before the key is promoted".to_string(),
            });
        }
        if let Some(late) = self
            .phases
            .iter()
            .find(|p| p.kind == PhaseKind::Relax && p.ordinal > promote.ordinal)
        {
            return Err(MigrationError::InvalidPlan {
                reason: format!("RELAX phase {} runs after the key is promoted", late.ordinal),
            });
        }

        for drop in self.phases_of_kind(PhaseKind::Drop) {
            let Some(gap_fill) = &drop.gap_fill else {
                return Err(MigrationError::InvalidPlan {
                    reason: format!("DROP phase {} has no copy guarding it", drop.ordinal),
                });
            };
            let repointed = self.phases.iter().any(|p| {
                p.kind == PhaseKind::Repoint
                    && p.ordinal < drop.ordinal
                    && p.action == PhaseAction::Copy(gap_fill.clone())
            });
            if !repointed {
                return Err(MigrationError::InvalidPlan {
                    reason: format!(
                        "DROP phase {} removes references before they are copied",
                        drop.ordinal
                    ),
                });
            }
        }

        Ok(())
    }
}

/// Builds the phase plan for an entity.
pub struct PlanBuilder<'a> {
    entity: &'a Entity,
    options: &'a PlanOptions,
    phases: Vec<Phase>,
}

impl<'a> PlanBuilder<'a> {
    /// Build and validate the plan.
    ///
    /// Refuses to build while the entity has an in-progress ledger unless
    /// `options.resume` is set.
    pub fn build(
        entity: &'a Entity,
        options: &'a PlanOptions,
        ledger: &dyn MigrationLedger,
    ) -> Result<PhasePlan, MigrationError> {
        if !options.resume && ledger.plan_header(&entity.table)?.is_some() {
            return Err(MigrationError::MigrationInProgress {
                entity: entity.table.clone(),
            });
        }

        let mut builder = Self {
            entity,
            options,
            phases: Vec::new(),
        };
        builder.introduce_key();
        for fk in entity.foreign_keys() {
            builder.repoint_foreign_key(fk);
        }
        for m2m in entity.many_to_many() {
            builder.mediate_many_to_many(m2m);
        }
        for dependent in &entity.dependents {
            builder.drop_old_reference(dependent);
        }
        for dependent in &entity.dependents {
            builder.relax(dependent);
        }
        builder.promote_key();
        for dependent in &entity.dependents {
            builder.rename(dependent);
        }
        for dependent in &entity.dependents {
            builder.restore_enforcement(dependent);
        }
        for fk in entity.foreign_keys() {
            builder.restore_required(fk);
        }
        for dependent in &entity.dependents {
            builder.restore_naming(dependent);
        }
        if !options.use_through_model {
            for m2m in entity.many_to_many() {
                builder.replace_through_model(m2m);
            }
        }
        builder.cleanup();

        let plan = PhasePlan {
            entity: entity.clone(),
            use_through_model: options.use_through_model,
            phases: builder.phases,
            created_at: current_timestamp(),
        };
        plan.validate()?;

        tracing::debug!(
            entity = %plan.entity.table,
            phases = plan.len(),
            "built key replacement plan"
        );

        Ok(plan)
    }

    fn push(
        &mut self,
        kind: PhaseKind,
        target: String,
        action: PhaseAction,
        preconditions: Vec<Condition>,
        postconditions: Vec<Condition>,
    ) -> &mut Phase {
        let reversible = !matches!(kind, PhaseKind::Drop | PhaseKind::Promote | PhaseKind::Cleanup);
        let ordinal = self.phases.len() as u32 + 1;
        self.phases.push(Phase {
            ordinal,
            kind,
            target,
            action,
            preconditions,
            postconditions,
            reversible,
            gap_fill: None,
        });
        let last = self.phases.len() - 1;
        &mut self.phases[last]
    }

    fn table(&self) -> String {
        self.entity.table.clone()
    }

    fn new_key(&self) -> String {
        self.options.new_key.column.clone()
    }

    fn key_target(&self) -> String {
        format!("{}.{}", self.entity.table, self.options.new_key.column)
    }

    fn unique_new_key(&self) -> Condition {
        Condition::UniqueEnforced {
            table: self.table(),
            column: self.new_key(),
        }
    }

    fn promoted(&self) -> Condition {
        Condition::PrimaryKeyIs {
            table: self.table(),
            column: self.new_key(),
        }
    }

    fn resolution(&self) -> KeyResolution {
        KeyResolution {
            table: self.table(),
            from_column: self.entity.key_column.clone(),
            to_column: self.new_key(),
        }
    }

    fn new_key_reference(&self, column: String) -> ForeignKeyDef {
        ForeignKeyDef::new(column, self.table(), self.new_key())
    }

    fn dependent_column(dependent: &Dependent) -> (String, String, bool) {
        match dependent {
            Dependent::ForeignKey(fk) => (fk.table.clone(), fk.column.clone(), fk.enforced),
            Dependent::ManyToMany(m2m) => {
                (m2m.join_table.clone(), m2m.entity_column.clone(), m2m.enforced)
            }
        }
    }

    fn repoint_spec(&self, fk: &ForeignKeyDependent) -> CopySpec {
        CopySpec::RepointReferences {
            table: fk.table.clone(),
            old_column: fk.column.clone(),
            new_column: fk.transitional_column(),
            resolve: self.resolution(),
        }
    }

    fn through_spec(&self, m2m: &ManyToManyDependent) -> CopySpec {
        CopySpec::CopyPairings {
            source: m2m.join_table.clone(),
            target: m2m.through_table(),
            owner_column: m2m.owner_column.clone(),
            entity_column: m2m.entity_column.clone(),
            resolve: Some(self.resolution()),
        }
    }

    fn legacy_spec(&self, m2m: &ManyToManyDependent) -> CopySpec {
        CopySpec::CopyPairings {
            source: m2m.join_table.clone(),
            target: m2m.legacy_table(),
            owner_column: m2m.owner_column.clone(),
            entity_column: m2m.entity_column.clone(),
            resolve: None,
        }
    }

    /// Join table with the owner reference as declared and the entity reference
    /// on the new key.
    fn join_def(
        &self,
        m2m: &ManyToManyDependent,
        name: String,
        role: TableRole,
        enforced: bool,
    ) -> TableDef {
        let mut entity_reference = self.new_key_reference(m2m.entity_column.clone());
        entity_reference.enforced = enforced;
        TableDef::join(name, role, m2m.owner_foreign_key(), entity_reference)
    }

    /// Steps 1-3.
    fn introduce_key(&mut self) {
        let table = self.table();
        let column = self.new_key();
        let generator = self.options.new_key.generator;
        let key_target = self.key_target();

        self.push(
            PhaseKind::Add,
            key_target.clone(),
            PhaseAction::Schema(SchemaOp::AddColumn {
                table: table.clone(),
                column: ColumnDef::nullable(column.clone()).with_default(generator),
                foreign_key: None,
            }),
            vec![
                Condition::TableExists { table: table.clone() },
                Condition::ColumnAbsent {
                    table: table.clone(),
                    column: column.clone(),
                },
            ],
            vec![Condition::ColumnExists {
                table: table.clone(),
                column: column.clone(),
            }],
        );

        let generate = CopySpec::GenerateKeys {
            table: table.clone(),
            column: column.clone(),
            generator,
        };
        let completion = generate.completion();
        self.push(
            PhaseKind::Backfill,
            key_target.clone(),
            PhaseAction::Copy(generate),
            vec![Condition::ColumnExists {
                table: table.clone(),
                column: column.clone(),
            }],
            vec![completion.clone()],
        );

        self.push(
            PhaseKind::Constrain,
            key_target,
            PhaseAction::Schema(SchemaOp::AddUnique {
                table: table.clone(),
                column: column.clone(),
            }),
            vec![completion],
            vec![self.unique_new_key()],
        );
    }

    /// Step 4.
    fn repoint_foreign_key(&mut self, fk: &ForeignKeyDependent) {
        let transitional = fk.transitional_column();
        let target = format!("{}.{}", fk.table, fk.column);
        let enforced = Condition::ForeignKeyEnforced {
            table: fk.table.clone(),
            column: transitional.clone(),
            ref_table: self.table(),
            ref_column: self.new_key(),
        };

        self.push(
            PhaseKind::Add,
            target.clone(),
            PhaseAction::Schema(SchemaOp::AddColumn {
                table: fk.table.clone(),
                column: ColumnDef::nullable(transitional.clone()),
                foreign_key: Some(self.new_key_reference(transitional.clone())),
            }),
            vec![
                self.unique_new_key(),
                Condition::ColumnExists {
                    table: fk.table.clone(),
                    column: fk.column.clone(),
                },
                Condition::ColumnAbsent {
                    table: fk.table.clone(),
                    column: transitional.clone(),
                },
            ],
            vec![enforced],
        );

        let spec = self.repoint_spec(fk);
        let completion = spec.completion();
        self.push(
            PhaseKind::Repoint,
            target,
            PhaseAction::Copy(spec),
            vec![
                Condition::ColumnExists {
                    table: fk.table.clone(),
                    column: fk.column.clone(),
                },
                Condition::ColumnExists {
                    table: fk.table.clone(),
                    column: transitional,
                },
            ],
            vec![completion],
        );
    }

    /// Step 5.
    fn mediate_many_to_many(&mut self, m2m: &ManyToManyDependent) {
        let through = m2m.through_table();

        self.push(
            PhaseKind::Add,
            through.clone(),
            PhaseAction::Schema(SchemaOp::CreateTable(self.join_def(
                m2m,
                through.clone(),
                TableRole::Through,
                true,
            ))),
            vec![
                self.unique_new_key(),
                Condition::TableExists {
                    table: m2m.join_table.clone(),
                },
                Condition::TableAbsent {
                    table: through.clone(),
                },
            ],
            vec![Condition::TableRoleIs {
                table: through.clone(),
                role: TableRole::Through,
            }],
        );

        let spec = self.through_spec(m2m);
        let completion = spec.completion();
        self.push(
            PhaseKind::Repoint,
            through.clone(),
            PhaseAction::Copy(spec),
            vec![
                Condition::TableExists {
                    table: m2m.join_table.clone(),
                },
                Condition::TableExists { table: through },
            ],
            vec![completion],
        );
    }

    /// Step 6.
    fn drop_old_reference(&mut self, dependent: &Dependent) {
        match dependent {
            Dependent::ForeignKey(fk) => {
                let spec = self.repoint_spec(fk);
                let covered = spec.completion();
                let phase = self.push(
                    PhaseKind::Drop,
                    dependent.target(),
                    PhaseAction::Schema(SchemaOp::DropColumn {
                        table: fk.table.clone(),
                        column: fk.column.clone(),
                    }),
                    vec![
                        Condition::ColumnExists {
                            table: fk.table.clone(),
                            column: fk.column.clone(),
                        },
                        covered,
                    ],
                    vec![Condition::ColumnAbsent {
                        table: fk.table.clone(),
                        column: fk.column.clone(),
                    }],
                );
                phase.gap_fill = Some(spec);
            }
            Dependent::ManyToMany(m2m) => {
                let spec = self.through_spec(m2m);
                let covered = spec.completion();
                let phase = self.push(
                    PhaseKind::Drop,
                    dependent.target(),
                    PhaseAction::Schema(SchemaOp::DropTable {
                        table: m2m.join_table.clone(),
                    }),
                    vec![
                        Condition::TableRoleIs {
                            table: m2m.join_table.clone(),
                            role: TableRole::AutoJoin,
                        },
                        covered,
                    ],
                    vec![Condition::TableAbsent {
                        table: m2m.join_table.clone(),
                    }],
                );
                phase.gap_fill = Some(spec);
            }
        }
    }

    /// Step 7.
    fn relax(&mut self, dependent: &Dependent) {
        let (table, column) = match dependent {
            Dependent::ForeignKey(fk) => (fk.table.clone(), fk.transitional_column()),
            Dependent::ManyToMany(m2m) => (m2m.through_table(), m2m.entity_column.clone()),
        };
        self.push(
            PhaseKind::Relax,
            dependent.target(),
            PhaseAction::Schema(SchemaOp::SetForeignKeyEnforced {
                table: table.clone(),
                column: column.clone(),
                enforced: false,
            }),
            vec![Condition::ForeignKeyEnforced {
                table: table.clone(),
                column: column.clone(),
                ref_table: self.table(),
                ref_column: self.new_key(),
            }],
            vec![Condition::ForeignKeyRelaxed { table, column }],
        );
    }

    /// Step 8.
    fn promote_key(&mut self) {
        let mut preconditions = vec![
            self.unique_new_key(),
            Condition::PrimaryKeyIs {
                table: self.table(),
                column: self.entity.key_column.clone(),
            },
        ];
        for dependent in &self.entity.dependents {
            let (table, column) = match dependent {
                Dependent::ForeignKey(fk) => (fk.table.clone(), fk.transitional_column()),
                Dependent::ManyToMany(m2m) => (m2m.through_table(), m2m.entity_column.clone()),
            };
            preconditions.push(Condition::ForeignKeyRelaxed { table, column });
        }
        let promoted = self.promoted();
        self.push(
            PhaseKind::Promote,
            self.key_target(),
            PhaseAction::Schema(SchemaOp::SetPrimaryKey {
                table: self.table(),
                column: self.new_key(),
            }),
            preconditions,
            vec![promoted],
        );
    }

    /// Step 9.
    fn rename(&mut self, dependent: &Dependent) {
        match dependent {
            Dependent::ForeignKey(fk) => {
                let transitional = fk.transitional_column();
                self.push(
                    PhaseKind::Rename,
                    dependent.target(),
                    PhaseAction::Schema(SchemaOp::RenameColumn {
                        table: fk.table.clone(),
                        from: transitional.clone(),
                        to: fk.column.clone(),
                    }),
                    vec![
                        Condition::ColumnExists {
                            table: fk.table.clone(),
                            column: transitional.clone(),
                        },
                        Condition::ColumnAbsent {
                            table: fk.table.clone(),
                            column: fk.column.clone(),
                        },
                    ],
                    vec![
                        Condition::ColumnExists {
                            table: fk.table.clone(),
                            column: fk.column.clone(),
                        },
                        Condition::ColumnAbsent {
                            table: fk.table.clone(),
                            column: transitional,
                        },
                    ],
                );
            }
            Dependent::ManyToMany(m2m) => {
                let through = m2m.through_table();
                self.push(
                    PhaseKind::Rename,
                    dependent.target(),
                    PhaseAction::Schema(SchemaOp::RenameTable {
                        from: through.clone(),
                        to: m2m.join_table.clone(),
                    }),
                    vec![
                        Condition::TableExists {
                            table: through.clone(),
                        },
                        Condition::TableAbsent {
                            table: m2m.join_table.clone(),
                        },
                    ],
                    vec![
                        Condition::TableExists {
                            table: m2m.join_table.clone(),
                        },
                        Condition::TableAbsent { table: through },
                    ],
                );
            }
        }
    }

    /// Step 10, enforcement. References that were unenforced stay relaxed.
    fn restore_enforcement(&mut self, dependent: &Dependent) {
        let (table, column, enforced) = Self::dependent_column(dependent);
        if !enforced {
            return;
        }
        self.push(
            PhaseKind::Restore,
            dependent.target(),
            PhaseAction::Schema(SchemaOp::SetForeignKeyEnforced {
                table: table.clone(),
                column: column.clone(),
                enforced: true,
            }),
            vec![
                self.promoted(),
                Condition::ForeignKeyRelaxed {
                    table: table.clone(),
                    column: column.clone(),
                },
            ],
            vec![Condition::ForeignKeyEnforced {
                table,
                column,
                ref_table: self.table(),
                ref_column: self.new_key(),
            }],
        );
    }

    /// Step 10, NOT NULL. Only for references that were required.
    fn restore_required(&mut self, fk: &ForeignKeyDependent) {
        if fk.nullable {
            return;
        }
        let table = fk.table.clone();
        let column = fk.column.clone();
        self.push(
            PhaseKind::Restore,
            format!("{}.{}", table, column),
            PhaseAction::Schema(SchemaOp::SetNullable {
                table: table.clone(),
                column: column.clone(),
                nullable: false,
            }),
            vec![
                self.promoted(),
                Condition::ColumnExists {
                    table: table.clone(),
                    column: column.clone(),
                },
                Condition::NoMissingValues {
                    table: table.clone(),
                    column: column.clone(),
                },
            ],
            vec![Condition::ColumnRequired { table, column }],
        );
    }

    /// Step 10, naming. Skipped for references without a related name.
    fn restore_naming(&mut self, dependent: &Dependent) {
        let (table, column, related_name) = match dependent {
            Dependent::ForeignKey(fk) => (fk.table.clone(), fk.column.clone(), fk.related_name.clone()),
            Dependent::ManyToMany(m2m) => (
                m2m.join_table.clone(),
                m2m.entity_column.clone(),
                m2m.related_name.clone(),
            ),
        };
        if related_name.is_none() {
            return;
        }
        self.push_naming(dependent.target(), table, column, related_name);
    }

    fn push_naming(
        &mut self,
        target: String,
        table: String,
        column: String,
        related_name: Option<String>,
    ) {
        self.push(
            PhaseKind::Restore,
            target,
            PhaseAction::Schema(SchemaOp::SetRelatedName {
                table: table.clone(),
                column: column.clone(),
                related_name: related_name.clone(),
            }),
            vec![Condition::ColumnExists {
                table: table.clone(),
                column: column.clone(),
            }],
            vec![Condition::RelatedNameIs {
                table,
                column,
                related_name,
            }],
        );
    }

    /// Step 11: swap the through relation for a plain join table.
    fn replace_through_model(&mut self, m2m: &ManyToManyDependent) {
        let join = m2m.join_table.clone();
        let legacy = m2m.legacy_table();

        self.push(
            PhaseKind::Add,
            legacy.clone(),
            PhaseAction::Schema(SchemaOp::CreateTable(self.join_def(
                m2m,
                legacy.clone(),
                TableRole::AutoJoin,
                m2m.enforced,
            ))),
            vec![
                self.promoted(),
                Condition::TableRoleIs {
                    table: join.clone(),
                    role: TableRole::Through,
                },
                Condition::TableAbsent {
                    table: legacy.clone(),
                },
            ],
            vec![Condition::TableRoleIs {
                table: legacy.clone(),
                role: TableRole::AutoJoin,
            }],
        );

        let spec = self.legacy_spec(m2m);
        let covered = spec.completion();
        self.push(
            PhaseKind::Repoint,
            legacy.clone(),
            PhaseAction::Copy(spec.clone()),
            vec![
                Condition::TableExists { table: join.clone() },
                Condition::TableExists {
                    table: legacy.clone(),
                },
            ],
            vec![covered.clone()],
        );

        let phase = self.push(
            PhaseKind::Drop,
            join.clone(),
            PhaseAction::Schema(SchemaOp::DropTable { table: join.clone() }),
            vec![
                Condition::TableRoleIs {
                    table: join.clone(),
                    role: TableRole::Through,
                },
                covered,
            ],
            vec![Condition::TableAbsent { table: join.clone() }],
        );
        phase.gap_fill = Some(spec);

        self.push(
            PhaseKind::Rename,
            join.clone(),
            PhaseAction::Schema(SchemaOp::RenameTable {
                from: legacy.clone(),
                to: join.clone(),
            }),
            vec![
                Condition::TableExists {
                    table: legacy.clone(),
                },
                Condition::TableAbsent { table: join.clone() },
            ],
            vec![
                Condition::TableRoleIs {
                    table: join.clone(),
                    role: TableRole::AutoJoin,
                },
                Condition::TableAbsent { table: legacy },
            ],
        );

        if m2m.related_name.is_some() {
            self.push_naming(join.clone(), join, m2m.entity_column.clone(), m2m.related_name.clone());
        }
    }

    /// Step 12.
    fn cleanup(&mut self) {
        let table = self.table();
        let key = self.entity.key_column.clone();
        let promoted = self.promoted();
        self.push(
            PhaseKind::Cleanup,
            format!("{}.{}", table, key),
            PhaseAction::Schema(SchemaOp::DropColumn {
                table: table.clone(),
                column: key.clone(),
            }),
            vec![
                promoted,
                Condition::ColumnExists {
                    table: table.clone(),
                    column: key.clone(),
                },
            ],
            vec![Condition::ColumnAbsent { table, column: key }],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SledLedger;

    fn ledger() -> SledLedger {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledLedger::open(&db).unwrap()
    }

    fn entity() -> Entity {
        Entity::new("author", "id", NewKey::uuid("uuid"))
            .with_foreign_key(ForeignKeyDependent::new("book", "author").with_related_name("books"))
            .with_many_to_many(
                ManyToManyDependent::new("prize", "id", "prize_winners", "prize_id", "author_id")
                    .with_related_name("prizes"),
            )
    }

    fn kinds(plan: &PhasePlan) -> Vec<PhaseKind> {
        plan.phases.iter().map(|p| p.kind).collect()
    }

    #[test]
    fn test_plan_ordering_with_through_model() {
        let entity = entity();
        let options = PlanOptions::new(NewKey::uuid("uuid"));
        let plan = PlanBuilder::build(&entity, &options, &ledger()).unwrap();

        use PhaseKind::*;
        assert_eq!(
            kinds(&plan),
            vec![
                Add, Backfill, Constrain, // key
                Add, Repoint, // book.author
                Add, Repoint, // prize_winners
                Drop, Drop, Relax, Relax, Promote, Rename, Rename, Restore, Restore, Restore,
                Restore, Cleanup,
            ]
        );
        assert_eq!(plan.last_ordinal(), 19);
        assert!(plan.phase(12).is_some_and(|p| p.kind == Promote));
    }

    #[test]
    fn test_plan_without_through_model_appends_swap_back() {
        let entity = entity();
        let options = PlanOptions::new(NewKey::uuid("uuid")).with_through_model(false);
        let plan = PlanBuilder::build(&entity, &options, &ledger()).unwrap();

        let tail: Vec<PhaseKind> = kinds(&plan)[18..].to_vec();
        use PhaseKind::*;
        assert_eq!(tail, vec![Add, Repoint, Drop, Rename, Restore, Cleanup]);
        assert_eq!(plan.phases.last().unwrap().kind, Cleanup);
    }

    #[test]
    fn test_relax_precedes_promote_and_renames_are_pure() {
        let entity = entity();
        let options = PlanOptions::new(NewKey::uuid("uuid")).with_through_model(false);
        let plan = PlanBuilder::build(&entity, &options, &ledger()).unwrap();

        let promote = plan.phases_of_kind(PhaseKind::Promote)[0].ordinal;
        assert!(plan
            .phases_of_kind(PhaseKind::Relax)
            .iter()
            .all(|p| p.ordinal < promote));
        for rename in plan.phases_of_kind(PhaseKind::Rename) {
            assert!(matches!(
                rename.action,
                PhaseAction::Schema(SchemaOp::RenameColumn { .. } | SchemaOp::RenameTable { .. })
            ));
        }
    }

    #[test]
    fn test_required_reference_is_restored_after_rename() {
        let entity = Entity::new("author", "id", NewKey::uuid("uuid"))
            .with_foreign_key(ForeignKeyDependent::new("book", "author").required());
        let options = PlanOptions::new(NewKey::uuid("uuid"));
        let plan = PlanBuilder::build(&entity, &options, &ledger()).unwrap();

        let rename = plan.phases_of_kind(PhaseKind::Rename)[0].ordinal;
        let restore = plan
            .phases
            .iter()
            .find(|p| matches!(p.action, PhaseAction::Schema(SchemaOp::SetNullable { .. })))
            .unwrap();
        assert!(restore.ordinal > rename);
        assert_eq!(restore.kind, PhaseKind::Restore);
        assert!(restore.preconditions.contains(&Condition::NoMissingValues {
            table: "book".to_string(),
            column: "author".to_string(),
        }));

        // The transitional column stays nullable while the swap runs.
        let add = &plan.phases[3];
        assert!(matches!(
            &add.action,
            PhaseAction::Schema(SchemaOp::AddColumn { column, .. }) if column.nullable
        ));
    }

    #[test]
    fn test_unenforced_reference_stays_relaxed() {
        let entity = Entity::new("author", "id", NewKey::uuid("uuid"))
            .with_foreign_key(ForeignKeyDependent::new("review", "reviewer").unenforced());
        let options = PlanOptions::new(NewKey::uuid("uuid"));
        let plan = PlanBuilder::build(&entity, &options, &ledger()).unwrap();

        assert!(!plan.phases.iter().any(|p| matches!(
            p.action,
            PhaseAction::Schema(SchemaOp::SetForeignKeyEnforced { enforced: true, .. })
        )));
        assert_eq!(plan.phases_of_kind(PhaseKind::Relax).len(), 1);
    }

    #[test]
    fn test_join_tables_keep_owner_reference() {
        let entity = Entity::new("author", "id", NewKey::uuid("uuid")).with_many_to_many(
            ManyToManyDependent::new("prize", "id", "prize_winners", "prize_id", "author_id")
                .with_owner_related_name("winners"),
        );
        let options = PlanOptions::new(NewKey::uuid("uuid")).with_through_model(false);
        let plan = PlanBuilder::build(&entity, &options, &ledger()).unwrap();

        let created: Vec<&TableDef> = plan
            .phases
            .iter()
            .filter_map(|p| match &p.action {
                PhaseAction::Schema(SchemaOp::CreateTable(def)) => Some(def),
                _ => None,
            })
            .collect();
        assert_eq!(created.len(), 2);
        for def in created {
            let owner = def.foreign_keys.iter().find(|fk| fk.column == "prize_id").unwrap();
            assert_eq!(owner.related_name.as_deref(), Some("winners"));
            assert_eq!(owner.ref_table, "prize");
        }
    }

    #[test]
    fn test_drop_then_add_is_refused() {
        let entity = Entity::new("author", "id", NewKey::uuid("uuid"))
            .with_foreign_key(ForeignKeyDependent::new("book", "author"));
        let options = PlanOptions::new(NewKey::uuid("uuid"));
        let mut plan = PlanBuilder::build(&entity, &options, &ledger()).unwrap();

        // Replace the rename with an add of the dropped column.
        let rename = plan.phases_of_kind(PhaseKind::Rename)[0].ordinal as usize - 1;
        plan.phases[rename].kind = PhaseKind::Add;
        plan.phases[rename].action = PhaseAction::Schema(SchemaOp::AddColumn {
            table: "book".to_string(),
            column: ColumnDef::nullable("author"),
            foreign_key: None,
        });

        let err = plan.validate().unwrap_err();
        assert!(matches!(err, MigrationError::DestructiveRename { ref name, .. } if name == "book.author"));
    }

    #[test]
    fn test_promote_before_constrain_is_refused() {
        let entity = Entity::new("author", "id", NewKey::uuid("uuid"));
        let options = PlanOptions::new(NewKey::uuid("uuid"));
        let mut plan = PlanBuilder::build(&entity, &options, &ledger()).unwrap();

        plan.phases.retain(|p| p.kind != PhaseKind::Constrain);
        for (idx, phase) in plan.phases.iter_mut().enumerate() {
            phase.ordinal = idx as u32 + 1;
        }
        assert!(matches!(plan.validate(), Err(MigrationError::InvalidPlan { .. })));
    }

    #[test]
    fn test_in_progress_ledger_requires_resume() {
        let entity = entity();
        let ledger = ledger();
        let options = PlanOptions::new(NewKey::uuid("uuid"));
        let plan = PlanBuilder::build(&entity, &options, &ledger).unwrap();
        ledger
            .register_plan(&crate::ledger::PlanHeader::for_plan(&plan).unwrap())
            .unwrap();

        let err = PlanBuilder::build(&entity, &options, &ledger).unwrap_err();
        assert!(matches!(err, MigrationError::MigrationInProgress { .. }));

        let resumed = PlanBuilder::build(&entity, &options.clone().resuming(), &ledger);
        assert!(resumed.is_ok());
    }

    #[test]
    fn test_checksum_is_stable_and_sensitive() {
        let entity = entity();
        let options = PlanOptions::new(NewKey::uuid("uuid"));
        let a = PlanBuilder::build(&entity, &options, &ledger()).unwrap();
        let b = PlanBuilder::build(&entity, &options, &ledger()).unwrap();
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());

        let c = PlanBuilder::build(&entity, &options.clone().with_through_model(false), &ledger())
            .unwrap();
        assert_ne!(a.checksum().unwrap(), c.checksum().unwrap());
    }
}
