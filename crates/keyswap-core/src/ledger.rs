//! Durable migration ledger.
//!
//! Per entity, an append-only log of phase outcomes plus the registered plan
//! header and any backfill cursors. The ledger is the only thing that says how
//! far a migration has progressed; it is written only after a phase's
//! postconditions have been confirmed.

use std::sync::Arc;

use parking_lot::Mutex;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::MigrationError;
use crate::lock::EntityLocks;
use crate::plan::PhasePlan;
use crate::store::RowId;

/// Current time in microseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Outcome recorded for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum LedgerStatus {
    /// Action about to run.
    Pending,
    /// Action committed and postconditions confirmed.
    Applied,
    /// Action or postcondition failed.
    Failed,
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerStatus::Pending => write!(f, "pending"),
            LedgerStatus::Applied => write!(f, "applied"),
            LedgerStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entity table.
    pub entity: String,
    /// Phase ordinal.
    pub ordinal: u32,
    /// Outcome.
    pub status: LedgerStatus,
    /// When the entry was written (microseconds since epoch).
    pub recorded_at: u64,
    /// Checksum of the plan the phase belongs to.
    pub plan_checksum: String,
    /// Failure reason.
    pub reason: Option<String>,
}

/// Plan registered for an entity when it first starts applying.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct PlanHeader {
    /// Entity table.
    pub entity: String,
    /// Plan checksum (hex).
    pub checksum: String,
    /// Number of phases in the plan.
    pub total_phases: u32,
    /// When the plan was built (microseconds since epoch).
    pub created_at: u64,
    /// The plan itself, as JSON, so a resumed run replays the same phases.
    pub plan_document: String,
}

impl PlanHeader {
    /// Header for a plan.
    pub fn for_plan(plan: &PhasePlan) -> Result<Self, MigrationError> {
        Ok(Self {
            entity: plan.entity_name().to_string(),
            checksum: plan.checksum()?,
            total_phases: plan.last_ordinal(),
            created_at: plan.created_at,
            plan_document: plan.to_json()?,
        })
    }

    /// Decode the stored plan.
    pub fn plan(&self) -> Result<PhasePlan, MigrationError> {
        PhasePlan::from_json(&self.plan_document)
    }
}

/// A finished migration moved out of the active ledger.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct CompletedRun {
    /// Header of the completed plan.
    pub header: PlanHeader,
    /// Full entry log.
    pub entries: Vec<LedgerEntry>,
    /// When the run was archived (microseconds since epoch).
    pub completed_at: u64,
}

/// Durable, per-entity record of applied phases.
///
/// Implementations must make every write durable before returning and must
/// reject an `Applied` record that does not extend the applied prefix by one.
pub trait MigrationLedger: Send + Sync {
    /// Register the plan an entity is applying.
    fn register_plan(&self, header: &PlanHeader) -> Result<(), MigrationError>;

    /// Registered plan for an in-progress entity.
    fn plan_header(&self, entity: &str) -> Result<Option<PlanHeader>, MigrationError>;

    /// Record that a phase's action is about to run.
    fn record_pending(&self, entity: &str, ordinal: u32) -> Result<(), MigrationError>;

    /// Record that a phase committed and its postconditions hold.
    fn record_applied(&self, entity: &str, ordinal: u32) -> Result<(), MigrationError>;

    /// Record that a phase failed.
    fn record_failed(&self, entity: &str, ordinal: u32, reason: &str) -> Result<(), MigrationError>;

    /// Highest applied ordinal.
    fn last_applied(&self, entity: &str) -> Result<Option<u32>, MigrationError>;

    /// Every entry for an entity, in write order.
    fn entries(&self, entity: &str) -> Result<Vec<LedgerEntry>, MigrationError>;

    /// Persist the backfill cursor of a phase.
    fn save_cursor(&self, entity: &str, ordinal: u32, cursor: RowId) -> Result<(), MigrationError>;

    /// Stored backfill cursor of a phase.
    fn load_cursor(&self, entity: &str, ordinal: u32) -> Result<Option<RowId>, MigrationError>;

    /// Forget the backfill cursor of a phase.
    fn clear_cursor(&self, entity: &str, ordinal: u32) -> Result<(), MigrationError>;

    /// Move a completed migration out of the active ledger.
    fn archive(&self, entity: &str) -> Result<(), MigrationError>;

    /// Archived run for an entity.
    fn archived(&self, entity: &str) -> Result<Option<CompletedRun>, MigrationError>;

    /// Apply locks shared by every handle on this ledger.
    ///
    /// Executors take the entity's lock from here, so engines opened
    /// separately over the same ledger never run phases of one entity at once.
    fn apply_locks(&self) -> Arc<EntityLocks>;
}

/// Ledger persisted in sled trees with rkyv-encoded values.
pub struct SledLedger {
    db: sled::Db,
    entries: sled::Tree,
    plans: sled::Tree,
    cursors: sled::Tree,
    archive: sled::Tree,
    write_lock: Mutex<()>,
    locks: Arc<EntityLocks>,
}

impl SledLedger {
    /// Append-only phase log, keyed by entity and sequence number.
    pub const ENTRIES_TREE: &'static str = "ledger:entries";
    /// Registered plan headers, keyed by entity.
    pub const PLANS_TREE: &'static str = "ledger:plans";
    /// Backfill cursors, keyed by entity and ordinal.
    pub const CURSORS_TREE: &'static str = "ledger:cursors";
    /// Completed runs, keyed by entity.
    pub const ARCHIVE_TREE: &'static str = "ledger:archive";
    /// Ledger metadata.
    pub const META_TREE: &'static str = "ledger:meta";

    const ID_KEY: &'static [u8] = b"ledger_id";

    /// Open or create the ledger trees.
    ///
    /// Every handle opened on the same database shares one set of apply locks.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        let meta = db.open_tree(Self::META_TREE)?;
        let id = Self::ledger_id(&meta)?;
        Ok(Self {
            db: db.clone(),
            entries: db.open_tree(Self::ENTRIES_TREE)?,
            plans: db.open_tree(Self::PLANS_TREE)?,
            cursors: db.open_tree(Self::CURSORS_TREE)?,
            archive: db.open_tree(Self::ARCHIVE_TREE)?,
            write_lock: Mutex::new(()),
            locks: EntityLocks::shared(&id),
        })
    }

    /// Stable identity of the database, assigned on first open.
    fn ledger_id(meta: &sled::Tree) -> Result<String, MigrationError> {
        let fresh = uuid::Uuid::new_v4().to_string();
        // Losing the race to another opener is fine; the stored id wins.
        let _ = meta.compare_and_swap(Self::ID_KEY, None as Option<&[u8]>, Some(fresh.as_bytes()))?;
        let stored = meta
            .get(Self::ID_KEY)?
            .ok_or_else(|| MigrationError::Deserialization("ledger id missing".to_string()))?;
        String::from_utf8(stored.to_vec())
            .map_err(|_| MigrationError::Deserialization("ledger id is not UTF-8".to_string()))
    }

    /// Flush changes to disk.
    pub fn flush(&self) -> Result<(), MigrationError> {
        self.db.flush()?;
        Ok(())
    }

    fn entity_prefix(entity: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(entity.len() + 1);
        key.extend_from_slice(entity.as_bytes());
        key.push(0);
        key
    }

    fn entry_key(entity: &str, seq: u64) -> Vec<u8> {
        let mut key = Self::entity_prefix(entity);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn cursor_key(entity: &str, ordinal: u32) -> Vec<u8> {
        let mut key = Self::entity_prefix(entity);
        key.extend_from_slice(&ordinal.to_be_bytes());
        key
    }

    fn header_for(&self, entity: &str) -> Result<PlanHeader, MigrationError> {
        self.plan_header(entity)?
            .ok_or_else(|| MigrationError::LedgerInconsistency {
                entity: entity.to_string(),
                reason: "no plan registered".to_string(),
            })
    }

    fn append(
        &self,
        entity: &str,
        ordinal: u32,
        status: LedgerStatus,
        reason: Option<String>,
    ) -> Result<(), MigrationError> {
        let header = self.header_for(entity)?;
        if ordinal == 0 || ordinal > header.total_phases {
            return Err(MigrationError::LedgerInconsistency {
                entity: entity.to_string(),
                reason: format!("ordinal {} outside plan of {} phases", ordinal, header.total_phases),
            });
        }
        let entry = LedgerEntry {
            entity: entity.to_string(),
            ordinal,
            status,
            recorded_at: current_timestamp(),
            plan_checksum: header.checksum,
            reason,
        };
        let seq = self.db.generate_id()?;
        self.entries
            .insert(Self::entry_key(entity, seq), entry.to_bytes()?)?;
        self.entries.flush()?;
        Ok(())
    }
}

impl MigrationLedger for SledLedger {
    fn register_plan(&self, header: &PlanHeader) -> Result<(), MigrationError> {
        let _guard = self.write_lock.lock();
        if let Some(existing) = self.plan_header(&header.entity)? {
            if existing.checksum != header.checksum {
                return Err(MigrationError::LedgerInconsistency {
                    entity: header.entity.clone(),
                    reason: format!(
                        "plan {} is already in progress, refusing plan {}",
                        existing.checksum, header.checksum
                    ),
                });
            }
            return Ok(());
        }
        self.plans.insert(header.entity.as_bytes(), header.to_bytes()?)?;
        self.plans.flush()?;
        Ok(())
    }

    fn plan_header(&self, entity: &str) -> Result<Option<PlanHeader>, MigrationError> {
        match self.plans.get(entity.as_bytes())? {
            Some(bytes) => Ok(Some(PlanHeader::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn record_pending(&self, entity: &str, ordinal: u32) -> Result<(), MigrationError> {
        let _guard = self.write_lock.lock();
        self.append(entity, ordinal, LedgerStatus::Pending, None)
    }

    fn record_applied(&self, entity: &str, ordinal: u32) -> Result<(), MigrationError> {
        let _guard = self.write_lock.lock();
        let expected = self.last_applied(entity)?.unwrap_or(0) + 1;
        if ordinal != expected {
            return Err(MigrationError::LedgerInconsistency {
                entity: entity.to_string(),
                reason: format!(
                    "phase {} recorded applied but the next phase in order is {}",
                    ordinal, expected
                ),
            });
        }
        self.append(entity, ordinal, LedgerStatus::Applied, None)
    }

    fn record_failed(&self, entity: &str, ordinal: u32, reason: &str) -> Result<(), MigrationError> {
        let _guard = self.write_lock.lock();
        self.append(entity, ordinal, LedgerStatus::Failed, Some(reason.to_string()))
    }

    fn last_applied(&self, entity: &str) -> Result<Option<u32>, MigrationError> {
        Ok(self
            .entries(entity)?
            .into_iter()
            .filter(|e| e.status == LedgerStatus::Applied)
            .map(|e| e.ordinal)
            .max())
    }

    fn entries(&self, entity: &str) -> Result<Vec<LedgerEntry>, MigrationError> {
        let mut entries = Vec::new();
        for result in self.entries.scan_prefix(Self::entity_prefix(entity)) {
            let (_, value) = result?;
            entries.push(LedgerEntry::from_bytes(&value)?);
        }
        Ok(entries)
    }

    fn save_cursor(&self, entity: &str, ordinal: u32, cursor: RowId) -> Result<(), MigrationError> {
        self.cursors
            .insert(Self::cursor_key(entity, ordinal), cursor.to_be_bytes().to_vec())?;
        self.cursors.flush()?;
        Ok(())
    }

    fn load_cursor(&self, entity: &str, ordinal: u32) -> Result<Option<RowId>, MigrationError> {
        let Some(bytes) = self.cursors.get(Self::cursor_key(entity, ordinal))? else {
            return Ok(None);
        };
        let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
            MigrationError::Deserialization(format!("cursor for {} phase {} is corrupt", entity, ordinal))
        })?;
        Ok(Some(RowId::from_be_bytes(raw)))
    }

    fn clear_cursor(&self, entity: &str, ordinal: u32) -> Result<(), MigrationError> {
        self.cursors.remove(Self::cursor_key(entity, ordinal))?;
        Ok(())
    }

    fn archive(&self, entity: &str) -> Result<(), MigrationError> {
        let _guard = self.write_lock.lock();
        let header = self.header_for(entity)?;
        let run = CompletedRun {
            header,
            entries: self.entries(entity)?,
            completed_at: current_timestamp(),
        };
        self.archive.insert(entity.as_bytes(), run.to_bytes()?)?;

        let mut batch = sled::Batch::default();
        for result in self.entries.scan_prefix(Self::entity_prefix(entity)).keys() {
            batch.remove(result?);
        }
        self.entries.apply_batch(batch)?;

        let mut cursors = sled::Batch::default();
        for result in self.cursors.scan_prefix(Self::entity_prefix(entity)).keys() {
            cursors.remove(result?);
        }
        self.cursors.apply_batch(cursors)?;

        self.plans.remove(entity.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn apply_locks(&self) -> Arc<EntityLocks> {
        Arc::clone(&self.locks)
    }

    fn archived(&self, entity: &str) -> Result<Option<CompletedRun>, MigrationError> {
        match self.archive.get(entity.as_bytes())? {
            Some(bytes) => Ok(Some(CompletedRun::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}

macro_rules! rkyv_codec {
    ($($ty:ty),* $(,)?) => {$(
        impl $ty {
            /// Serialize to bytes.
            pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
                rkyv::to_bytes::<rkyv::rancor::Error>(self)
                    .map(|v| v.to_vec())
                    .map_err(|e| MigrationError::Serialization(e.to_string()))
            }

            /// Deserialize from bytes.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
                // sled values carry no alignment guarantee.
                let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
                aligned.extend_from_slice(bytes);
                rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
                    .map_err(|e| MigrationError::Deserialization(e.to_string()))
            }
        }
    )*};
}

rkyv_codec!(LedgerEntry, PlanHeader, CompletedRun);

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> SledLedger {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledLedger::open(&db).unwrap()
    }

    fn header(entity: &str, checksum: &str) -> PlanHeader {
        PlanHeader {
            entity: entity.to_string(),
            checksum: checksum.to_string(),
            total_phases: 5,
            created_at: current_timestamp(),
            plan_document: "{}".to_string(),
        }
    }

    #[test]
    fn test_handles_on_one_database_share_apply_locks() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let first = SledLedger::open(&db).unwrap();
        let second = SledLedger::open(&db).unwrap();
        assert!(Arc::ptr_eq(&first.apply_locks(), &second.apply_locks()));

        let _guard = first
            .apply_locks()
            .acquire("author", std::time::Duration::from_millis(10))
            .unwrap();
        assert!(second.apply_locks().is_locked("author"));

        let other = ledger();
        assert!(!other.apply_locks().is_locked("author"));
    }

    #[test]
    fn test_applied_prefix_is_monotonic() {
        let ledger = ledger();
        ledger.register_plan(&header("author", "abc")).unwrap();

        ledger.record_pending("author", 1).unwrap();
        ledger.record_applied("author", 1).unwrap();
        ledger.record_applied("author", 2).unwrap();
        assert_eq!(ledger.last_applied("author").unwrap(), Some(2));

        let err = ledger.record_applied("author", 4).unwrap_err();
        assert!(matches!(err, MigrationError::LedgerInconsistency { .. }));
        let err = ledger.record_applied("author", 2).unwrap_err();
        assert!(matches!(err, MigrationError::LedgerInconsistency { .. }));
    }

    #[test]
    fn test_entries_keep_write_order_and_checksum() {
        let ledger = ledger();
        ledger.register_plan(&header("author", "abc")).unwrap();
        ledger.record_pending("author", 1).unwrap();
        ledger.record_failed("author", 1, "boom").unwrap();
        ledger.record_pending("author", 1).unwrap();
        ledger.record_applied("author", 1).unwrap();

        let statuses: Vec<LedgerStatus> =
            ledger.entries("author").unwrap().iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                LedgerStatus::Pending,
                LedgerStatus::Failed,
                LedgerStatus::Pending,
                LedgerStatus::Applied
            ]
        );
        let entries = ledger.entries("author").unwrap();
        assert!(entries.iter().all(|e| e.plan_checksum == "abc"));
        assert_eq!(entries[1].reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_entities_are_isolated() {
        let ledger = ledger();
        ledger.register_plan(&header("author", "a")).unwrap();
        ledger.register_plan(&header("authority", "b")).unwrap();
        ledger.record_applied("author", 1).unwrap();

        assert_eq!(ledger.last_applied("author").unwrap(), Some(1));
        assert_eq!(ledger.last_applied("authority").unwrap(), None);
    }

    #[test]
    fn test_conflicting_plan_is_refused() {
        let ledger = ledger();
        ledger.register_plan(&header("author", "abc")).unwrap();
        ledger.register_plan(&header("author", "abc")).unwrap();

        let err = ledger.register_plan(&header("author", "def")).unwrap_err();
        assert!(matches!(err, MigrationError::LedgerInconsistency { .. }));
    }

    #[test]
    fn test_unregistered_entity_cannot_record() {
        let ledger = ledger();
        let err = ledger.record_applied("author", 1).unwrap_err();
        assert!(matches!(err, MigrationError::LedgerInconsistency { .. }));
    }

    #[test]
    fn test_cursor_roundtrip() {
        let ledger = ledger();
        assert_eq!(ledger.load_cursor("author", 2).unwrap(), None);
        ledger.save_cursor("author", 2, 1500).unwrap();
        assert_eq!(ledger.load_cursor("author", 2).unwrap(), Some(1500));
        ledger.clear_cursor("author", 2).unwrap();
        assert_eq!(ledger.load_cursor("author", 2).unwrap(), None);
    }

    #[test]
    fn test_archive_clears_active_state() {
        let ledger = ledger();
        ledger.register_plan(&header("author", "abc")).unwrap();
        ledger.record_applied("author", 1).unwrap();
        ledger.save_cursor("author", 2, 9).unwrap();

        ledger.archive("author").unwrap();

        assert!(ledger.plan_header("author").unwrap().is_none());
        assert!(ledger.entries("author").unwrap().is_empty());
        assert_eq!(ledger.load_cursor("author", 2).unwrap(), None);
        let run = ledger.archived("author").unwrap().unwrap();
        assert_eq!(run.header.checksum, "abc");
        assert_eq!(run.entries.len(), 1);
    }

    #[test]
    fn test_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let ledger = SledLedger::open(&db).unwrap();
            ledger.register_plan(&header("author", "abc")).unwrap();
            ledger.record_applied("author", 1).unwrap();
            ledger.flush().unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let ledger = SledLedger::open(&db).unwrap();
        assert_eq!(ledger.last_applied("author").unwrap(), Some(1));
        assert_eq!(ledger.plan_header("author").unwrap().unwrap().checksum, "abc");
    }
}
