//! Per-entity apply locks.
//!
//! Only one executor may run phases for a given entity at a time. Different
//! entities proceed concurrently.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use crate::error::MigrationError;

/// Registry of per-entity mutexes.
#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds the apply role for one entity until dropped.
pub struct EntityGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl EntityLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry for the ledger identified by `ledger_id`.
    pub fn shared(ledger_id: &str) -> Arc<Self> {
        static SHARED: OnceLock<DashMap<String, Arc<EntityLocks>>> = OnceLock::new();
        SHARED
            .get_or_init(DashMap::new)
            .entry(ledger_id.to_string())
            .or_insert_with(|| Arc::new(Self::new()))
            .clone()
    }

    fn mutex(&self, entity: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(entity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take the lock for `entity`, waiting at most `timeout`.
    pub fn acquire(&self, entity: &str, timeout: Duration) -> Result<EntityGuard, MigrationError> {
        let guard = self
            .mutex(entity)
            .try_lock_arc_for(timeout)
            .ok_or_else(|| MigrationError::EntityLocked {
                entity: entity.to_string(),
            })?;
        Ok(EntityGuard { _guard: guard })
    }

    /// Whether some executor currently holds the lock for `entity`.
    pub fn is_locked(&self, entity: &str) -> bool {
        self.locks
            .get(entity)
            .map(|m| m.is_locked())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_times_out() {
        let locks = EntityLocks::new();
        let guard = locks.acquire("author", Duration::from_millis(10)).unwrap();
        assert!(locks.is_locked("author"));

        let err = locks.acquire("author", Duration::from_millis(10)).err().unwrap();
        assert!(matches!(err, MigrationError::EntityLocked { .. }));

        drop(guard);
        assert!(!locks.is_locked("author"));
        assert!(locks.acquire("author", Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_shared_registry_per_ledger() {
        let a = EntityLocks::shared("ledger-a");
        assert!(Arc::ptr_eq(&a, &EntityLocks::shared("ledger-a")));
        assert!(!Arc::ptr_eq(&a, &EntityLocks::shared("ledger-b")));
    }

    #[test]
    fn test_entities_lock_independently() {
        let locks = EntityLocks::new();
        let _author = locks.acquire("author", Duration::from_millis(10)).unwrap();
        assert!(locks.acquire("publisher", Duration::from_millis(10)).is_ok());
    }
}
