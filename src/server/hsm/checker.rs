//! Repairs key locks left behind by crashed or slow instances.
//!
//! Two cases exist. A lock owned by this instance that the rotation
//! service is no longer working on is a leftover from an earlier run and
//! gets released. A lock owned by another instance is re-obtained; if
//! that succeeds the lock was stale, its owner is gone, and this instance
//! finishes the operation the owner intended.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::api::{JobReport, ManagementCode};
use crate::server::hsm::HsmConnector;
use crate::server::hsm::rotation::KeyRotationService;
use crate::server::locks::{ChangeKeyLock, KeyOperationType, LockManager};
use crate::server::terminals::TerminalStore;

//------------ KeyLockChecker ------------------------------------------------

#[derive(Debug)]
pub struct KeyLockChecker {
    hsm: Option<Arc<HsmConnector>>,
    rotation: Arc<KeyRotationService>,
    locks: Arc<LockManager>,
    terminals: Arc<TerminalStore>,
}

impl KeyLockChecker {
    pub fn new(
        hsm: Option<Arc<HsmConnector>>,
        rotation: Arc<KeyRotationService>,
        locks: Arc<LockManager>,
        terminals: Arc<TerminalStore>,
    ) -> Self {
        KeyLockChecker {
            hsm,
            rotation,
            locks,
            terminals,
        }
    }

    /// One reconciliation sweep over all stored key locks.
    pub fn check_locks(&self) -> JobReport {
        let mut report = JobReport::new("key lock check");

        let all_locks = match self.locks.change_key_locks() {
            Ok(locks) => locks,
            Err(e) => {
                report.add_failure(
                    "locks",
                    ManagementCode::UnexpectedError,
                    format!("cannot enumerate key locks: {e}"),
                );
                return report;
            }
        };

        for lock in all_locks {
            if lock.owner() == self.locks.owner() {
                self.check_own_lock(&lock, &mut report);
            } else {
                self.check_foreign_lock(&lock, &mut report);
            }
        }

        report
    }

    /// A lock of our own that no job is working on anymore: the run it
    /// belonged to finished or died, either way the lock can go.
    fn check_own_lock(&self, lock: &ChangeKeyLock, report: &mut JobReport) {
        if self.rotation.is_working_on(lock.key_name()) {
            debug!("Lock for '{}' is in active use", lock.key_name());
            return;
        }

        match self.locks.release_change_key_lock(lock) {
            Ok(true) => {
                info!("Released leftover own lock for '{}'", lock.key_name());
                report.add_success(lock.key_name(), "released leftover lock");
            }
            Ok(false) => {
                // someone stole it in the meantime; their problem now
                debug!("Own lock for '{}' already changed hands", lock.key_name());
            }
            Err(e) => {
                report.add_failure(
                    lock.key_name(),
                    ManagementCode::UnexpectedError,
                    format!("cannot release own lock: {e}"),
                );
            }
        }
    }

    /// A lock held by another instance. Re-obtaining it succeeds only
    /// when it is stale; in that case the abandoned operation is carried
    /// out here.
    fn check_foreign_lock(&self, lock: &ChangeKeyLock, report: &mut JobReport) {
        let stolen = match self
            .locks
            .obtain_change_key_lock(lock.key_name(), lock.operation())
        {
            Ok(Some(stolen)) => stolen,
            Ok(None) => {
                debug!(
                    "Lock for '{}' held by '{}' is still fresh",
                    lock.key_name(),
                    lock.owner()
                );
                return;
            }
            Err(e) => {
                report.add_failure(
                    lock.key_name(),
                    ManagementCode::UnexpectedError,
                    format!("cannot re-obtain lock: {e}"),
                );
                return;
            }
        };

        info!(
            "Took over stale lock for '{}' from '{}' to {}",
            lock.key_name(),
            lock.owner(),
            lock.operation()
        );

        match lock.operation() {
            KeyOperationType::Delete => self.finish_delete(lock.key_name(), report),
            KeyOperationType::Distribute => self.finish_distribute(lock.key_name(), report),
        }

        if let Err(e) = self.locks.release_change_key_lock(&stolen) {
            warn!("Cannot release taken over lock for '{}': {e}", lock.key_name());
        }
    }

    fn finish_delete(&self, alias: &str, report: &mut JobReport) {
        let hsm = match &self.hsm {
            Some(hsm) => hsm,
            None => {
                report.add_failure(
                    alias,
                    ManagementCode::ConfigurationError,
                    "lock requires HSM operation but HSM is not in use",
                );
                return;
            }
        };

        match hsm.contains_key(alias) {
            Ok(false) => {
                // the owner got as far as deleting before it died
                report.add_success(alias, "key already deleted");
                return;
            }
            Ok(true) => {}
            Err(e) => {
                report.add_failure(
                    alias,
                    ManagementCode::RemoteUnavailable,
                    format!("cannot check key: {e}"),
                );
                return;
            }
        }

        // same rule as rotation itself: no deletion without an archived
        // copy of the material
        let archived = match self.terminals.archived_key(alias) {
            Ok(archived) => archived.is_some(),
            Err(e) => {
                report.add_failure(
                    alias,
                    ManagementCode::UnexpectedError,
                    format!("cannot check archive: {e}"),
                );
                return;
            }
        };
        if !archived {
            let material = match hsm.export_key(alias) {
                Ok(material) => material,
                Err(e) => {
                    report.add_failure(
                        alias,
                        ManagementCode::KeyArchival,
                        format!("cannot export key material, key is kept: {e}"),
                    );
                    return;
                }
            };
            if let Err(e) = self.terminals.archive_key(alias, &material) {
                report.add_failure(
                    alias,
                    ManagementCode::KeyArchival,
                    format!("cannot archive key material, key is kept: {e}"),
                );
                return;
            }
        }

        match hsm.delete_key(alias) {
            Ok(()) => report.add_success(alias, "finished abandoned delete"),
            Err(e) => report.add_failure(
                alias,
                ManagementCode::RemoteUnavailable,
                format!("cannot delete key: {e}"),
            ),
        }
    }

    fn finish_distribute(&self, alias: &str, report: &mut JobReport) {
        let hsm = match &self.hsm {
            Some(hsm) => hsm,
            None => {
                report.add_failure(
                    alias,
                    ManagementCode::ConfigurationError,
                    "lock requires HSM operation but HSM is not in use",
                );
                return;
            }
        };

        let material = match self.terminals.archived_key(alias) {
            Ok(Some(material)) => material,
            Ok(None) => {
                report.add_failure(
                    alias,
                    ManagementCode::KeyArchival,
                    "no archived material to distribute",
                );
                return;
            }
            Err(e) => {
                report.add_failure(
                    alias,
                    ManagementCode::UnexpectedError,
                    format!("cannot read archive: {e}"),
                );
                return;
            }
        };

        match hsm.import_key(alias, &material) {
            Ok(()) => report.add_success(alias, "distributed key to local HSM"),
            Err(e) => report.add_failure(
                alias,
                ManagementCode::RemoteUnavailable,
                format!("cannot import key: {e}"),
            ),
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::commons::storage::KeyValueStore;
    use crate::constants::{KEY_ARCHIVE_NS, LOCKS_NS, TERMINALS_NS};
    use crate::server::hsm::MockHsm;
    use crate::test;

    fn terminals(storage: &url::Url) -> Arc<TerminalStore> {
        Arc::new(TerminalStore::new(
            Arc::new(KeyValueStore::create(storage, TERMINALS_NS).unwrap()),
            Arc::new(KeyValueStore::create(storage, KEY_ARCHIVE_NS).unwrap()),
        ))
    }

    fn lock_manager(owner: &str, stale_minutes: i64, storage: &url::Url) -> Arc<LockManager> {
        Arc::new(LockManager::new(
            Arc::new(KeyValueStore::create(storage, LOCKS_NS).unwrap()),
            owner.to_string(),
            stale_minutes,
        ))
    }

    fn checker(
        hsm: Option<Arc<HsmConnector>>,
        locks: Arc<LockManager>,
        terminals: Arc<TerminalStore>,
    ) -> KeyLockChecker {
        let rotation = Arc::new(KeyRotationService::new(
            hsm.clone(),
            terminals.clone(),
            locks.clone(),
            2,
            90,
        ));
        KeyLockChecker::new(hsm, rotation, locks, terminals)
    }

    #[test]
    fn own_leftover_lock_is_released() {
        let storage = test::mem_storage();
        let locks = lock_manager("instance-a", 5, &storage);
        let terminals = terminals(&storage);

        locks
            .obtain_change_key_lock("key-1", KeyOperationType::Delete)
            .unwrap()
            .unwrap();

        let hsm = Arc::new(HsmConnector::Mock(MockHsm::new()));
        let checker = checker(Some(hsm), locks.clone(), terminals);

        let report = checker.check_locks();
        assert!(report.success());
        assert!(locks.change_key_locks().unwrap().is_empty());
    }

    #[test]
    fn fresh_foreign_lock_is_left_alone() {
        let storage = test::mem_storage();
        let other = lock_manager("instance-b", 5, &storage);
        other
            .obtain_change_key_lock("key-1", KeyOperationType::Delete)
            .unwrap()
            .unwrap();

        let locks = lock_manager("instance-a", 5, &storage);
        let terminals = terminals(&storage);
        let hsm = Arc::new(HsmConnector::Mock(MockHsm::new()));
        let checker = checker(Some(hsm), locks.clone(), terminals);

        let report = checker.check_locks();
        assert!(report.is_empty());
        assert_eq!(locks.change_key_locks().unwrap().len(), 1);
    }

    #[test]
    fn stale_foreign_delete_is_finished() {
        let storage = test::mem_storage();
        let other = lock_manager("instance-b", 5, &storage);
        other
            .obtain_change_key_lock("key-1", KeyOperationType::Delete)
            .unwrap()
            .unwrap();

        let mock = MockHsm::new();
        mock.insert_key("key-1", Utc::now(), None);
        let hsm = Arc::new(HsmConnector::Mock(mock));

        // with a zero staleness threshold the foreign lock counts as
        // abandoned immediately
        let locks = lock_manager("instance-a", 0, &storage);
        let terminals = terminals(&storage);
        let checker = checker(Some(hsm.clone()), locks.clone(), terminals.clone());

        let report = checker.check_locks();
        assert!(report.success());

        let HsmConnector::Mock(mock) = hsm.as_ref() else {
            unreachable!()
        };
        assert!(!mock.contains_key("key-1").unwrap());
        // archived before the takeover deletion, and the lock is gone
        assert!(terminals.archived_key("key-1").unwrap().is_some());
        assert!(locks.change_key_locks().unwrap().is_empty());
    }

    #[test]
    fn stale_foreign_distribute_imports_the_archived_key() {
        let storage = test::mem_storage();
        let other = lock_manager("instance-b", 5, &storage);
        other
            .obtain_change_key_lock("key-1", KeyOperationType::Distribute)
            .unwrap()
            .unwrap();

        let terminals = terminals(&storage);
        terminals.archive_key("key-1", b"archived material").unwrap();

        let hsm = Arc::new(HsmConnector::Mock(MockHsm::new()));
        let locks = lock_manager("instance-a", 0, &storage);
        let checker = checker(Some(hsm.clone()), locks.clone(), terminals);

        let report = checker.check_locks();
        assert!(report.success());

        let HsmConnector::Mock(mock) = hsm.as_ref() else {
            unreachable!()
        };
        assert!(mock.contains_key("key-1").unwrap());
        assert_eq!(mock.export_key("key-1").unwrap(), b"archived material");
        assert!(locks.change_key_locks().unwrap().is_empty());
    }
}
