//! Scheduled rotation of HSM resident keys.
//!
//! Keys that expired longer ago than the retention window are archived
//! into shared storage and then deleted from the device, freeing HSM key
//! storage. The ordering is the safety property of this module: a key is
//! locked before it is touched, and it is never deleted unless its
//! material was archived first.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

use crate::api::{JobReport, ManagementCode};
use crate::server::hsm::HsmConnector;
use crate::server::locks::{KeyOperationType, LockManager};
use crate::server::terminals::TerminalStore;

//------------ KeyRotationService --------------------------------------------

#[derive(Debug)]
pub struct KeyRotationService {
    hsm: Option<Arc<HsmConnector>>,
    terminals: Arc<TerminalStore>,
    locks: Arc<LockManager>,

    /// How long an expired key is retained before deletion, in days.
    retention_days: i64,

    /// Fallback validity window for keys without an expiration attribute,
    /// in days.
    validity_days: i64,

    /// Aliases this instance is currently operating on. The lock checker
    /// consults this to distinguish an in-flight lock from a leftover.
    in_flight: RwLock<HashSet<String>>,
}

impl KeyRotationService {
    pub fn new(
        hsm: Option<Arc<HsmConnector>>,
        terminals: Arc<TerminalStore>,
        locks: Arc<LockManager>,
        retention_days: i64,
        validity_days: i64,
    ) -> Self {
        KeyRotationService {
            hsm,
            terminals,
            locks,
            retention_days,
            validity_days,
            in_flight: RwLock::new(HashSet::new()),
        }
    }

    /// Whether this instance is currently working on the given key.
    pub fn is_working_on(&self, alias: &str) -> bool {
        self.in_flight.read().unwrap().contains(alias)
    }

    /// One rotation sweep over all keys in the HSM.
    pub fn rotate_keys(&self) -> JobReport {
        let mut report = JobReport::new("HSM key rotation");

        let hsm = match &self.hsm {
            Some(hsm) => hsm,
            None => {
                report.add_success("hsm", "HSM is not in use");
                return report;
            }
        };

        let aliases = match hsm.aliases() {
            Ok(aliases) => aliases,
            Err(e) => {
                report.add_failure(
                    "hsm",
                    ManagementCode::RemoteUnavailable,
                    format!("cannot enumerate HSM keys: {e}"),
                );
                return report;
            }
        };

        if aliases.is_empty() {
            report.add_success("hsm", "No keys present to delete");
            return report;
        }

        let now = Utc::now();
        let mut deleted = Vec::new();

        for alias in aliases {
            let expiration = match self.resolve_expiration(hsm, &alias) {
                Ok(expiration) => expiration,
                Err(message) => {
                    report.add_failure(&alias, ManagementCode::UnexpectedError, message);
                    continue;
                }
            };

            // keep keys that are still valid or within the retention
            // window after expiry
            if expiration > now - Duration::days(self.retention_days) {
                continue;
            }

            let lock = match self
                .locks
                .obtain_change_key_lock(&alias, KeyOperationType::Delete)
            {
                Ok(Some(lock)) => lock,
                Ok(None) => {
                    debug!("Key '{alias}' is locked, another instance is rotating it");
                    continue;
                }
                Err(e) => {
                    report.add_failure(
                        &alias,
                        ManagementCode::UnexpectedError,
                        format!("cannot obtain key lock: {e}"),
                    );
                    continue;
                }
            };

            self.in_flight.write().unwrap().insert(alias.clone());
            self.rotate_one(hsm, &alias, &mut report, &mut deleted);
            self.in_flight.write().unwrap().remove(&alias);

            if let Err(e) = self.locks.release_change_key_lock(&lock) {
                warn!("Cannot release key lock for '{alias}': {e}");
            }
        }

        if deleted.is_empty() {
            report.add_success("hsm", "No keys present to delete");
        } else {
            info!("Rotated HSM keys: {}", deleted.join(", "));
            report.add_success("hsm", format!("Deleted keys: {}", deleted.join(", ")));
        }

        report
    }

    /// Archive then delete. An archival failure preserves the key and is
    /// reported, but does not abort the rest of the sweep.
    fn rotate_one(
        &self,
        hsm: &HsmConnector,
        alias: &str,
        report: &mut JobReport,
        deleted: &mut Vec<String>,
    ) {
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

        match hsm.delete_key(alias) {
            Ok(()) => deleted.push(alias.to_string()),
            Err(e) => {
                report.add_failure(
                    alias,
                    ManagementCode::RemoteUnavailable,
                    format!("archived but could not delete: {e}"),
                );
            }
        }
    }

    fn resolve_expiration(&self, hsm: &HsmConnector, alias: &str) -> Result<DateTime<Utc>, String> {
        match hsm.expiration_date(alias) {
            Ok(Some(expiration)) => Ok(expiration),
            Ok(None) => {
                // the device does not track expiry for this key
                let generated_at = hsm
                    .generation_date(alias)
                    .map_err(|e| format!("cannot determine key age: {e}"))?;
                Ok(generated_at + Duration::days(self.validity_days))
            }
            Err(e) => Err(format!("cannot read expiration: {e}")),
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::storage::KeyValueStore;
    use crate::constants::{KEY_ARCHIVE_NS, LOCKS_NS, TERMINALS_NS};
    use crate::server::hsm::{MockHsm, MockHsmOp};
    use crate::test;

    fn service(
        hsm: Option<Arc<HsmConnector>>,
        storage: &url::Url,
    ) -> (KeyRotationService, Arc<TerminalStore>, Arc<LockManager>) {
        let terminals = Arc::new(TerminalStore::new(
            Arc::new(KeyValueStore::create(storage, TERMINALS_NS).unwrap()),
            Arc::new(KeyValueStore::create(storage, KEY_ARCHIVE_NS).unwrap()),
        ));
        let locks = Arc::new(LockManager::new(
            Arc::new(KeyValueStore::create(storage, LOCKS_NS).unwrap()),
            "instance-a".to_string(),
            5,
        ));
        let service = KeyRotationService::new(hsm, terminals.clone(), locks.clone(), 2, 90);
        (service, terminals, locks)
    }

    #[test]
    fn no_hsm_is_a_successful_no_op() {
        let storage = test::mem_storage();
        let (service, _, _) = service(None, &storage);

        let report = service.rotate_keys();
        assert!(report.success());
        assert_eq!(report.entries()[0].message.detail(), "HSM is not in use");
    }

    #[test]
    fn empty_hsm_reports_nothing_to_delete() {
        let storage = test::mem_storage();
        let hsm = Arc::new(HsmConnector::Mock(MockHsm::new()));
        let (service, _, _) = service(Some(hsm), &storage);

        let report = service.rotate_keys();
        assert!(report.success());
        assert_eq!(report.entries()[0].message.detail(), "No keys present to delete");
    }

    #[test]
    fn expired_key_is_archived_then_deleted_and_valid_key_is_kept() {
        let storage = test::mem_storage();
        let mock = MockHsm::new();
        // expired three days ago, retention is two days: delete
        mock.insert_key(
            "old-key",
            Utc::now() - Duration::days(100),
            Some(Utc::now() - Duration::days(3)),
        );
        // valid for another two days: never touched
        mock.insert_key(
            "fresh-key",
            Utc::now() - Duration::days(100),
            Some(Utc::now() + Duration::days(2)),
        );

        let hsm = Arc::new(HsmConnector::Mock(mock));
        let (service, terminals, _) = service(Some(hsm.clone()), &storage);

        let report = service.rotate_keys();
        assert!(report.success());

        let HsmConnector::Mock(mock) = hsm.as_ref() else {
            unreachable!()
        };

        // exported exactly once, deleted exactly once, archive before delete
        assert_eq!(
            mock.ops(),
            vec![
                MockHsmOp::Export("old-key".to_string()),
                MockHsmOp::Delete("old-key".to_string()),
            ]
        );
        assert!(terminals.archived_key("old-key").unwrap().is_some());
        assert!(mock.contains_key("fresh-key").unwrap());
        assert!(!mock.contains_key("old-key").unwrap());
    }

    #[test]
    fn generation_date_fallback_applies_when_attribute_unsupported() {
        let storage = test::mem_storage();
        let mock = MockHsm::without_expiration_attribute();
        // generated 100 days ago with a 90 day fallback window: expired
        // more than the 2 retention days ago, so deleted
        mock.insert_key("aged-key", Utc::now() - Duration::days(100), None);
        // generated yesterday: kept
        mock.insert_key("young-key", Utc::now() - Duration::days(1), None);

        let hsm = Arc::new(HsmConnector::Mock(mock));
        let (service, _, _) = service(Some(hsm.clone()), &storage);

        let report = service.rotate_keys();
        assert!(report.success());

        let HsmConnector::Mock(mock) = hsm.as_ref() else {
            unreachable!()
        };
        assert!(!mock.contains_key("aged-key").unwrap());
        assert!(mock.contains_key("young-key").unwrap());
    }

    #[test]
    fn archival_failure_preserves_the_key() {
        let storage = test::mem_storage();
        let mock = MockHsm::new();
        mock.insert_key(
            "stuck-key",
            Utc::now() - Duration::days(100),
            Some(Utc::now() - Duration::days(30)),
        );
        mock.make_unextractable("stuck-key");

        let hsm = Arc::new(HsmConnector::Mock(mock));
        let (service, terminals, locks) = service(Some(hsm.clone()), &storage);

        let report = service.rotate_keys();
        assert!(!report.success());

        let failure = report
            .entries()
            .iter()
            .find(|entry| entry.subject == "stuck-key")
            .unwrap();
        assert_eq!(failure.message.code(), ManagementCode::KeyArchival);

        let HsmConnector::Mock(mock) = hsm.as_ref() else {
            unreachable!()
        };
        // never deleted, nothing archived
        assert!(mock.contains_key("stuck-key").unwrap());
        assert!(terminals.archived_key("stuck-key").unwrap().is_none());
        // the lock was released for the reconciler to never see
        assert!(locks.change_key_locks().unwrap().is_empty());
    }

    #[test]
    fn locked_key_is_skipped() {
        let storage = test::mem_storage();
        let mock = MockHsm::new();
        mock.insert_key(
            "contested-key",
            Utc::now() - Duration::days(100),
            Some(Utc::now() - Duration::days(30)),
        );

        // another instance already holds the lock
        let other_locks = LockManager::new(
            Arc::new(KeyValueStore::create(&storage, LOCKS_NS).unwrap()),
            "instance-b".to_string(),
            5,
        );
        other_locks
            .obtain_change_key_lock("contested-key", KeyOperationType::Delete)
            .unwrap()
            .unwrap();

        let hsm = Arc::new(HsmConnector::Mock(mock));
        let (service, _, _) = service(Some(hsm.clone()), &storage);

        let report = service.rotate_keys();
        // a refused lock is a normal outcome, not a failure
        assert!(report.success());

        let HsmConnector::Mock(mock) = hsm.as_ref() else {
            unreachable!()
        };
        assert!(mock.contains_key("contested-key").unwrap());
        assert!(mock.ops().is_empty());
    }
}
