//! Leased locks shared by all instances of the cluster.
//!
//! A lock is a row in shared storage. Acquisition inserts the row if it is
//! absent, refuses while a fresh row exists, and overwrites ("steals") a
//! row whose age exceeds the staleness threshold. Release deletes the row
//! only if it still matches the lock that was handed out, so an instance
//! can never release a lock that has changed hands. There is no consensus
//! round anywhere in this: stale takeover tolerates lost updates by
//! design.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::commons::storage::{Key, KeyValueStore, Scope, Segment, SegmentBuf};
use crate::commons::{EidResult, Error};

//------------ KeyOperationType ----------------------------------------------

/// What the holder of a [`ChangeKeyLock`] intends to do with the key.
///
/// The reconciler performs this operation when it takes over an abandoned
/// lock from a crashed instance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyOperationType {
    Delete,
    Distribute,
}

impl fmt::Display for KeyOperationType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyOperationType::Delete => write!(f, "delete"),
            KeyOperationType::Distribute => write!(f, "distribute"),
        }
    }
}

//------------ CvcUpdateLock -------------------------------------------------

/// Exclusive access to one service provider's renewal path.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CvcUpdateLock {
    service_provider: String,
    locked_at: i64,
}

impl CvcUpdateLock {
    pub fn service_provider(&self) -> &str {
        &self.service_provider
    }

    pub fn locked_at(&self) -> i64 {
        self.locked_at
    }
}

//------------ ChangeKeyLock -------------------------------------------------

/// Exclusive access to one HSM resident key, for one operation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChangeKeyLock {
    key_name: String,
    owner: String,
    locked_at: i64,
    operation: KeyOperationType,
}

impl ChangeKeyLock {
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn locked_at(&self) -> i64 {
        self.locked_at
    }

    pub fn operation(&self) -> KeyOperationType {
        self.operation
    }
}

//------------ LockManager ---------------------------------------------------

const CVC_SCOPE: &Segment = Segment::make("cvc");
const KEY_SCOPE: &Segment = Segment::make("key");

/// Hands out the two lock families backed by shared storage.
#[derive(Debug)]
pub struct LockManager {
    kv: Arc<KeyValueStore>,

    /// The identity under which this instance takes locks.
    owner: String,

    /// Age in minutes above which an unreleased lock counts as abandoned.
    stale_minutes: i64,
}

impl LockManager {
    pub fn new(kv: Arc<KeyValueStore>, owner: String, stale_minutes: i64) -> Self {
        LockManager {
            kv,
            owner,
            stale_minutes,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn is_stale(&self, locked_at: i64) -> bool {
        Utc::now().timestamp_millis() - locked_at >= self.stale_minutes * 60_000
    }

    fn cvc_lock_key(provider: &str) -> Key {
        Key::new_scoped(
            Scope::from_segment(CVC_SCOPE),
            SegmentBuf::parse_lossy(provider),
        )
    }

    fn change_key_lock_key(key_name: &str) -> Key {
        Key::new_scoped(
            Scope::from_segment(KEY_SCOPE),
            SegmentBuf::parse_lossy(key_name),
        )
    }
}

/// # The per provider renewal lock
impl LockManager {
    /// Tries to take the renewal lock for the given provider.
    ///
    /// Returns `None` if another instance holds a fresh lock. That is a
    /// normal outcome, not an error: the other instance is doing the work.
    pub fn obtain_cvc_update_lock(&self, provider: &str) -> EidResult<Option<CvcUpdateLock>> {
        let key = Self::cvc_lock_key(provider);
        let new_lock = CvcUpdateLock {
            service_provider: provider.to_string(),
            locked_at: Utc::now().timestamp_millis(),
        };

        self.kv
            .execute(key.scope(), |kv| {
                if let Some(value) = kv.get(&key)? {
                    let existing: CvcUpdateLock = serde_json::from_value(value)?;
                    if !self.is_stale(existing.locked_at) {
                        return Ok(None);
                    }
                }
                kv.store(&key, serde_json::to_value(&new_lock)?)?;
                Ok(Some(new_lock.clone()))
            })
            .map_err(Error::from)
    }

    /// Releases a previously obtained renewal lock.
    ///
    /// Only succeeds if the stored lock is still the one that was handed
    /// out; a superseded lock is left alone and `false` is returned.
    pub fn release_cvc_update_lock(&self, lock: &CvcUpdateLock) -> EidResult<bool> {
        let key = Self::cvc_lock_key(&lock.service_provider);

        self.kv
            .execute(key.scope(), |kv| {
                if let Some(value) = kv.get(&key)? {
                    let stored: CvcUpdateLock = serde_json::from_value(value)?;
                    if &stored == lock {
                        kv.delete(&key)?;
                        return Ok(true);
                    }
                }
                Ok(false)
            })
            .map_err(Error::from)
    }
}

/// # The per HSM key lock
impl LockManager {
    /// Tries to take the lock for the named HSM key.
    pub fn obtain_change_key_lock(
        &self,
        key_name: &str,
        operation: KeyOperationType,
    ) -> EidResult<Option<ChangeKeyLock>> {
        let key = Self::change_key_lock_key(key_name);
        let new_lock = ChangeKeyLock {
            key_name: key_name.to_string(),
            owner: self.owner.clone(),
            locked_at: Utc::now().timestamp_millis(),
            operation,
        };

        self.kv
            .execute(key.scope(), |kv| {
                if let Some(value) = kv.get(&key)? {
                    let existing: ChangeKeyLock = serde_json::from_value(value)?;
                    if !self.is_stale(existing.locked_at) {
                        return Ok(None);
                    }
                }
                kv.store(&key, serde_json::to_value(&new_lock)?)?;
                Ok(Some(new_lock.clone()))
            })
            .map_err(Error::from)
    }

    /// Releases a previously obtained key lock. See
    /// [`release_cvc_update_lock`][Self::release_cvc_update_lock] for the
    /// compare-then-delete contract.
    pub fn release_change_key_lock(&self, lock: &ChangeKeyLock) -> EidResult<bool> {
        let key = Self::change_key_lock_key(&lock.key_name);

        self.kv
            .execute(key.scope(), |kv| {
                if let Some(value) = kv.get(&key)? {
                    let stored: ChangeKeyLock = serde_json::from_value(value)?;
                    if &stored == lock {
                        kv.delete(&key)?;
                        return Ok(true);
                    }
                }
                Ok(false)
            })
            .map_err(Error::from)
    }

    /// Returns all currently stored key locks, whoever owns them.
    pub fn change_key_locks(&self) -> EidResult<Vec<ChangeKeyLock>> {
        let scope = Scope::from_segment(KEY_SCOPE);
        let mut locks = Vec::new();
        for key in self.kv.keys(&scope, "")? {
            if let Some(lock) = self.kv.get::<ChangeKeyLock>(&key)? {
                locks.push(lock);
            }
        }
        Ok(locks)
    }
}

//------------ Tests ---------------------------------------------------------
