use std::fmt;

use log::trace;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::commons::error::FatalIoError;
use crate::commons::storage::{Disk, Key, Memory, Namespace, Scope};

//------------ KeyValueStore -------------------------------------------------

/// A store for key value pairs within one namespace.
///
/// All mutation of shared state in eidgate goes through a store like this.
/// The `execute` function runs a closure under an exclusive per-scope lock
/// so that read-modify-write sequences — lock acquisition, block list
/// version bumps, pending request transitions — are atomic with respect
/// to other instances using the same storage.
#[derive(Debug)]
pub enum KeyValueStore {
    Memory(Memory),
    Disk(Disk),
}

// # Construct and high level functions.
impl KeyValueStore {
    /// Creates a new KeyValueStore.
    pub fn create(storage_uri: &Url, namespace: &Namespace) -> Result<Self, KeyValueError> {
        match storage_uri.scheme() {
            "local" => {
                let path = format!(
                    "{}{}",
                    storage_uri.host_str().unwrap_or_default(),
                    storage_uri.path()
                );

                Ok(KeyValueStore::Disk(Disk::new(&path, namespace.as_str())?))
            }
            "memory" => Ok(KeyValueStore::Memory(Memory::new(
                storage_uri.host_str(),
                namespace.to_owned(),
            )?)),
            scheme => Err(KeyValueError::UnknownScheme(scheme.to_owned())),
        }
    }

    /// Returns true if this KeyValueStore (with this namespace) has any
    /// entries.
    pub fn is_empty(&self) -> Result<bool, KeyValueError> {
        match self {
            KeyValueStore::Memory(memory) => memory.is_empty(),
            KeyValueStore::Disk(disk) => disk.is_empty(),
        }
    }

    /// Wipe the complete store. Needless to say perhaps.. use with care..
    pub fn wipe(&self) -> Result<(), KeyValueError> {
        self.execute(&Scope::global(), |kv| kv.clear())
    }

    /// Execute one or more [`KeyValueStoreDispatcher`] operations within a
    /// scope lock context inside the given closure.
    ///
    /// The closure needs to return a `Result<T, KeyValueError>`. This
    /// allows the caller to simply use the ? operator on any kv calls that
    /// could result in an error within the closure.
    pub fn execute<F, T>(&self, scope: &Scope, op: F) -> Result<T, KeyValueError>
    where
        F: FnOnce(&KeyValueStoreDispatcher) -> Result<T, KeyValueError>,
    {
        match self {
            KeyValueStore::Memory(memory) => memory.execute(scope, op),
            KeyValueStore::Disk(disk) => disk.execute(scope, op),
        }
    }
}

// # Keys and Values
impl KeyValueStore {
    /// Stores a key value pair, serialized as json, overwrite existing.
    pub fn store<V: Serialize>(&self, key: &Key, value: &V) -> Result<(), KeyValueError> {
        self.execute(key.scope(), |kv: &KeyValueStoreDispatcher| {
            kv.store(key, serde_json::to_value(value)?)
        })
    }

    /// Stores a key value pair, serialized as json, fails if existing.
    pub fn store_new<V: Serialize>(&self, key: &Key, value: &V) -> Result<(), KeyValueError> {
        self.execute(key.scope(), |kv: &KeyValueStoreDispatcher| match kv.get(key)? {
            None => kv.store(key, serde_json::to_value(value)?),
            _ => Err(KeyValueError::DuplicateKey(key.clone())),
        })
    }

    /// Gets a value for a key, returns an error if the value cannot be
    /// deserialized, returns None if it cannot be found.
    pub fn get<V: DeserializeOwned>(&self, key: &Key) -> Result<Option<V>, KeyValueError> {
        self.execute(key.scope(), |kv| {
            if let Some(value) = kv.get(key)? {
                trace!("got value for key: {key}");
                Ok(Some(serde_json::from_value(value)?))
            } else {
                trace!("got nothing for key: {key}");
                Ok(None)
            }
        })
    }

    /// Returns whether a key exists.
    pub fn has(&self, key: &Key) -> Result<bool, KeyValueError> {
        self.execute(key.scope(), |kv| kv.has(key))
    }

    /// Delete a key-value pair.
    pub fn drop_key(&self, key: &Key) -> Result<(), KeyValueError> {
        self.execute(key.scope(), |kv| kv.delete(key))
    }

    /// Returns all keys under a scope (scopes are exact strings,
    /// 'sub'-scopes would need to be specified explicitly.. e.g. 'ca' and
    /// 'ca/archived' are two distinct scopes.
    ///
    /// If matching is not empty then the key must contain the given `&str`.
    pub fn keys(&self, scope: &Scope, matching: &str) -> Result<Vec<Key>, KeyValueError> {
        self.execute(scope, |kv| {
            kv.list_keys(scope).map(|keys| {
                keys.into_iter()
                    .filter(|key| {
                        key.scope() == scope
                            && (matching.is_empty() || key.name().as_str().contains(matching))
                    })
                    .collect()
            })
        })
    }

}

// # Scopes
impl KeyValueStore {
    /// Returns whether a scope exists.
    pub fn has_scope(&self, scope: &Scope) -> Result<bool, KeyValueError> {
        self.execute(&Scope::global(), |kv| kv.has_scope(scope))
    }

    /// Delete a scope.
    pub fn drop_scope(&self, scope: &Scope) -> Result<(), KeyValueError> {
        self.execute(scope, |kv| kv.delete_scope(scope))
    }
}

impl fmt::Display for KeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValueStore::Memory(memory) => memory.fmt(f),
            KeyValueStore::Disk(disk) => disk.fmt(f),
        }
    }
}

//------------ KeyValueStoreDispatcher ---------------------------------------

/// Gives access to the backend within an `execute` section.
#[derive(Debug)]
pub enum KeyValueStoreDispatcher<'a> {
    Memory(&'a Memory),
    Disk(&'a Disk),
}

impl KeyValueStoreDispatcher<'_> {
    pub fn has(&self, key: &Key) -> StorageResult<bool> {
        match self {
            KeyValueStoreDispatcher::Memory(m) => m.has(key),
            KeyValueStoreDispatcher::Disk(d) => d.has(key),
        }
    }

    fn has_scope(&self, scope: &Scope) -> StorageResult<bool> {
        match self {
            KeyValueStoreDispatcher::Memory(m) => m.has_scope(scope),
            KeyValueStoreDispatcher::Disk(d) => d.has_scope(scope),
        }
    }

    pub fn get(&self, key: &Key) -> StorageResult<Option<Value>> {
        match self {
            KeyValueStoreDispatcher::Memory(m) => m.get(key),
            KeyValueStoreDispatcher::Disk(d) => d.get(key),
        }
    }

    pub fn list_keys(&self, scope: &Scope) -> StorageResult<Vec<Key>> {
        match self {
            KeyValueStoreDispatcher::Memory(m) => m.list_keys(scope),
            KeyValueStoreDispatcher::Disk(d) => d.list_keys(scope),
        }
    }

    /// Store a value.
    pub fn store(&self, key: &Key, value: Value) -> StorageResult<()> {
        match self {
            KeyValueStoreDispatcher::Memory(m) => m.store(key, value),
            KeyValueStoreDispatcher::Disk(d) => d.store(key, value),
        }
    }

    /// Delete a value for a key.
    pub fn delete(&self, key: &Key) -> StorageResult<()> {
        match self {
            KeyValueStoreDispatcher::Memory(m) => m.delete(key),
            KeyValueStoreDispatcher::Disk(d) => d.delete(key),
        }
    }

    /// Delete all values for a scope.
    pub fn delete_scope(&self, scope: &Scope) -> StorageResult<()> {
        match self {
            KeyValueStoreDispatcher::Memory(m) => m.delete_scope(scope),
            KeyValueStoreDispatcher::Disk(d) => d.delete_scope(scope),
        }
    }

    /// Delete all values within the namespace of this store.
    fn clear(&self) -> StorageResult<()> {
        match self {
            KeyValueStoreDispatcher::Memory(m) => m.clear(),
            KeyValueStoreDispatcher::Disk(d) => d.clear(),
        }
    }
}

//------------ StorageResult -------------------------------------------------

pub type StorageResult<T> = Result<T, KeyValueError>;

//------------ KeyValueError -------------------------------------------------

/// This type defines possible Errors for the KeyValueStore.
#[derive(Debug)]
pub enum KeyValueError {
    UnknownScheme(String),
    IoError(FatalIoError),
    JsonError(serde_json::Error),
    UnknownKey(Key),
    InvalidKey(Key),
    DuplicateKey(Key),
    Other(String),
}

impl From<FatalIoError> for KeyValueError {
    fn from(e: FatalIoError) -> Self {
        KeyValueError::IoError(e)
    }
}

impl From<serde_json::Error> for KeyValueError {
    fn from(e: serde_json::Error) -> Self {
        KeyValueError::JsonError(e)
    }
}

impl fmt::Display for KeyValueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyValueError::UnknownScheme(e) => write!(f, "unknown scheme: {e}"),
            KeyValueError::IoError(e) => write!(f, "I/O error: {e}"),
            KeyValueError::JsonError(e) => write!(f, "JSON error: {e}"),
            KeyValueError::UnknownKey(key) => write!(f, "unknown key: {key}"),
            KeyValueError::InvalidKey(key) => write!(f, "invalid key: {key}"),
            KeyValueError::DuplicateKey(key) => write!(f, "duplicate key: {key}"),
            KeyValueError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

//------------ Tests ---------------------------------------------------------
