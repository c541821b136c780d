//! Durable per service provider credential state.
//!
//! One [`TerminalPermission`] exists per CVC terminal context ("refID").
//! It is created lazily on the first credential operation and only removed
//! by explicit decommissioning. The certificate chain, the pending
//! request and the request signer certificates live under separate keys
//! in the terminal's scope so that each can be updated atomically within
//! one `execute` section.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commons::crypto::KeyPair;
use crate::commons::ext_serde;
use crate::commons::storage::{Key, KeyValueStore, Scope, Segment, SegmentBuf};
use crate::commons::{EidResult, Error};

//------------ TerminalPermission --------------------------------------------

/// The core credential row for one terminal context.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TerminalPermission {
    pub ref_id: String,

    /// The current card verifiable certificate, if one was ever obtained.
    #[serde(default, serialize_with = "ext_serde::ser_opt_bytes", deserialize_with = "ext_serde::de_opt_bytes")]
    pub cvc: Option<Vec<u8>>,

    pub cvc_private_key: Option<KeyPair>,

    #[serde(default, serialize_with = "ext_serde::ser_opt_bytes", deserialize_with = "ext_serde::de_opt_bytes")]
    pub cvc_description: Option<Vec<u8>>,

    /// The provider's pseudonymization domain, as reported by the DVCA.
    #[serde(default, serialize_with = "ext_serde::ser_opt_bytes", deserialize_with = "ext_serde::de_opt_bytes")]
    pub sector_id: Option<Vec<u8>>,

    /// The version of the last block list applied for this terminal.
    /// `None` means the block list was never synchronized.
    pub black_list_version: Option<i64>,

    pub black_list_store_date: Option<DateTime<Utc>>,
}

impl TerminalPermission {
    fn new(ref_id: &str) -> Self {
        TerminalPermission {
            ref_id: ref_id.to_string(),
            cvc: None,
            cvc_private_key: None,
            cvc_description: None,
            sector_id: None,
            black_list_version: None,
            black_list_store_date: None,
        }
    }
}

//------------ PendingCertificateRequest -------------------------------------

/// The status of a pending CVC request towards the DVCA.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Created,
    Sent,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RequestStatus::Created => write!(f, "created"),
            RequestStatus::Sent => write!(f, "sent"),
        }
    }
}

/// A CVC request that was initiated but not yet answered.
///
/// At most one of these exists per terminal. It is deleted when the
/// certificate is obtained, or cleared when the request is aborted.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PendingCertificateRequest {
    pub message_id: Uuid,

    #[serde(serialize_with = "ext_serde::ser_bytes", deserialize_with = "ext_serde::de_bytes")]
    pub request_data: Vec<u8>,

    #[serde(default, serialize_with = "ext_serde::ser_opt_bytes", deserialize_with = "ext_serde::de_opt_bytes")]
    pub new_cvc_description: Option<Vec<u8>>,

    pub private_key: KeyPair,

    pub status: RequestStatus,

    pub created_at: DateTime<Utc>,
}

impl PendingCertificateRequest {
    pub fn new(
        request_data: Vec<u8>,
        new_cvc_description: Option<Vec<u8>>,
        private_key: KeyPair,
    ) -> Self {
        PendingCertificateRequest {
            message_id: Uuid::new_v4(),
            request_data,
            new_cvc_description,
            private_key,
            status: RequestStatus::Created,
            created_at: Utc::now(),
        }
    }
}

//------------ RequestSignerCertificate --------------------------------------

/// The certificate used to CMS-sign outgoing requests for one provider.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RequestSignerCertificate {
    /// The certificate holder reference (CHR), e.g. `sp-one_03`.
    pub holder_reference: String,

    pub key: KeyPair,

    #[serde(serialize_with = "ext_serde::ser_bytes", deserialize_with = "ext_serde::de_bytes")]
    pub certificate: Vec<u8>,

    /// Whether this is the provider's current signer. A pending one may
    /// coexist with the current one during rotation.
    pub current: bool,
}

//------------ TerminalStore -------------------------------------------------

const PERMISSION_KEY: &Segment = Segment::make("permission");
const PENDING_KEY: &Segment = Segment::make("pending");
const RSC_CURRENT_KEY: &Segment = Segment::make("rsc-current");
const RSC_PENDING_KEY: &Segment = Segment::make("rsc-pending");
const CHAIN_PREFIX: &str = "chain-";

/// CRUD and compare-and-swap style updates on terminal credential state.
#[derive(Debug)]
pub struct TerminalStore {
    kv: Arc<KeyValueStore>,
    archive: Arc<KeyValueStore>,
}

impl TerminalStore {
    pub fn new(kv: Arc<KeyValueStore>, archive: Arc<KeyValueStore>) -> Self {
        TerminalStore { kv, archive }
    }

    fn scope(ref_id: &str) -> Scope {
        Scope::from_segment(SegmentBuf::parse_lossy(ref_id))
    }

    fn permission_key(ref_id: &str) -> Key {
        Key::new_scoped(Self::scope(ref_id), PERMISSION_KEY)
    }

    fn pending_key(ref_id: &str) -> Key {
        Key::new_scoped(Self::scope(ref_id), PENDING_KEY)
    }

    fn chain_key(ref_id: &str, index: u32) -> Key {
        Key::new_scoped(
            Self::scope(ref_id),
            SegmentBuf::parse_lossy(&format!("{CHAIN_PREFIX}{index:05}")),
        )
    }

    fn chain_index(key: &Key) -> Option<u32> {
        key.name().as_str().strip_prefix(CHAIN_PREFIX)?.parse().ok()
    }
}

/// # The core row
impl TerminalStore {
    pub fn get_terminal(&self, ref_id: &str) -> EidResult<Option<TerminalPermission>> {
        Ok(self.kv.get(&Self::permission_key(ref_id))?)
    }

    /// Returns the terminal, creating an empty one if this is the first
    /// credential operation for the refID.
    pub fn get_or_create_terminal(&self, ref_id: &str) -> EidResult<TerminalPermission> {
        let key = Self::permission_key(ref_id);
        self.kv
            .execute(key.scope(), |kv| {
                if let Some(value) = kv.get(&key)? {
                    Ok(serde_json::from_value(value)?)
                } else {
                    let terminal = TerminalPermission::new(ref_id);
                    kv.store(&key, serde_json::to_value(&terminal)?)?;
                    Ok(terminal)
                }
            })
            .map_err(Error::from)
    }

    pub fn set_sector_id(&self, ref_id: &str, sector_id: Vec<u8>) -> EidResult<()> {
        self.update_terminal(ref_id, |terminal| {
            terminal.sector_id = Some(sector_id);
        })
    }

    /// Records the applied block list version and store date on the
    /// terminal row.
    pub fn set_blocklist_bookkeeping(
        &self,
        ref_id: &str,
        version: i64,
        store_date: DateTime<Utc>,
    ) -> EidResult<()> {
        self.update_terminal(ref_id, |terminal| {
            terminal.black_list_version = Some(version);
            terminal.black_list_store_date = Some(store_date);
        })
    }

    fn update_terminal<F>(&self, ref_id: &str, op: F) -> EidResult<()>
    where
        F: FnOnce(&mut TerminalPermission),
    {
        let key = Self::permission_key(ref_id);
        self.kv
            .execute(key.scope(), |kv| {
                let mut terminal: TerminalPermission = match kv.get(&key)? {
                    Some(value) => serde_json::from_value(value)?,
                    None => TerminalPermission::new(ref_id),
                };
                op(&mut terminal);
                kv.store(&key, serde_json::to_value(&terminal)?)
            })
            .map_err(Error::from)
    }

    /// Removes the terminal and everything scoped under it: chain entries,
    /// pending request and request signer certificates.
    pub fn remove_terminal(&self, ref_id: &str) -> EidResult<()> {
        let scope = Self::scope(ref_id);
        if self.kv.has_scope(&scope)? {
            self.kv.drop_scope(&scope)?;
        }
        Ok(())
    }
}

/// # The pending request
impl TerminalStore {
    pub fn pending_request(&self, ref_id: &str) -> EidResult<Option<PendingCertificateRequest>> {
        Ok(self.kv.get(&Self::pending_key(ref_id))?)
    }

    /// Stores a new pending request. A terminal has at most one; trying to
    /// create a second is an error the caller decides about.
    pub fn create_pending_request(
        &self,
        ref_id: &str,
        request: &PendingCertificateRequest,
    ) -> EidResult<()> {
        let key = Self::pending_key(ref_id);
        self.kv
            .execute(key.scope(), |kv| {
                if kv.has(&key)? {
                    Err(crate::commons::storage::KeyValueError::DuplicateKey(key.clone()))
                } else {
                    kv.store(&key, serde_json::to_value(request)?)
                }
            })
            .map_err(|e| match e {
                crate::commons::storage::KeyValueError::DuplicateKey(_) => {
                    Error::PendingRequestExists(ref_id.to_string())
                }
                other => Error::from(other),
            })
    }

    /// Transitions the pending request from `Created` to `Sent`.
    pub fn mark_request_sent(&self, ref_id: &str) -> EidResult<()> {
        let key = Self::pending_key(ref_id);
        self.kv
            .execute(key.scope(), |kv| match kv.get(&key)? {
                Some(value) => {
                    let mut request: PendingCertificateRequest = serde_json::from_value(value)?;
                    request.status = RequestStatus::Sent;
                    kv.store(&key, serde_json::to_value(&request)?)?;
                    Ok(true)
                }
                None => Ok(false),
            })
            .map_err(Error::from)
            .and_then(|found| {
                if found {
                    Ok(())
                } else {
                    Err(Error::NoPendingRequest(ref_id.to_string()))
                }
            })
    }

    /// Clears the pending request without storing a certificate.
    ///
    /// Returns whether there was anything to abort.
    pub fn abort_pending_request(&self, ref_id: &str) -> EidResult<bool> {
        let key = Self::pending_key(ref_id);
        self.kv
            .execute(key.scope(), |kv| {
                if kv.has(&key)? {
                    kv.delete(&key)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })
            .map_err(Error::from)
    }

    /// Applies an obtained CVC: deletes the pending request, stores the
    /// certificate, its private key and description on the terminal row,
    /// and appends the certificate to the chain — all in one section.
    ///
    /// `max_chain_length` bounds the retained chain; inserting above the
    /// bound evicts the oldest entries.
    pub fn complete_pending_request(
        &self,
        ref_id: &str,
        cvc: Vec<u8>,
        chain_index: u32,
        max_chain_length: usize,
    ) -> EidResult<()> {
        let scope = Self::scope(ref_id);
        let pending_key = Self::pending_key(ref_id);
        let permission_key = Self::permission_key(ref_id);
        let chain_key = Self::chain_key(ref_id, chain_index);

        self.kv
            .execute(&scope, |kv| {
                let pending: PendingCertificateRequest = match kv.get(&pending_key)? {
                    Some(value) => serde_json::from_value(value)?,
                    None => {
                        return Err(crate::commons::storage::KeyValueError::UnknownKey(
                            pending_key.clone(),
                        ));
                    }
                };

                let mut terminal: TerminalPermission = match kv.get(&permission_key)? {
                    Some(value) => serde_json::from_value(value)?,
                    None => TerminalPermission::new(ref_id),
                };
                terminal.cvc = Some(cvc.clone());
                terminal.cvc_private_key = Some(pending.private_key.clone());
                if pending.new_cvc_description.is_some() {
                    terminal.cvc_description = pending.new_cvc_description.clone();
                }
                kv.store(&permission_key, serde_json::to_value(&terminal)?)?;

                kv.store(&chain_key, serde_json::to_value(Base64Bytes(cvc.clone()))?)?;
                Self::evict_chain_overflow(kv, &scope, max_chain_length)?;

                kv.delete(&pending_key)?;
                Ok(())
            })
            .map_err(|e| match e {
                crate::commons::storage::KeyValueError::UnknownKey(_) => {
                    Error::NoPendingRequest(ref_id.to_string())
                }
                other => Error::from(other),
            })
    }
}

/// Raw certificate bytes stored as base64.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct Base64Bytes(
    #[serde(serialize_with = "ext_serde::ser_bytes", deserialize_with = "ext_serde::de_bytes")]
    Vec<u8>,
);

/// # The certificate chain
impl TerminalStore {
    /// Stores a chain entry under `(refID, index)`, evicting the oldest
    /// entries while the chain exceeds `max_chain_length`.
    pub fn add_chain_entry(
        &self,
        ref_id: &str,
        index: u32,
        cert: Vec<u8>,
        max_chain_length: usize,
    ) -> EidResult<()> {
        let scope = Self::scope(ref_id);
        let key = Self::chain_key(ref_id, index);
        self.kv
            .execute(&scope, |kv| {
                kv.store(&key, serde_json::to_value(Base64Bytes(cert.clone()))?)?;
                Self::evict_chain_overflow(kv, &scope, max_chain_length)
            })
            .map_err(Error::from)
    }

    /// Returns the chain as `(index, bytes)` pairs ordered by index.
    pub fn chain(&self, ref_id: &str) -> EidResult<Vec<(u32, Vec<u8>)>> {
        let scope = Self::scope(ref_id);
        let mut entries = Vec::new();
        for key in self.kv.keys(&scope, CHAIN_PREFIX)? {
            if let Some(index) = Self::chain_index(&key) {
                if let Some(Base64Bytes(bytes)) = self.kv.get(&key)? {
                    entries.push((index, bytes));
                }
            }
        }
        entries.sort_by_key(|(index, _)| *index);
        Ok(entries)
    }

    fn evict_chain_overflow(
        kv: &crate::commons::storage::KeyValueStoreDispatcher,
        scope: &Scope,
        max_chain_length: usize,
    ) -> Result<(), crate::commons::storage::KeyValueError> {
        let mut chain_keys: Vec<(u32, Key)> = kv
            .list_keys(scope)?
            .into_iter()
            .filter(|key| key.scope() == scope)
            .filter_map(|key| Self::chain_index(&key).map(|index| (index, key)))
            .collect();
        chain_keys.sort_by_key(|(index, _)| *index);

        while chain_keys.len() > max_chain_length {
            let (_, oldest) = chain_keys.remove(0);
            kv.delete(&oldest)?;
        }

        Ok(())
    }
}

/// # Request signer certificates
impl TerminalStore {
    fn rsc_key(ref_id: &str, current: bool) -> Key {
        let name = if current { RSC_CURRENT_KEY } else { RSC_PENDING_KEY };
        Key::new_scoped(Self::scope(ref_id), name)
    }

    pub fn current_rsc(&self, ref_id: &str) -> EidResult<Option<RequestSignerCertificate>> {
        Ok(self.kv.get(&Self::rsc_key(ref_id, true))?)
    }

    pub fn pending_rsc(&self, ref_id: &str) -> EidResult<Option<RequestSignerCertificate>> {
        Ok(self.kv.get(&Self::rsc_key(ref_id, false))?)
    }

    pub fn set_pending_rsc(&self, ref_id: &str, rsc: &RequestSignerCertificate) -> EidResult<()> {
        Ok(self.kv.store(&Self::rsc_key(ref_id, false), rsc)?)
    }

    /// Makes the pending request signer certificate the current one.
    pub fn promote_pending_rsc(&self, ref_id: &str) -> EidResult<bool> {
        let pending_key = Self::rsc_key(ref_id, false);
        let current_key = Self::rsc_key(ref_id, true);
        self.kv
            .execute(&Self::scope(ref_id), |kv| match kv.get(&pending_key)? {
                Some(value) => {
                    let mut rsc: RequestSignerCertificate = serde_json::from_value(value)?;
                    rsc.current = true;
                    kv.store(&current_key, serde_json::to_value(&rsc)?)?;
                    kv.delete(&pending_key)?;
                    Ok(true)
                }
                None => Ok(false),
            })
            .map_err(Error::from)
    }
}

/// # The key archive
impl TerminalStore {
    /// Archives exported key material under the given alias.
    ///
    /// Rotation relies on this succeeding before it ever deletes a key
    /// from the HSM.
    pub fn archive_key(&self, alias: &str, material: &[u8]) -> EidResult<()> {
        let key = Key::new_global(SegmentBuf::parse_lossy(alias));
        self.archive
            .store(&key, &Base64Bytes(material.to_vec()))
            .map_err(Error::from)
    }

    pub fn archived_key(&self, alias: &str) -> EidResult<Option<Vec<u8>>> {
        let key = Key::new_global(SegmentBuf::parse_lossy(alias));
        Ok(self.archive.get::<Base64Bytes>(&key)?.map(|b| b.0))
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{KEY_ARCHIVE_NS, TERMINALS_NS};
    use crate::test;

    fn store() -> TerminalStore {
        let storage = test::mem_storage();
        TerminalStore::new(
            Arc::new(KeyValueStore::create(&storage, TERMINALS_NS).unwrap()),
            Arc::new(KeyValueStore::create(&storage, KEY_ARCHIVE_NS).unwrap()),
        )
    }

    fn pending_request() -> PendingCertificateRequest {
        PendingCertificateRequest::new(
            b"request".to_vec(),
            Some(b"description".to_vec()),
            KeyPair::build_ec().unwrap(),
        )
    }

    #[test]
    fn terminal_is_created_lazily() {
        let store = store();
        assert!(store.get_terminal("DETESTSP00001").unwrap().is_none());

        let terminal = store.get_or_create_terminal("DETESTSP00001").unwrap();
        assert_eq!(terminal.ref_id, "DETESTSP00001");
        assert!(terminal.black_list_version.is_none());

        assert!(store.get_terminal("DETESTSP00001").unwrap().is_some());
    }

    #[test]
    fn at_most_one_pending_request() {
        let store = store();
        store
            .create_pending_request("DETESTSP00001", &pending_request())
            .unwrap();

        let err = store
            .create_pending_request("DETESTSP00001", &pending_request())
            .unwrap_err();
        assert!(matches!(err, Error::PendingRequestExists(_)));
    }

    #[test]
    fn request_lifecycle_created_sent_obtained() {
        let store = store();
        let ref_id = "DETESTSP00001";

        store.create_pending_request(ref_id, &pending_request()).unwrap();
        assert_eq!(
            store.pending_request(ref_id).unwrap().unwrap().status,
            RequestStatus::Created
        );

        store.mark_request_sent(ref_id).unwrap();
        assert_eq!(
            store.pending_request(ref_id).unwrap().unwrap().status,
            RequestStatus::Sent
        );

        store
            .complete_pending_request(ref_id, b"cvc-bytes".to_vec(), 1, 5)
            .unwrap();

        assert!(store.pending_request(ref_id).unwrap().is_none());
        let terminal = store.get_terminal(ref_id).unwrap().unwrap();
        assert_eq!(terminal.cvc.as_deref(), Some(b"cvc-bytes".as_slice()));
        assert_eq!(terminal.cvc_description.as_deref(), Some(b"description".as_slice()));
        assert_eq!(store.chain(ref_id).unwrap(), vec![(1, b"cvc-bytes".to_vec())]);
    }

    #[test]
    fn completing_without_pending_request_fails() {
        let store = store();
        let err = store
            .complete_pending_request("DETESTSP00001", b"cvc".to_vec(), 1, 5)
            .unwrap_err();
        assert!(matches!(err, Error::NoPendingRequest(_)));
    }

    #[test]
    fn chain_is_bounded_with_oldest_evicted_first() {
        let store = store();
        let ref_id = "DETESTSP00001";

        for index in 1..=4 {
            store
                .add_chain_entry(ref_id, index, format!("cert-{index}").into_bytes(), 3)
                .unwrap();
        }

        let chain = store.chain(ref_id).unwrap();
        assert_eq!(
            chain,
            vec![
                (2, b"cert-2".to_vec()),
                (3, b"cert-3".to_vec()),
                (4, b"cert-4".to_vec()),
            ]
        );

        // re-inserting an existing index overwrites rather than duplicates
        store
            .add_chain_entry(ref_id, 4, b"cert-4b".to_vec(), 3)
            .unwrap();
        assert_eq!(store.chain(ref_id).unwrap().len(), 3);
    }

    #[test]
    fn rsc_promotion() {
        let store = store();
        let ref_id = "DETESTSP00001";

        let rsc = RequestSignerCertificate {
            holder_reference: "sp-one_01".to_string(),
            key: KeyPair::build_ec().unwrap(),
            certificate: b"cert".to_vec(),
            current: false,
        };

        assert!(!store.promote_pending_rsc(ref_id).unwrap());

        store.set_pending_rsc(ref_id, &rsc).unwrap();
        assert!(store.promote_pending_rsc(ref_id).unwrap());

        let current = store.current_rsc(ref_id).unwrap().unwrap();
        assert!(current.current);
        assert_eq!(current.holder_reference, "sp-one_01");
        assert!(store.pending_rsc(ref_id).unwrap().is_none());
    }

    #[test]
    fn decommission_cascades() {
        let store = store();
        let ref_id = "DETESTSP00001";

        store.get_or_create_terminal(ref_id).unwrap();
        store.add_chain_entry(ref_id, 1, b"cert".to_vec(), 5).unwrap();
        store.create_pending_request(ref_id, &pending_request()).unwrap();

        store.remove_terminal(ref_id).unwrap();

        assert!(store.get_terminal(ref_id).unwrap().is_none());
        assert!(store.chain(ref_id).unwrap().is_empty());
        assert!(store.pending_request(ref_id).unwrap().is_none());
    }

    #[test]
    fn key_archive_round_trip() {
        let store = store();
        assert!(store.archived_key("hsm-key-1").unwrap().is_none());

        store.archive_key("hsm-key-1", b"key material").unwrap();
        assert_eq!(
            store.archived_key("hsm-key-1").unwrap().as_deref(),
            Some(b"key material".as_slice())
        );
    }
}
