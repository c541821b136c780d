//! Revocation ("block") list synchronization.
//!
//! Each service provider has a sector specific set of revoked pseudonym
//! hashes. The DVCA publishes the set either completely or as a delta
//! against a known version. Responses are CMS signed; nothing is applied
//! before the signature checks out against the DVCA's trust anchor. Set
//! mutation and version bump commit together, and every applied version
//! additionally lands as an immutable snapshot file for audit.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use log::{info, warn};
use openssl::x509::X509;
use serde::{Deserialize, Serialize};

use crate::api::{JobReport, ManagementCode};
use crate::commons::crypto::verify_cms;
use crate::commons::error::FatalIoError;
use crate::commons::storage::{Key, KeyValueStore, Scope, Segment, SegmentBuf};
use crate::commons::{EidResult, Error};
use crate::config::Config;
use crate::server::dvca::{BlacklistResult, DvcaConnection};
use crate::server::terminals::TerminalStore;

//------------ BlocklistStore ------------------------------------------------

const META_KEY: &Segment = Segment::make("meta");
const ENTRIES_KEY: &Segment = Segment::make("entries");

#[derive(Clone, Debug, Deserialize, Serialize)]
struct BlocklistMeta {
    version: i64,
}

/// The per sector revocation sets and their version bookkeeping.
#[derive(Debug)]
pub struct BlocklistStore {
    kv: Arc<KeyValueStore>,
    store_dir: PathBuf,
}

impl BlocklistStore {
    pub fn new(kv: Arc<KeyValueStore>, store_dir: PathBuf) -> Self {
        BlocklistStore { kv, store_dir }
    }

    fn scope(sector_id: &[u8]) -> Scope {
        Scope::from_segment(SegmentBuf::parse_lossy(&hex::encode(sector_id)))
    }

    fn meta_key(sector_id: &[u8]) -> Key {
        Key::new_scoped(Self::scope(sector_id), META_KEY)
    }

    fn entries_key(sector_id: &[u8]) -> Key {
        Key::new_scoped(Self::scope(sector_id), ENTRIES_KEY)
    }

    /// The currently stored version for the sector, if any.
    pub fn version(&self, sector_id: &[u8]) -> EidResult<Option<i64>> {
        Ok(self
            .kv
            .get::<BlocklistMeta>(&Self::meta_key(sector_id))?
            .map(|meta| meta.version))
    }

    /// The current set of blocked hashes for the sector.
    pub fn entries(&self, sector_id: &[u8]) -> EidResult<HashSet<String>> {
        Ok(self
            .kv
            .get::<Vec<String>>(&Self::entries_key(sector_id))?
            .map(|entries| entries.into_iter().collect())
            .unwrap_or_default())
    }

    pub fn is_blocked(&self, sector_id: &[u8], hash: &str) -> EidResult<bool> {
        Ok(self.entries(sector_id)?.contains(hash))
    }

    /// Replaces the sector's entire set. The new version and the new set
    /// are committed in one section, so no reader can observe one without
    /// the other.
    ///
    /// Returns the resulting set, or `None` if the stored version is
    /// already at or past the offered one and nothing was changed.
    pub fn apply_complete(
        &self,
        sector_id: &[u8],
        version: i64,
        entries: Vec<String>,
    ) -> EidResult<Option<Vec<String>>> {
        let meta_key = Self::meta_key(sector_id);
        let entries_key = Self::entries_key(sector_id);

        self.kv
            .execute(&Self::scope(sector_id), |kv| {
                if let Some(meta) = kv.get(&meta_key)? {
                    let meta: BlocklistMeta = serde_json::from_value(meta)?;
                    if meta.version >= version {
                        return Ok(None);
                    }
                }
                kv.store(&entries_key, serde_json::to_value(&entries)?)?;
                kv.store(&meta_key, serde_json::to_value(BlocklistMeta { version })?)?;
                Ok(Some(entries.clone()))
            })
            .map_err(Error::from)
    }

    /// Applies a delta on top of the expected baseline version. Fails
    /// without mutation if the stored version is not the baseline the
    /// delta was computed against.
    ///
    /// Returns the resulting set.
    pub fn apply_delta(
        &self,
        sector_id: &[u8],
        baseline: i64,
        version: i64,
        added: &[String],
        removed: &[String],
    ) -> EidResult<Vec<String>> {
        if version <= baseline {
            return Err(Error::custom(format!(
                "delta does not advance the version: {baseline} -> {version}"
            )));
        }

        let meta_key = Self::meta_key(sector_id);
        let entries_key = Self::entries_key(sector_id);

        self.kv
            .execute(&Self::scope(sector_id), |kv| {
                let stored_version = match kv.get(&meta_key)? {
                    Some(meta) => {
                        let meta: BlocklistMeta = serde_json::from_value(meta)?;
                        Some(meta.version)
                    }
                    None => None,
                };
                if stored_version != Some(baseline) {
                    return Err(crate::commons::storage::KeyValueError::Other(format!(
                        "delta baseline {baseline} does not match stored version {stored_version:?}"
                    )));
                }

                let mut entries: HashSet<String> = match kv.get(&entries_key)? {
                    Some(value) => serde_json::from_value::<Vec<String>>(value)?
                        .into_iter()
                        .collect(),
                    None => HashSet::new(),
                };
                for hash in added {
                    entries.insert(hash.clone());
                }
                for hash in removed {
                    entries.remove(hash);
                }

                let mut entries: Vec<String> = entries.into_iter().collect();
                entries.sort();

                kv.store(&entries_key, serde_json::to_value(&entries)?)?;
                kv.store(&meta_key, serde_json::to_value(BlocklistMeta { version })?)?;
                Ok(entries)
            })
            .map_err(Error::from)
    }

    /// Removes the sector's set and all snapshot files for the refID.
    /// Part of provider decommissioning.
    pub fn remove_sector(&self, sector_id: &[u8], ref_id: &str) -> EidResult<()> {
        let scope = Self::scope(sector_id);
        if self.kv.has_scope(&scope)? {
            self.kv.drop_scope(&scope)?;
        }

        let prefix = format!("{ref_id}.version-");
        if let Ok(dir) = fs::read_dir(&self.store_dir) {
            for entry in dir.flatten() {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&prefix)
                {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }

        Ok(())
    }

    /// Writes the immutable snapshot file `<refID>.version-<version>`.
    pub fn write_snapshot(&self, ref_id: &str, version: i64, entries: &[String]) -> EidResult<()> {
        if !self.store_dir.exists() {
            fs::create_dir_all(&self.store_dir).map_err(|e| {
                FatalIoError::new(
                    format!(
                        "cannot create block list store dir: {}",
                        self.store_dir.display()
                    ),
                    e,
                )
            })?;
        }

        let path = self.store_dir.join(format!("{ref_id}.version-{version}"));

        let tmp_file = tempfile::NamedTempFile::new_in(&self.store_dir).map_err(|e| {
            FatalIoError::new(
                format!("cannot create tmp file for snapshot {}", path.display()),
                e,
            )
        })?;
        fs::write(&tmp_file, entries.join("\n")).map_err(|e| {
            FatalIoError::new(format!("cannot write snapshot {}", path.display()), e)
        })?;
        tmp_file.persist(&path).map_err(|e| {
            Error::IoError(FatalIoError::new(
                format!("cannot persist snapshot {}", path.display()),
                e.error,
            ))
        })?;

        Ok(())
    }
}

//------------ BlocklistSynchronizer -----------------------------------------

/// Fetches, verifies and applies block list updates for all providers.
pub struct BlocklistSynchronizer {
    store: Arc<BlocklistStore>,
    terminals: Arc<TerminalStore>,
    dvcas: HashMap<String, Arc<DvcaConnection>>,

    /// Per DVCA name, the certificate block list responses must verify
    /// against.
    trust_anchors: HashMap<String, X509>,

    config: Arc<Config>,
}

impl BlocklistSynchronizer {
    pub fn new(
        store: Arc<BlocklistStore>,
        terminals: Arc<TerminalStore>,
        dvcas: HashMap<String, Arc<DvcaConnection>>,
        trust_anchors: HashMap<String, X509>,
        config: Arc<Config>,
    ) -> Self {
        BlocklistSynchronizer {
            store,
            terminals,
            dvcas,
            trust_anchors,
            config,
        }
    }

    /// One synchronization sweep over all enabled providers.
    ///
    /// Failures are isolated per provider: one bad or unreachable DVCA
    /// leaves every other provider's revocation state as fresh as it can
    /// be.
    pub async fn sync_all(&self) -> JobReport {
        let mut report = JobReport::new("block list synchronization");

        for sp in self.config.service_providers.iter().filter(|sp| sp.enabled) {
            match self.sync_provider(&sp.name, &sp.cvc_ref_id, &sp.dvca).await {
                Ok(message) => report.add_success(&sp.name, message),
                Err(e) => {
                    warn!("Block list sync for '{}' failed: {e}", sp.name);
                    report.add_failure(&sp.name, classify(&e), e.to_string());
                }
            }
        }

        report
    }

    async fn sync_provider(
        &self,
        provider_name: &str,
        ref_id: &str,
        dvca_name: &str,
    ) -> EidResult<String> {
        let dvca = self
            .dvcas
            .get(dvca_name)
            .ok_or_else(|| Error::dvca(format!("no connection for dvca '{dvca_name}'")))?;
        let trust_anchor = self
            .trust_anchors
            .get(dvca_name)
            .ok_or_else(|| Error::config(format!("no trust anchor configured for dvca '{dvca_name}'")))?;

        let terminal = self.terminals.get_or_create_terminal(ref_id)?;
        let baseline = terminal.black_list_version;

        let result = self
            .fetch_verified(dvca, trust_anchor, baseline, terminal.sector_id.as_deref())
            .await?;

        let result = match result {
            BlacklistResult::UnknownBaseline => {
                // the DVCA pruned history past our baseline; start over
                // with a complete list
                info!("DVCA no longer knows version {baseline:?} for '{provider_name}', falling back to full sync");
                self.fetch_verified(dvca, trust_anchor, None, terminal.sector_id.as_deref())
                    .await?
            }
            other => other,
        };

        match result {
            BlacklistResult::Complete {
                version,
                sector_id,
                download_url,
            } => {
                let sector_id = BASE64
                    .decode(&sector_id)
                    .map_err(|_| Error::dvca("sector id is not valid base64"))?;

                let body = dvca.fetch_list(&download_url).await?;
                let entries: Vec<String> = String::from_utf8_lossy(&body)
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                let count = entries.len();

                match self.store.apply_complete(&sector_id, version, entries)? {
                    Some(entries) => {
                        self.store.write_snapshot(ref_id, version, &entries)?;
                        self.record_applied(ref_id, &sector_id, version)?;
                        Ok(format!("complete list applied: version {version}, {count} entries"))
                    }
                    None => Ok(format!("already at version {version}")),
                }
            }
            BlacklistResult::Delta {
                version,
                sector_id,
                added,
                removed,
            } => {
                let sector_id = BASE64
                    .decode(&sector_id)
                    .map_err(|_| Error::dvca("sector id is not valid base64"))?;
                let baseline = baseline
                    .ok_or_else(|| Error::dvca("got a delta without ever having synced"))?;

                let entries =
                    self.store
                        .apply_delta(&sector_id, baseline, version, &added, &removed)?;
                self.store.write_snapshot(ref_id, version, &entries)?;
                self.record_applied(ref_id, &sector_id, version)?;

                Ok(format!(
                    "delta applied: version {baseline} -> {version} (+{}/-{})",
                    added.len(),
                    removed.len()
                ))
            }
            BlacklistResult::UnknownBaseline => {
                Err(Error::dvca("DVCA returned unknown baseline for a full sync"))
            }
        }
    }

    /// Fetches a block list response and verifies its provenance. This is
    /// the only path by which response content enters the system.
    async fn fetch_verified(
        &self,
        dvca: &DvcaConnection,
        trust_anchor: &X509,
        since: Option<i64>,
        sector_id: Option<&[u8]>,
    ) -> EidResult<BlacklistResult> {
        let cms = dvca.get_blacklist(since, sector_id).await?;
        let content = verify_cms(&cms, trust_anchor)
            .map_err(|e| Error::signature_invalid(format!("block list response: {e}")))?;
        serde_json::from_slice(&content)
            .map_err(|e| Error::dvca(format!("cannot parse block list payload: {e}")))
    }

    fn record_applied(&self, ref_id: &str, sector_id: &[u8], version: i64) -> EidResult<()> {
        let terminal = self.terminals.get_terminal(ref_id)?;
        if terminal.and_then(|t| t.sector_id).as_deref() != Some(sector_id) {
            self.terminals.set_sector_id(ref_id, sector_id.to_vec())?;
        }
        self.terminals
            .set_blocklist_bookkeeping(ref_id, version, Utc::now())
    }
}

fn classify(error: &Error) -> ManagementCode {
    match error {
        Error::SignatureInvalid(_) => ManagementCode::SignatureInvalid,
        Error::ConfigError(_) => ManagementCode::ConfigurationError,
        Error::DvcaError(_) | Error::HttpClientError(_) => ManagementCode::RemoteUnavailable,
        _ => ManagementCode::UnexpectedError,
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::{KeyPair, build_self_signed, sign_cms};
    use crate::constants::{BLOCKLIST_NS, KEY_ARCHIVE_NS, TERMINALS_NS};
    use crate::server::dvca::MockDvcaClient;
    use crate::test;

    const SECTOR: &[u8] = b"sector-one";

    fn test_config() -> Arc<Config> {
        Arc::new(
            toml::from_str(
                r#"
                country_code = "DE"

                [[service_providers]]
                name = "sp-one"
                cvc_ref_id = "DETESTSP00001"
                dvca = "test-dvca"
                client_key_pair = "sp-one-tls"
                pending_client_key_pair = "sp-one-tls-pending"

                [dvca.test-dvca]
                base_url = "https://dvca.example.org/api/"
                "#,
            )
            .unwrap(),
        )
    }

    struct TestSetup {
        synchronizer: BlocklistSynchronizer,
        store: Arc<BlocklistStore>,
        terminals: Arc<TerminalStore>,
        dvca: Arc<DvcaConnection>,
        anchor_cert: X509,
        anchor_key: KeyPair,
        store_dir: PathBuf,
        cleanup: Box<dyn FnOnce()>,
    }

    fn setup() -> TestSetup {
        let storage = test::mem_storage();
        let (dir, cleanup) = test::tmp_dir();

        let store = Arc::new(BlocklistStore::new(
            Arc::new(KeyValueStore::create(&storage, BLOCKLIST_NS).unwrap()),
            dir.clone(),
        ));
        let terminals = Arc::new(TerminalStore::new(
            Arc::new(KeyValueStore::create(&storage, TERMINALS_NS).unwrap()),
            Arc::new(KeyValueStore::create(&storage, KEY_ARCHIVE_NS).unwrap()),
        ));

        let anchor_key = KeyPair::build_ec().unwrap();
        let anchor_cert =
            X509::from_der(&build_self_signed("TEST_DVCA_TA", &anchor_key, 12).unwrap()).unwrap();

        let dvca = Arc::new(DvcaConnection::Mock(MockDvcaClient::new()));
        let mut dvcas = HashMap::new();
        dvcas.insert("test-dvca".to_string(), dvca.clone());
        let mut trust_anchors = HashMap::new();
        trust_anchors.insert("test-dvca".to_string(), anchor_cert.clone());

        let synchronizer = BlocklistSynchronizer::new(
            store.clone(),
            terminals.clone(),
            dvcas,
            trust_anchors,
            test_config(),
        );

        TestSetup {
            synchronizer,
            store,
            terminals,
            dvca,
            anchor_cert,
            anchor_key,
            store_dir: dir,
            cleanup: Box::new(cleanup),
        }
    }

    fn signed_payload(setup: &TestSetup, result: &BlacklistResult) -> Vec<u8> {
        let json = serde_json::to_vec(result).unwrap();
        sign_cms(&setup.anchor_cert, setup.anchor_key.pkey(), &json).unwrap()
    }

    fn mock(setup: &TestSetup) -> &MockDvcaClient {
        let DvcaConnection::Mock(mock) = setup.dvca.as_ref() else {
            unreachable!()
        };
        mock
    }

    fn hashes(range: std::ops::Range<u32>) -> Vec<String> {
        range.map(|i| format!("hash-{i:04}")).collect()
    }

    #[tokio::test]
    async fn first_sync_requests_the_complete_list() {
        let setup = setup();

        let complete = BlacklistResult::Complete {
            version: 7,
            sector_id: BASE64.encode(SECTOR),
            download_url: "https://dvca.example.org/lists/7".to_string(),
        };
        mock(&setup).push_blacklist_response(signed_payload(&setup, &complete));
        mock(&setup).add_list_download(
            "https://dvca.example.org/lists/7",
            hashes(0..30).join("\n").into_bytes(),
        );

        let report = setup.synchronizer.sync_all().await;
        assert!(report.success(), "{report}");

        // the remote call passed no baseline version
        assert!(
            mock(&setup)
                .calls()
                .contains(&crate::server::dvca::DvcaCall::GetBlacklist(None))
        );

        assert_eq!(setup.store.version(SECTOR).unwrap(), Some(7));
        assert_eq!(setup.store.entries(SECTOR).unwrap().len(), 30);
        assert!(setup.store.is_blocked(SECTOR, "hash-0012").unwrap());

        let terminal = setup.terminals.get_terminal("DETESTSP00001").unwrap().unwrap();
        assert_eq!(terminal.black_list_version, Some(7));
        assert_eq!(terminal.sector_id.as_deref(), Some(SECTOR));
        assert!(terminal.black_list_store_date.is_some());

        // the snapshot file exists and holds the full set
        let snapshot = setup.store_dir.join("DETESTSP00001.version-7");
        let content = fs::read_to_string(snapshot).unwrap();
        assert_eq!(content.lines().count(), 30);

        (setup.cleanup)();
    }

    #[tokio::test]
    async fn delta_sync_applies_additions_and_removals() {
        let setup = setup();

        // baseline: 30 entries at version 7
        setup
            .store
            .apply_complete(SECTOR, 7, hashes(0..30))
            .unwrap();
        setup.terminals.set_sector_id("DETESTSP00001", SECTOR.to_vec()).unwrap();
        setup
            .terminals
            .set_blocklist_bookkeeping("DETESTSP00001", 7, Utc::now())
            .unwrap();

        // delta: add 10, remove 5
        let delta = BlacklistResult::Delta {
            version: 8,
            sector_id: BASE64.encode(SECTOR),
            added: hashes(30..40),
            removed: hashes(0..5),
        };
        mock(&setup).push_blacklist_response(signed_payload(&setup, &delta));

        let report = setup.synchronizer.sync_all().await;
        assert!(report.success(), "{report}");

        // the delta was requested against the stored baseline
        assert!(
            mock(&setup)
                .calls()
                .contains(&crate::server::dvca::DvcaCall::GetBlacklist(Some(7)))
        );

        assert_eq!(setup.store.version(SECTOR).unwrap(), Some(8));
        let entries = setup.store.entries(SECTOR).unwrap();
        assert_eq!(entries.len(), 35);
        assert!(!entries.contains("hash-0000"));
        assert!(entries.contains("hash-0035"));

        (setup.cleanup)();
    }

    #[tokio::test]
    async fn unknown_baseline_falls_back_to_full_sync() {
        let setup = setup();

        setup.store.apply_complete(SECTOR, 3, hashes(0..10)).unwrap();
        setup.terminals.set_sector_id("DETESTSP00001", SECTOR.to_vec()).unwrap();
        setup
            .terminals
            .set_blocklist_bookkeeping("DETESTSP00001", 3, Utc::now())
            .unwrap();

        mock(&setup)
            .push_blacklist_response(signed_payload(&setup, &BlacklistResult::UnknownBaseline));
        let complete = BlacklistResult::Complete {
            version: 9,
            sector_id: BASE64.encode(SECTOR),
            download_url: "https://dvca.example.org/lists/9".to_string(),
        };
        mock(&setup).push_blacklist_response(signed_payload(&setup, &complete));
        mock(&setup).add_list_download(
            "https://dvca.example.org/lists/9",
            hashes(100..120).join("\n").into_bytes(),
        );

        let report = setup.synchronizer.sync_all().await;
        assert!(report.success(), "{report}");

        let calls = mock(&setup).calls();
        assert!(calls.contains(&crate::server::dvca::DvcaCall::GetBlacklist(Some(3))));
        assert!(calls.contains(&crate::server::dvca::DvcaCall::GetBlacklist(None)));

        assert_eq!(setup.store.version(SECTOR).unwrap(), Some(9));
        assert_eq!(setup.store.entries(SECTOR).unwrap().len(), 20);

        (setup.cleanup)();
    }

    #[tokio::test]
    async fn bad_signature_aborts_without_mutation() {
        let setup = setup();

        setup.store.apply_complete(SECTOR, 3, hashes(0..10)).unwrap();
        setup.terminals.set_sector_id("DETESTSP00001", SECTOR.to_vec()).unwrap();
        setup
            .terminals
            .set_blocklist_bookkeeping("DETESTSP00001", 3, Utc::now())
            .unwrap();

        // signed by somebody else entirely
        let wrong_key = KeyPair::build_ec().unwrap();
        let wrong_cert =
            X509::from_der(&build_self_signed("EVIL_TA", &wrong_key, 12).unwrap()).unwrap();
        let delta = BlacklistResult::Delta {
            version: 4,
            sector_id: BASE64.encode(SECTOR),
            added: hashes(10..20),
            removed: vec![],
        };
        let json = serde_json::to_vec(&delta).unwrap();
        mock(&setup)
            .push_blacklist_response(sign_cms(&wrong_cert, wrong_key.pkey(), &json).unwrap());

        let report = setup.synchronizer.sync_all().await;
        assert!(!report.success());
        assert_eq!(
            report.entries()[0].message.code(),
            ManagementCode::SignatureInvalid
        );

        // prior state intact
        assert_eq!(setup.store.version(SECTOR).unwrap(), Some(3));
        assert_eq!(setup.store.entries(SECTOR).unwrap().len(), 10);
        let terminal = setup.terminals.get_terminal("DETESTSP00001").unwrap().unwrap();
        assert_eq!(terminal.black_list_version, Some(3));

        (setup.cleanup)();
    }

    #[test]
    fn delta_with_wrong_baseline_is_rejected() {
        let setup = setup();

        setup.store.apply_complete(SECTOR, 5, hashes(0..10)).unwrap();

        // baseline mismatch
        assert!(
            setup
                .store
                .apply_delta(SECTOR, 4, 6, &hashes(10..12), &[])
                .is_err()
        );
        // version going backwards
        assert!(setup.store.apply_delta(SECTOR, 5, 5, &hashes(10..12), &[]).is_err());

        assert_eq!(setup.store.version(SECTOR).unwrap(), Some(5));
        assert_eq!(setup.store.entries(SECTOR).unwrap().len(), 10);

        (setup.cleanup)();
    }
}
