//! Renewal of the TLS client certificates used towards the DVCA.
//!
//! A scheduled check compares each provider's client certificate against
//! the renewal deadline. When renewal is due a key pair is generated (or
//! a compatible pending one reused), a CSR is built, CMS signed by the
//! provider's request signer and submitted. The issued certificate
//! arrives later and is swapped in atomically.
//!
//! Key material lives either in shared storage (database custody) or in
//! the HSM. Both backends implement the same four operations, so the
//! engine is written once.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use openssl::asn1::Asn1Time;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};

use crate::api::{JobReport, ManagementCode};
use crate::commons::crypto::{CryptoError, CsrSubject, KeyPair, build_csr};
use crate::commons::ext_serde;
use crate::commons::storage::{Key, KeyValueStore, Scope, Segment, SegmentBuf};
use crate::commons::{EidResult, Error};
use crate::config::{Config, KeyCustodyType, ServiceProviderConfig};
use crate::server::dvca::DvcaConnection;
use crate::server::hsm::HsmConnector;
use crate::server::locks::LockManager;
use crate::server::rsc::RscManager;

//------------ CertStatus ----------------------------------------------------

/// The outcome of checking a provider's client certificate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertStatus {
    /// No certificate installed yet.
    Missing,

    /// Valid, but the renewal deadline has been reached.
    RenewalDue,

    /// Valid beyond the renewal deadline; nothing to do.
    Current,
}

//------------ KeystoreEntry -------------------------------------------------

/// A key pair with its certificate chain, for the database custody
/// backend.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct KeystoreEntry {
    key: KeyPair,
    certificate_chain: Vec<CertDer>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct CertDer(
    #[serde(serialize_with = "ext_serde::ser_bytes", deserialize_with = "ext_serde::de_bytes")]
    Vec<u8>,
);

//------------ PendingCsr ----------------------------------------------------

/// Bookkeeping for a CSR that was submitted and awaits its certificate.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PendingCsr {
    pub key_pair_name: String,

    #[serde(serialize_with = "ext_serde::ser_bytes", deserialize_with = "ext_serde::de_bytes")]
    pub csr: Vec<u8>,

    pub submitted_at: DateTime<Utc>,

    /// Do not ask the DVCA for the result before this point in time.
    pub no_poll_before: Option<DateTime<Utc>>,
}

const PENDING_CSR_KEY: &Segment = Segment::make("pending-request");

//------------ TlsRenewalEngine ----------------------------------------------

#[derive(Debug)]
pub struct TlsRenewalEngine {
    keystore: Arc<KeyValueStore>,
    hsm: Option<Arc<HsmConnector>>,
    rsc: Arc<RscManager>,
    locks: Arc<LockManager>,
    dvcas: HashMap<String, Arc<DvcaConnection>>,
    config: Arc<Config>,
}

impl TlsRenewalEngine {
    pub fn new(
        keystore: Arc<KeyValueStore>,
        hsm: Option<Arc<HsmConnector>>,
        rsc: Arc<RscManager>,
        locks: Arc<LockManager>,
        dvcas: HashMap<String, Arc<DvcaConnection>>,
        config: Arc<Config>,
    ) -> Self {
        TlsRenewalEngine {
            keystore,
            hsm,
            rsc,
            locks,
            dvcas,
            config,
        }
    }

    fn provider_scope(provider_name: &str) -> Scope {
        Scope::from_segment(SegmentBuf::parse_lossy(provider_name))
    }

    fn entry_key(provider_name: &str, key_pair_name: &str) -> Key {
        Key::new_scoped(
            Self::provider_scope(provider_name),
            SegmentBuf::parse_lossy(key_pair_name),
        )
    }

    fn pending_csr_key(provider_name: &str) -> Key {
        Key::new_scoped(Self::provider_scope(provider_name), PENDING_CSR_KEY)
    }

    fn custody<'a>(&'a self, sp: &ServiceProviderConfig) -> EidResult<Custody<'a>> {
        match sp.key_custody {
            KeyCustodyType::Database => Ok(Custody::Db(&self.keystore)),
            KeyCustodyType::Hsm => match &self.hsm {
                Some(hsm) => Ok(Custody::Hsm(hsm)),
                None => Err(Error::config(format!(
                    "provider '{}' uses HSM key custody but no HSM is configured",
                    sp.name
                ))),
            },
        }
    }
}

/// # The scheduled deadline check
impl TlsRenewalEngine {
    /// One pass over all enabled providers.
    pub async fn check_all(&self) -> JobReport {
        let mut report = JobReport::new("TLS client certificate renewal");

        for sp in self.config.service_providers.iter().filter(|sp| sp.enabled) {
            match self.check_provider(sp).await {
                Ok(message) => report.add_success(&sp.name, message),
                Err(e) => {
                    warn!("TLS renewal check for '{}' failed: {e}", sp.name);
                    report.add_failure(&sp.name, classify(&e), e.to_string());
                }
            }
        }

        report
    }

    async fn check_provider(&self, sp: &ServiceProviderConfig) -> EidResult<String> {
        match self.check_cert(sp)? {
            CertStatus::Current => return Ok("certificate current".to_string()),
            CertStatus::Missing => {
                info!("No TLS client certificate for '{}', requesting one", sp.name)
            }
            CertStatus::RenewalDue => {
                info!("TLS client certificate for '{}' is due for renewal", sp.name)
            }
        }

        let lock = match self.locks.obtain_cvc_update_lock(&sp.name)? {
            Some(lock) => lock,
            None => {
                debug!("TLS renewal for '{}' is locked by another instance", sp.name);
                return Ok("locked by another instance".to_string());
            }
        };

        let result = self.renew_locked(sp).await;

        self.locks.release_cvc_update_lock(&lock)?;
        result
    }

    /// Checks the provider's client certificate against the renewal
    /// deadline.
    pub fn check_cert(&self, sp: &ServiceProviderConfig) -> EidResult<CertStatus> {
        let cert = match self.custody(sp)?.current_certificate(sp)? {
            Some(cert) => cert,
            None => return Ok(CertStatus::Missing),
        };

        let cert = X509::from_der(&cert)
            .map_err(|_| Error::custom(format!("stored client certificate for '{}' is corrupt", sp.name)))?;

        let deadline = Asn1Time::days_from_now(self.config.tls_renewal_lead_days as u32)
            .map_err(CryptoError::from)?;
        let due = cert
            .not_after()
            .compare(&deadline)
            .map_err(CryptoError::from)?
            != Ordering::Greater;

        if due {
            Ok(CertStatus::RenewalDue)
        } else {
            Ok(CertStatus::Current)
        }
    }

    async fn renew_locked(&self, sp: &ServiceProviderConfig) -> EidResult<String> {
        // an in-flight request means the key pair and CSR already exist;
        // never create a second pending key next to them
        if let Some(pending) = self.pending_csr(&sp.name)? {
            return Ok(format!(
                "awaiting certificate for request submitted {}",
                pending.submitted_at
            ));
        }

        let custody = self.custody(sp)?;

        if !custody.has_key_pair(sp, &sp.pending_client_key_pair)? {
            custody.generate_key_pair(sp, &sp.pending_client_key_pair)?;
            info!("Generated pending TLS key pair '{}' for '{}'", sp.pending_client_key_pair, sp.name);
        } else {
            debug!("Reusing existing pending TLS key pair for '{}'", sp.name);
        }

        let subject = CsrSubject {
            common_name: format!("{} TLS client authentication", sp.name),
            organization: self.config.organization.clone(),
            country: self.config.country_code.clone(),
        };
        let csr = custody.build_csr(sp, &sp.pending_client_key_pair, &subject)?;

        let signed_csr = self
            .rsc
            .sign_cms_container(&sp.name, &csr)?
            .ok_or_else(|| {
                Error::custom(format!(
                    "no usable request signer for '{}', cannot request TLS certificate",
                    sp.name
                ))
            })?;

        let dvca = self
            .dvcas
            .get(&sp.dvca)
            .ok_or_else(|| Error::dvca(format!("no connection for dvca '{}'", sp.dvca)))?;
        let receipt = dvca.request_new_tls(Bytes::from(signed_csr)).await?;

        let pending = PendingCsr {
            key_pair_name: sp.pending_client_key_pair.clone(),
            csr,
            submitted_at: Utc::now(),
            no_poll_before: receipt.no_poll_before,
        };
        self.keystore.store(&Self::pending_csr_key(&sp.name), &pending)?;

        Ok("submitted certificate signing request".to_string())
    }

    pub fn pending_csr(&self, provider_name: &str) -> EidResult<Option<PendingCsr>> {
        Ok(self.keystore.get(&Self::pending_csr_key(provider_name))?)
    }
}

/// # Installing the issued certificate
impl TlsRenewalEngine {
    /// Installs the certificate chain the DVCA issued for a pending CSR.
    ///
    /// The leaf's public key must match the provider's pending key pair;
    /// if that key pair does not exist or does not match, this is a
    /// terminal "key pair not found" failure and nothing is changed.
    pub fn store_certificate(
        &self,
        provider_name: &str,
        chain: Vec<Vec<u8>>,
    ) -> EidResult<()> {
        let sp = self
            .config
            .service_provider(provider_name)
            .ok_or_else(|| Error::UnknownServiceProvider(provider_name.to_string()))?;

        let leaf = chain
            .first()
            .ok_or_else(|| Error::custom("empty certificate chain"))?;
        let leaf = X509::from_der(leaf)
            .map_err(|_| Error::custom("issued certificate is not valid DER"))?;

        let custody = self.custody(sp)?;

        if !custody.has_key_pair(sp, &sp.pending_client_key_pair)? {
            return Err(Error::KeyPairNotFound(sp.pending_client_key_pair.clone()));
        }
        if !custody.key_matches(sp, &sp.pending_client_key_pair, &leaf)? {
            return Err(Error::KeyPairNotFound(format!(
                "public key of issued certificate matches no known pending key of '{provider_name}'"
            )));
        }

        custody.install_certificate(sp, chain)?;
        self.keystore.drop_key(&Self::pending_csr_key(provider_name))?;

        info!("Installed new TLS client certificate for '{provider_name}'");
        Ok(())
    }
}

//------------ Custody -------------------------------------------------------

/// The key custody capability interface with its two backends.
#[derive(Debug)]
enum Custody<'a> {
    Db(&'a Arc<KeyValueStore>),
    Hsm(&'a Arc<HsmConnector>),
}

impl Custody<'_> {
    fn hsm_alias(sp: &ServiceProviderConfig, key_pair_name: &str) -> String {
        format!("{}-{}", sp.name, key_pair_name)
    }

    fn has_key_pair(&self, sp: &ServiceProviderConfig, key_pair_name: &str) -> EidResult<bool> {
        match self {
            Custody::Db(keystore) => Ok(keystore
                .has(&TlsRenewalEngine::entry_key(&sp.name, key_pair_name))?),
            Custody::Hsm(hsm) => hsm
                .contains_key(&Self::hsm_alias(sp, key_pair_name))
                .map_err(|e| Error::hsm(e)),
        }
    }

    fn generate_key_pair(&self, sp: &ServiceProviderConfig, key_pair_name: &str) -> EidResult<()> {
        match self {
            Custody::Db(keystore) => {
                let entry = KeystoreEntry {
                    key: KeyPair::build_rsa()?,
                    certificate_chain: Vec::new(),
                };
                keystore.store(&TlsRenewalEngine::entry_key(&sp.name, key_pair_name), &entry)?;
                Ok(())
            }
            Custody::Hsm(hsm) => hsm
                .generate_key_pair(&Self::hsm_alias(sp, key_pair_name), 365)
                .map_err(|e| Error::hsm(e)),
        }
    }

    fn build_csr(
        &self,
        sp: &ServiceProviderConfig,
        key_pair_name: &str,
        subject: &CsrSubject,
    ) -> EidResult<Vec<u8>> {
        let key = self.key_pair(sp, key_pair_name)?;
        Ok(build_csr(subject, &key)?)
    }

    fn key_pair(&self, sp: &ServiceProviderConfig, key_pair_name: &str) -> EidResult<KeyPair> {
        match self {
            Custody::Db(keystore) => {
                let entry: KeystoreEntry = keystore
                    .get(&TlsRenewalEngine::entry_key(&sp.name, key_pair_name))?
                    .ok_or_else(|| Error::KeyPairNotFound(key_pair_name.to_string()))?;
                Ok(entry.key)
            }
            Custody::Hsm(hsm) => {
                // keys are generated exportable so that CSRs can be built
                // with the library stack
                let material = hsm
                    .export_key(&Self::hsm_alias(sp, key_pair_name))
                    .map_err(|e| Error::hsm(e))?;
                Ok(KeyPair::from_der(&material)?)
            }
        }
    }

    fn key_matches(
        &self,
        sp: &ServiceProviderConfig,
        key_pair_name: &str,
        cert: &X509,
    ) -> EidResult<bool> {
        match self {
            Custody::Db(_) => {
                let key = self.key_pair(sp, key_pair_name)?;
                Ok(key.matches_certificate(cert)?)
            }
            Custody::Hsm(hsm) => {
                let hsm_spki = hsm
                    .public_key(&Self::hsm_alias(sp, key_pair_name))
                    .map_err(|e| Error::hsm(e))?;
                let cert_spki = cert
                    .public_key()
                    .and_then(|key| key.public_key_to_der())
                    .map_err(CryptoError::from)?;
                Ok(hsm_spki == cert_spki)
            }
        }
    }

    fn current_certificate(&self, sp: &ServiceProviderConfig) -> EidResult<Option<Vec<u8>>> {
        match self {
            Custody::Db(keystore) => {
                let entry: Option<KeystoreEntry> =
                    keystore.get(&TlsRenewalEngine::entry_key(&sp.name, &sp.client_key_pair))?;
                Ok(entry.and_then(|entry| entry.certificate_chain.first().map(|c| c.0.clone())))
            }
            Custody::Hsm(hsm) => {
                let alias = Self::hsm_alias(sp, &sp.client_key_pair);
                if !hsm.contains_key(&alias).map_err(|e| Error::hsm(e))? {
                    return Ok(None);
                }
                hsm.certificate(&alias).map_err(|e| Error::hsm(e))
            }
        }
    }

    /// Swaps the issued certificate into the active slot.
    ///
    /// For database custody the new entry is written and the pending one
    /// cleared in one section. For HSM custody the current alias is
    /// deleted, the pending key renamed over it and the certificate
    /// imported, in that order, so that apart from the swap itself there
    /// is always a usable entry under the current alias.
    fn install_certificate(
        &self,
        sp: &ServiceProviderConfig,
        chain: Vec<Vec<u8>>,
    ) -> EidResult<()> {
        match self {
            Custody::Db(keystore) => {
                let current_key = TlsRenewalEngine::entry_key(&sp.name, &sp.client_key_pair);
                let pending_key =
                    TlsRenewalEngine::entry_key(&sp.name, &sp.pending_client_key_pair);

                keystore
                    .execute(&TlsRenewalEngine::provider_scope(&sp.name), |kv| {
                        let pending: KeystoreEntry = match kv.get(&pending_key)? {
                            Some(value) => serde_json::from_value(value)?,
                            None => {
                                return Err(crate::commons::storage::KeyValueError::UnknownKey(
                                    pending_key.clone(),
                                ));
                            }
                        };

                        let entry = KeystoreEntry {
                            key: pending.key,
                            certificate_chain: chain.iter().map(|c| CertDer(c.clone())).collect(),
                        };
                        kv.store(&current_key, serde_json::to_value(&entry)?)?;
                        kv.delete(&pending_key)?;
                        Ok(())
                    })
                    .map_err(Error::from)
            }
            Custody::Hsm(hsm) => {
                let current_alias = Self::hsm_alias(sp, &sp.client_key_pair);
                let pending_alias = Self::hsm_alias(sp, &sp.pending_client_key_pair);

                if hsm.contains_key(&current_alias).map_err(|e| Error::hsm(e))? {
                    hsm.delete_key(&current_alias).map_err(|e| Error::hsm(e))?;
                }
                hsm.rename_key(&pending_alias, &current_alias)
                    .map_err(|e| Error::hsm(e))?;
                let leaf = chain
                    .first()
                    .ok_or_else(|| Error::custom("empty certificate chain"))?;
                hsm.import_certificate(&current_alias, leaf)
                    .map_err(|e| Error::hsm(e))?;
                Ok(())
            }
        }
    }
}

fn classify(error: &Error) -> ManagementCode {
    match error {
        Error::ConfigError(_) | Error::KeyPairNotFound(_) => ManagementCode::ConfigurationError,
        Error::DvcaError(_) | Error::HttpClientError(_) => ManagementCode::RemoteUnavailable,
        Error::HsmError(_) => ManagementCode::RemoteUnavailable,
        _ => ManagementCode::UnexpectedError,
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::build_self_signed;
    use crate::constants::{KEY_ARCHIVE_NS, KEYSTORE_NS, LOCKS_NS, TERMINALS_NS};
    use crate::server::dvca::{DvcaCall, MockDvcaClient, TlsRequestReceipt};
    use crate::server::hsm::MockHsm;
    use crate::server::terminals::TerminalStore;
    use crate::test;

    fn test_config(custody: &str) -> Arc<Config> {
        Arc::new(
            toml::from_str(&format!(
                r#"
                country_code = "DE"
                organization = "test-org"
                public_service_provider = "sp-one"

                [[service_providers]]
                name = "sp-one"
                cvc_ref_id = "DETESTSP00001"
                dvca = "test-dvca"
                client_key_pair = "tls-client"
                pending_client_key_pair = "tls-client-pending"
                key_custody = "{custody}"

                [dvca.test-dvca]
                base_url = "https://dvca.example.org/api/"
                "#
            ))
            .unwrap(),
        )
    }

    struct TestSetup {
        engine: TlsRenewalEngine,
        dvca: Arc<DvcaConnection>,
        hsm: Option<Arc<HsmConnector>>,
        config: Arc<Config>,
    }

    fn setup(custody: &str) -> TestSetup {
        let storage = test::mem_storage();
        let config = test_config(custody);

        let terminals = Arc::new(TerminalStore::new(
            Arc::new(KeyValueStore::create(&storage, TERMINALS_NS).unwrap()),
            Arc::new(KeyValueStore::create(&storage, KEY_ARCHIVE_NS).unwrap()),
        ));
        let locks = Arc::new(LockManager::new(
            Arc::new(KeyValueStore::create(&storage, LOCKS_NS).unwrap()),
            "instance-a".to_string(),
            5,
        ));
        let keystore = Arc::new(KeyValueStore::create(&storage, KEYSTORE_NS).unwrap());

        let rsc = Arc::new(RscManager::new(terminals, config.clone()));
        rsc.generate_new_pending_rsc("sp-one", None, 12).unwrap();
        rsc.promote_pending_rsc("sp-one").unwrap();

        let dvca = Arc::new(DvcaConnection::Mock(MockDvcaClient::new()));
        let mut dvcas = HashMap::new();
        dvcas.insert("test-dvca".to_string(), dvca.clone());

        let hsm = (custody == "hsm").then(|| Arc::new(HsmConnector::Mock(MockHsm::new())));

        let engine = TlsRenewalEngine::new(
            keystore,
            hsm.clone(),
            rsc,
            locks,
            dvcas,
            config.clone(),
        );

        TestSetup {
            engine,
            dvca,
            hsm,
            config,
        }
    }

    fn mock(setup: &TestSetup) -> &MockDvcaClient {
        let DvcaConnection::Mock(mock) = setup.dvca.as_ref() else {
            unreachable!()
        };
        mock
    }

    fn sp(setup: &TestSetup) -> &ServiceProviderConfig {
        setup.config.service_provider("sp-one").unwrap()
    }

    /// Issues a certificate for the pending key, as the DVCA would.
    fn issue_for_pending(setup: &TestSetup) -> Vec<u8> {
        let custody = setup.engine.custody(sp(setup)).unwrap();
        let key = custody.key_pair(sp(setup), "tls-client-pending").unwrap();
        build_self_signed("sp-one TLS client authentication", &key, 12).unwrap()
    }

    #[tokio::test]
    async fn missing_certificate_triggers_csr_submission() {
        let setup = setup("database");
        mock(&setup).set_tls_receipt(TlsRequestReceipt {
            no_poll_before: Some(Utc::now() + chrono::Duration::minutes(10)),
        });

        assert_eq!(setup.engine.check_cert(sp(&setup)).unwrap(), CertStatus::Missing);

        let report = setup.engine.check_all().await;
        assert!(report.success(), "{report}");

        let pending = setup.engine.pending_csr("sp-one").unwrap().unwrap();
        assert_eq!(pending.key_pair_name, "tls-client-pending");
        assert!(pending.no_poll_before.is_some());
        assert_eq!(mock(&setup).calls().len(), 1);

        // a second check must reuse the in-flight request: no second key,
        // no second submission
        let report = setup.engine.check_all().await;
        assert!(report.success());
        assert_eq!(mock(&setup).calls().len(), 1);
    }

    #[tokio::test]
    async fn issued_certificate_is_swapped_in() {
        let setup = setup("database");

        setup.engine.check_all().await;
        let issued = issue_for_pending(&setup);

        setup
            .engine
            .store_certificate("sp-one", vec![issued.clone()])
            .unwrap();

        // now there is a current certificate and no pending state
        assert_ne!(setup.engine.check_cert(sp(&setup)).unwrap(), CertStatus::Missing);
        assert!(setup.engine.pending_csr("sp-one").unwrap().is_none());
        let custody = setup.engine.custody(sp(&setup)).unwrap();
        assert!(!custody.has_key_pair(sp(&setup), "tls-client-pending").unwrap());

        let stored = custody.current_certificate(sp(&setup)).unwrap().unwrap();
        assert_eq!(stored, issued);
    }

    #[tokio::test]
    async fn mismatched_certificate_is_rejected_without_changes() {
        let setup = setup("database");

        setup.engine.check_all().await;

        // a certificate for an unrelated key pair
        let other_key = KeyPair::build_rsa().unwrap();
        let bogus = build_self_signed("sp-one TLS client authentication", &other_key, 12).unwrap();

        let err = setup
            .engine
            .store_certificate("sp-one", vec![bogus])
            .unwrap_err();
        assert!(matches!(err, Error::KeyPairNotFound(_)));

        // the pending key and request are untouched
        assert!(setup.engine.pending_csr("sp-one").unwrap().is_some());
        let custody = setup.engine.custody(sp(&setup)).unwrap();
        assert!(custody.has_key_pair(sp(&setup), "tls-client-pending").unwrap());
    }

    #[tokio::test]
    async fn store_without_pending_key_is_key_pair_not_found() {
        let setup = setup("database");

        let key = KeyPair::build_rsa().unwrap();
        let cert = build_self_signed("sp-one TLS client authentication", &key, 12).unwrap();

        let err = setup.engine.store_certificate("sp-one", vec![cert]).unwrap_err();
        assert!(matches!(err, Error::KeyPairNotFound(_)));
    }

    #[tokio::test]
    async fn hsm_custody_swaps_aliases_in_order() {
        let setup = setup("hsm");

        let report = setup.engine.check_all().await;
        assert!(report.success(), "{report}");

        let hsm = setup.hsm.as_ref().unwrap();
        let HsmConnector::Mock(mock_hsm) = hsm.as_ref() else {
            unreachable!()
        };
        assert!(mock_hsm.contains_key("sp-one-tls-client-pending").unwrap());

        let issued = issue_for_pending(&setup);
        setup
            .engine
            .store_certificate("sp-one", vec![issued.clone()])
            .unwrap();

        // the pending alias became the current alias, with the new
        // certificate imported next to the key
        assert!(!mock_hsm.contains_key("sp-one-tls-client-pending").unwrap());
        assert!(mock_hsm.contains_key("sp-one-tls-client").unwrap());
        assert_eq!(
            mock_hsm.certificate("sp-one-tls-client").unwrap().unwrap(),
            issued
        );
        assert_eq!(setup.engine.check_cert(sp(&setup)).unwrap(), CertStatus::Current);

        // and the mutation order protects the current alias: rename
        // happened before the certificate import
        use crate::server::hsm::MockHsmOp;
        let ops = mock_hsm.ops();
        let rename_pos = ops
            .iter()
            .position(|op| matches!(op, MockHsmOp::Rename(_, _)))
            .unwrap();
        let import_pos = ops
            .iter()
            .position(|op| matches!(op, MockHsmOp::ImportCertificate(_)))
            .unwrap();
        assert!(rename_pos < import_pos);
    }

    #[tokio::test]
    async fn renewal_due_is_detected_from_certificate_validity() {
        let setup = setup("database");

        // install a certificate that expires immediately: due
        let custody = setup.engine.custody(sp(&setup)).unwrap();
        custody.generate_key_pair(sp(&setup), "tls-client-pending").unwrap();
        let key = custody.key_pair(sp(&setup), "tls-client-pending").unwrap();
        let expiring = build_self_signed("sp-one TLS client authentication", &key, 0).unwrap();
        custody
            .install_certificate(sp(&setup), vec![expiring])
            .unwrap();
        assert_eq!(
            setup.engine.check_cert(sp(&setup)).unwrap(),
            CertStatus::RenewalDue
        );

        // a renewal run takes the full path again
        let report = setup.engine.check_all().await;
        assert!(report.success(), "{report}");
        assert!(matches!(
            mock(&setup).calls().first(),
            Some(DvcaCall::RequestNewTls(_))
        ));
    }
}
