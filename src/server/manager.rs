//! Builds and owns the components of a running gateway instance.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use log::info;
use openssl::x509::X509;

use crate::commons::error::FatalIoError;
use crate::commons::storage::KeyValueStore;
use crate::commons::{EidResult, Error};
use crate::config::Config;
use crate::constants::{
    BLOCKLIST_NS, KEY_ARCHIVE_NS, KEYSTORE_NS, LOCKS_NS, TERMINALS_NS,
};
use crate::server::blocklist::{BlocklistStore, BlocklistSynchronizer};
use crate::server::cvc::CvcManager;
use crate::server::dvca::{DvcaConnection, HttpDvcaClient};
use crate::server::hsm::HsmConnector;
use crate::server::hsm::checker::KeyLockChecker;
use crate::server::hsm::rotation::KeyRotationService;
use crate::server::locks::LockManager;
use crate::server::rsc::RscManager;
use crate::server::terminals::TerminalStore;
use crate::server::tls::TlsRenewalEngine;

#[cfg(feature = "hsm")]
use crate::constants::HSM_KEYS_NS;
#[cfg(feature = "hsm")]
use crate::server::hsm::Pkcs11Hsm;

//------------ GatewayManager ------------------------------------------------

/// The wired up credential lifecycle core of one cluster instance.
pub struct GatewayManager {
    config: Arc<Config>,
    terminals: Arc<TerminalStore>,
    locks: Arc<LockManager>,
    blocklist: Arc<BlocklistStore>,
    blocklist_synchronizer: Arc<BlocklistSynchronizer>,
    rotation: Arc<KeyRotationService>,
    lock_checker: Arc<KeyLockChecker>,
    tls_engine: Arc<TlsRenewalEngine>,
    cvc: Arc<CvcManager>,
    rsc: Arc<RscManager>,
}

impl GatewayManager {
    /// Builds all components against the configured storage, DVCA
    /// endpoints and, where configured, the HSM.
    pub fn build(config: Arc<Config>) -> EidResult<Self> {
        let storage_uri = &config.storage_uri;

        let terminals = Arc::new(TerminalStore::new(
            Arc::new(KeyValueStore::create(storage_uri, TERMINALS_NS)?),
            Arc::new(KeyValueStore::create(storage_uri, KEY_ARCHIVE_NS)?),
        ));
        let locks = Arc::new(LockManager::new(
            Arc::new(KeyValueStore::create(storage_uri, LOCKS_NS)?),
            config.instance_address.clone(),
            config.lock_stale_minutes,
        ));
        let keystore = Arc::new(KeyValueStore::create(storage_uri, KEYSTORE_NS)?);

        let mut dvcas = HashMap::new();
        let mut trust_anchors = HashMap::new();
        for (name, dvca_config) in &config.dvca {
            dvcas.insert(
                name.clone(),
                Arc::new(DvcaConnection::Http(HttpDvcaClient::new(
                    dvca_config.base_url.clone(),
                ))),
            );
            if let Some(path) = &dvca_config.trust_anchor {
                let pem = fs::read(path).map_err(|e| {
                    FatalIoError::new(
                        format!("cannot read trust anchor '{}'", path.display()),
                        e,
                    )
                })?;
                let cert = X509::from_pem(&pem).map_err(|_| {
                    Error::config(format!(
                        "trust anchor '{}' is not a PEM certificate",
                        path.display()
                    ))
                })?;
                trust_anchors.insert(name.clone(), cert);
            }
        }

        let hsm = Self::connect_hsm(&config, storage_uri)?;
        if let Some(hsm) = &hsm {
            info!("Using {hsm}");
        }

        let blocklist = Arc::new(BlocklistStore::new(
            Arc::new(KeyValueStore::create(storage_uri, BLOCKLIST_NS)?),
            config.blocklist_store_dir.clone(),
        ));
        let blocklist_synchronizer = Arc::new(BlocklistSynchronizer::new(
            blocklist.clone(),
            terminals.clone(),
            dvcas.clone(),
            trust_anchors,
            config.clone(),
        ));

        let rotation = Arc::new(KeyRotationService::new(
            hsm.clone(),
            terminals.clone(),
            locks.clone(),
            config.hsm_key_retention_days,
            config.hsm_key_validity_days,
        ));
        let lock_checker = Arc::new(KeyLockChecker::new(
            hsm.clone(),
            rotation.clone(),
            locks.clone(),
            terminals.clone(),
        ));

        let rsc = Arc::new(RscManager::new(terminals.clone(), config.clone()));
        let tls_engine = Arc::new(TlsRenewalEngine::new(
            keystore,
            hsm,
            rsc.clone(),
            locks.clone(),
            dvcas.clone(),
            config.clone(),
        ));
        let cvc = Arc::new(CvcManager::new(
            terminals.clone(),
            locks.clone(),
            rsc.clone(),
            dvcas,
            config.clone(),
        ));

        Ok(GatewayManager {
            config,
            terminals,
            locks,
            blocklist,
            blocklist_synchronizer,
            rotation,
            lock_checker,
            tls_engine,
            cvc,
            rsc,
        })
    }

    #[cfg(feature = "hsm")]
    fn connect_hsm(config: &Config, storage_uri: &url::Url) -> EidResult<Option<Arc<HsmConnector>>> {
        match &config.hsm {
            Some(hsm_config) => {
                let mapper = Arc::new(KeyValueStore::create(storage_uri, HSM_KEYS_NS)?);
                let hsm = Pkcs11Hsm::build(hsm_config, mapper).map_err(Error::hsm)?;
                Ok(Some(Arc::new(HsmConnector::Pkcs11(hsm))))
            }
            None => Ok(None),
        }
    }

    #[cfg(not(feature = "hsm"))]
    fn connect_hsm(_config: &Config, _storage_uri: &url::Url) -> EidResult<Option<Arc<HsmConnector>>> {
        Ok(None)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn terminals(&self) -> &Arc<TerminalStore> {
        &self.terminals
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn blocklist(&self) -> &Arc<BlocklistStore> {
        &self.blocklist
    }

    pub fn blocklist_synchronizer(&self) -> &Arc<BlocklistSynchronizer> {
        &self.blocklist_synchronizer
    }

    pub fn rotation(&self) -> &Arc<KeyRotationService> {
        &self.rotation
    }

    pub fn lock_checker(&self) -> &Arc<KeyLockChecker> {
        &self.lock_checker
    }

    pub fn tls_engine(&self) -> &Arc<TlsRenewalEngine> {
        &self.tls_engine
    }

    pub fn cvc(&self) -> &Arc<CvcManager> {
        &self.cvc
    }

    pub fn rsc(&self) -> &Arc<RscManager> {
        &self.rsc
    }

    /// Removes a decommissioned provider's credential state: the
    /// terminal row with everything under it, and its block list with
    /// the audit snapshots.
    pub fn decommission_provider(&self, provider_name: &str) -> EidResult<()> {
        let sp = self
            .config
            .service_provider(provider_name)
            .ok_or_else(|| Error::UnknownServiceProvider(provider_name.to_string()))?;

        if let Some(terminal) = self.terminals.get_terminal(&sp.cvc_ref_id)? {
            if let Some(sector_id) = &terminal.sector_id {
                self.blocklist.remove_sector(sector_id, &sp.cvc_ref_id)?;
            }
        }
        self.terminals.remove_terminal(&sp.cvc_ref_id)?;

        info!("Decommissioned service provider '{provider_name}'");
        Ok(())
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    fn test_config() -> Arc<Config> {
        let storage = test::mem_storage();
        let (dir, _) = test::tmp_dir();
        Arc::new(
            toml::from_str(&format!(
                r#"
                country_code = "DE"
                storage_uri = "{storage}"
                blocklist_store_dir = "{}"

                [[service_providers]]
                name = "sp-one"
                cvc_ref_id = "DETESTSP00001"
                dvca = "test-dvca"
                client_key_pair = "sp-one-tls"
                pending_client_key_pair = "sp-one-tls-pending"

                [dvca.test-dvca]
                base_url = "https://dvca.example.org/api/"
                "#,
                dir.display()
            ))
            .unwrap(),
        )
    }

    #[test]
    fn decommissioning_removes_all_credential_state() {
        let manager = GatewayManager::build(test_config()).unwrap();
        let ref_id = "DETESTSP00001";

        manager.terminals().get_or_create_terminal(ref_id).unwrap();
        manager
            .terminals()
            .set_sector_id(ref_id, b"sector".to_vec())
            .unwrap();
        manager
            .blocklist()
            .apply_complete(b"sector", 1, vec!["hash-1".to_string()])
            .unwrap();

        manager.decommission_provider("sp-one").unwrap();

        assert!(manager.terminals().get_terminal(ref_id).unwrap().is_none());
        assert!(manager.blocklist().entries(b"sector").unwrap().is_empty());
        assert!(
            manager
                .decommission_provider("unknown-sp")
                .is_err()
        );
    }
}
