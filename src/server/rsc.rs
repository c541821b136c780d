//! Request signer certificates.
//!
//! Outgoing certificate requests towards the DVCA are CMS signed with a
//! per provider request signer certificate (RSC). Rotation works through
//! a pending RSC that coexists with the current one until the DVCA has
//! acknowledged it.

use std::sync::Arc;

use log::{info, warn};
use openssl::x509::X509;

use crate::commons::crypto::{self, KeyPair};
use crate::commons::{EidResult, Error};
use crate::config::Config;
use crate::server::terminals::{RequestSignerCertificate, TerminalStore};

//------------ RscManager ----------------------------------------------------

#[derive(Debug)]
pub struct RscManager {
    terminals: Arc<TerminalStore>,
    config: Arc<Config>,
}

impl RscManager {
    pub fn new(terminals: Arc<TerminalStore>, config: Arc<Config>) -> Self {
        RscManager { terminals, config }
    }

    fn ref_id_for(&self, provider_name: &str) -> EidResult<String> {
        self.config
            .service_provider(provider_name)
            .map(|sp| sp.cvc_ref_id.clone())
            .ok_or_else(|| Error::UnknownServiceProvider(provider_name.to_string()))
    }

    /// Generates a new pending request signer certificate for the
    /// provider.
    ///
    /// Returns `false` without mutating anything if the requested
    /// validity exceeds the configured ceiling, or if a private provider
    /// has no current holder reference to chain trust from. Only the
    /// cluster's single public provider may bootstrap a signer out of
    /// nothing.
    pub fn generate_new_pending_rsc(
        &self,
        provider_name: &str,
        current_holder_ref: Option<&str>,
        validity_months: u32,
    ) -> EidResult<bool> {
        if validity_months > self.config.rsc_max_validity_months {
            warn!(
                "Refusing request signer certificate for '{provider_name}': \
                 validity of {validity_months} months exceeds the ceiling of {} months",
                self.config.rsc_max_validity_months
            );
            return Ok(false);
        }

        let ref_id = self.ref_id_for(provider_name)?;

        let holder_reference = if self.config.is_public_service_provider(provider_name) {
            next_holder_reference(provider_name, current_holder_ref)
        } else {
            match current_holder_ref {
                Some(current) => next_holder_reference(provider_name, Some(current)),
                None => {
                    warn!(
                        "Refusing request signer certificate for private provider \
                         '{provider_name}': no current holder reference to chain trust from"
                    );
                    return Ok(false);
                }
            }
        };

        let key = KeyPair::build_ec()?;
        let certificate = crypto::build_self_signed(&holder_reference, &key, validity_months)?;

        self.terminals.set_pending_rsc(
            &ref_id,
            &RequestSignerCertificate {
                holder_reference: holder_reference.clone(),
                key,
                certificate,
                current: false,
            },
        )?;

        info!("Generated pending request signer certificate '{holder_reference}' for '{provider_name}'");
        Ok(true)
    }

    /// Signs the payload with the provider's current request signer key.
    ///
    /// An empty result means no usable signer is available. Callers must
    /// treat that as a hard stop for the renewal step they are in, not as
    /// something to silently skip.
    pub fn sign_cms_container(
        &self,
        provider_name: &str,
        payload: &[u8],
    ) -> EidResult<Option<Vec<u8>>> {
        let ref_id = self.ref_id_for(provider_name)?;

        let rsc = match self.terminals.current_rsc(&ref_id)? {
            Some(rsc) => rsc,
            None => {
                warn!("No current request signer certificate for '{provider_name}'");
                return Ok(None);
            }
        };

        let cert = X509::from_der(&rsc.certificate)
            .map_err(|_| Error::custom(format!("stored signer certificate for '{provider_name}' is corrupt")))?;

        let signed = crypto::sign_cms(&cert, rsc.key.pkey(), payload)?;
        Ok(Some(signed))
    }

    /// Promotes the pending signer to current, once the DVCA has
    /// acknowledged it.
    pub fn promote_pending_rsc(&self, provider_name: &str) -> EidResult<bool> {
        let ref_id = self.ref_id_for(provider_name)?;
        self.terminals.promote_pending_rsc(&ref_id)
    }

    /// The current signer's holder reference, if the provider has one.
    pub fn current_holder_reference(&self, provider_name: &str) -> EidResult<Option<String>> {
        let ref_id = self.ref_id_for(provider_name)?;
        Ok(self
            .terminals
            .current_rsc(&ref_id)?
            .map(|rsc| rsc.holder_reference))
    }
}

/// Derives the next holder reference (CHR).
///
/// A CHR carries a two digit sequence suffix: `sp-one_01`, `sp-one_02`,
/// .. A current reference is incremented; without one the sequence starts
/// at 01.
fn next_holder_reference(provider_name: &str, current: Option<&str>) -> String {
    if let Some(current) = current {
        if let Some((stem, sequence)) = current.rsplit_once('_') {
            if let Ok(sequence) = sequence.parse::<u32>() {
                return format!("{stem}_{:02}", sequence + 1);
            }
        }
    }
    format!("{provider_name}_01")
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::commons::crypto::verify_cms;
    use crate::commons::storage::KeyValueStore;
    use crate::constants::{KEY_ARCHIVE_NS, TERMINALS_NS};
    use crate::test;

    fn config(public_provider: Option<&str>) -> Arc<Config> {
        let mut toml_str = format!(
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
        );
        if let Some(public) = public_provider {
            toml_str = format!("public_service_provider = \"{public}\"\n{toml_str}");
        }
        Arc::new(toml::from_str(&toml_str).unwrap())
    }

    fn manager(public_provider: Option<&str>) -> (RscManager, Arc<TerminalStore>) {
        let storage = test::mem_storage();
        let terminals = Arc::new(TerminalStore::new(
            Arc::new(KeyValueStore::create(&storage, TERMINALS_NS).unwrap()),
            Arc::new(KeyValueStore::create(&storage, KEY_ARCHIVE_NS).unwrap()),
        ));
        (RscManager::new(terminals.clone(), config(public_provider)), terminals)
    }

    #[test]
    fn private_provider_needs_holder_reference() {
        let (manager, terminals) = manager(None);

        assert!(!manager.generate_new_pending_rsc("sp-one", None, 12).unwrap());
        assert!(terminals.pending_rsc("DETESTSP00001").unwrap().is_none());

        assert!(manager
            .generate_new_pending_rsc("sp-one", Some("sp-one_01"), 12)
            .unwrap());
        let pending = terminals.pending_rsc("DETESTSP00001").unwrap().unwrap();
        assert_eq!(pending.holder_reference, "sp-one_02");
    }

    #[test]
    fn public_provider_may_bootstrap() {
        let (manager, terminals) = manager(Some("sp-one"));

        assert!(manager.generate_new_pending_rsc("sp-one", None, 12).unwrap());
        let pending = terminals.pending_rsc("DETESTSP00001").unwrap().unwrap();
        assert_eq!(pending.holder_reference, "sp-one_01");
    }

    #[test]
    fn validity_ceiling_is_enforced() {
        let (manager, terminals) = manager(Some("sp-one"));

        assert!(!manager.generate_new_pending_rsc("sp-one", None, 120).unwrap());
        assert!(terminals.pending_rsc("DETESTSP00001").unwrap().is_none());
    }

    #[test]
    fn sign_cms_requires_a_current_signer() {
        let (manager, terminals) = manager(Some("sp-one"));

        assert!(manager
            .sign_cms_container("sp-one", b"payload")
            .unwrap()
            .is_none());

        manager.generate_new_pending_rsc("sp-one", None, 12).unwrap();
        manager.promote_pending_rsc("sp-one").unwrap();

        let signed = manager
            .sign_cms_container("sp-one", b"payload")
            .unwrap()
            .unwrap();

        let rsc = terminals.current_rsc("DETESTSP00001").unwrap().unwrap();
        let rsc_cert = X509::from_der(&rsc.certificate).unwrap();
        assert_eq!(verify_cms(&signed, &rsc_cert).unwrap(), b"payload");
    }

    #[test]
    fn holder_reference_sequence() {
        assert_eq!(next_holder_reference("sp", None), "sp_01");
        assert_eq!(next_holder_reference("sp", Some("sp_01")), "sp_02");
        assert_eq!(next_holder_reference("sp", Some("sp_09")), "sp_10");
        assert_eq!(next_holder_reference("sp", Some("weird")), "sp_01");
    }
}
