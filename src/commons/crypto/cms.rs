//! CMS signed containers.
//!
//! Outgoing certificate requests are signed with the service provider's
//! request signer certificate; incoming block list responses are verified
//! against the DVCA trust anchor before anything is applied.

use openssl::cms::{CMSOptions, CmsContentInfo};
use openssl::pkey::{PKeyRef, Private};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509, X509Ref};

use crate::commons::crypto::{CryptoError, CryptoResult};

/// Signs the payload into an attached CMS SignedData container and returns
/// its DER encoding.
pub fn sign_cms(cert: &X509Ref, key: &PKeyRef<Private>, payload: &[u8]) -> CryptoResult<Vec<u8>> {
    let cms = CmsContentInfo::sign(
        Some(cert),
        Some(key),
        None,
        Some(payload),
        CMSOptions::BINARY,
    )?;
    Ok(cms.to_der()?)
}

/// Verifies an attached CMS SignedData container against the given trust
/// anchor and returns the signed content.
///
/// Verification happens before any of the content is looked at; a failure
/// here must leave all state untouched.
pub fn verify_cms(cms_der: &[u8], trust_anchor: &X509) -> CryptoResult<Vec<u8>> {
    let mut cms = CmsContentInfo::from_der(cms_der).map_err(|_| CryptoError::DecodeError)?;

    let mut store_builder = X509StoreBuilder::new()?;
    store_builder.add_cert(trust_anchor.clone())?;
    let store = store_builder.build();

    let mut content = Vec::new();
    cms.verify(None, Some(&store), None, Some(&mut content), CMSOptions::empty())
        .map_err(|_| CryptoError::InvalidSignature)?;

    Ok(content)
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::{KeyPair, build_self_signed};

    fn signer() -> (X509, KeyPair) {
        let key = KeyPair::build_ec().unwrap();
        let cert_der = build_self_signed("TEST_SIGNER_01", &key, 12).unwrap();
        (X509::from_der(&cert_der).unwrap(), key)
    }

    #[test]
    fn sign_then_verify() {
        let (cert, key) = signer();
        let payload = b"payload bytes";

        let cms = sign_cms(&cert, key.pkey(), payload).unwrap();
        let content = verify_cms(&cms, &cert).unwrap();
        assert_eq!(content, payload);
    }

    #[test]
    fn verify_rejects_other_anchor() {
        let (cert, key) = signer();
        let (other_cert, _) = signer();

        let cms = sign_cms(&cert, key.pkey(), b"payload").unwrap();
        assert!(verify_cms(&cms, &other_cert).is_err());
    }
}
