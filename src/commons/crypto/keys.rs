//! Support for key pairs held in the database, and the certificate
//! requests and certificates built from them.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{Months, Utc};
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509, X509Builder, X509NameBuilder, X509ReqBuilder};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de, ser};

use crate::commons::crypto::{CryptoError, CryptoResult};

//------------ KeyPair -------------------------------------------------------

/// An openssl based key pair.
///
/// Serializes to the base64 encoded DER of the private key so that it can
/// be kept in the key value store alongside the credential state it
/// belongs to.
pub struct KeyPair {
    pkey: PKey<Private>,
}

impl KeyPair {
    /// Generates an RSA key pair. Used for TLS client keys.
    pub fn build_rsa() -> CryptoResult<Self> {
        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;
        Ok(KeyPair { pkey })
    }

    /// Generates a P-256 key pair. Used for request signer keys.
    pub fn build_ec() -> CryptoResult<Self> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let ec = EcKey::generate(&group)?;
        let pkey = PKey::from_ec_key(ec)?;
        Ok(KeyPair { pkey })
    }

    pub fn from_der(der: &[u8]) -> CryptoResult<Self> {
        let pkey = PKey::private_key_from_der(der).map_err(|_| CryptoError::DecodeError)?;
        Ok(KeyPair { pkey })
    }

    pub fn to_der(&self) -> CryptoResult<Vec<u8>> {
        Ok(self.pkey.private_key_to_der()?)
    }

    pub fn pkey(&self) -> &PKey<Private> {
        &self.pkey
    }

    /// Returns the DER encoded subject public key info.
    pub fn public_key_der(&self) -> CryptoResult<Vec<u8>> {
        Ok(self.pkey.public_key_to_der()?)
    }

    /// Returns whether the given certificate was issued for this key pair.
    pub fn matches_certificate(&self, cert: &X509) -> CryptoResult<bool> {
        let cert_key = cert.public_key()?;
        Ok(self.pkey.public_eq(&cert_key))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").finish()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        // The DER round trip cannot fail for a key we hold in memory.
        let der = self.pkey.private_key_to_der().unwrap();
        KeyPair {
            pkey: PKey::private_key_from_der(&der).unwrap(),
        }
    }
}

impl Serialize for KeyPair {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes: Vec<u8> = self
            .pkey
            .as_ref()
            .private_key_to_der()
            .map_err(ser::Error::custom)?;

        BASE64.encode(&bytes).serialize(s)
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D>(d: D) -> Result<KeyPair, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        let bytes = BASE64.decode(&string).map_err(de::Error::custom)?;
        let pkey = PKey::private_key_from_der(&bytes).map_err(de::Error::custom)?;
        Ok(KeyPair { pkey })
    }
}

//------------ CsrSubject ----------------------------------------------------

/// The subject for a TLS client certificate signing request.
#[derive(Clone, Debug)]
pub struct CsrSubject {
    pub common_name: String,
    pub organization: String,
    pub country: String,
}

/// Builds a DER encoded PKCS#10 certificate signing request.
pub fn build_csr(subject: &CsrSubject, key: &KeyPair) -> CryptoResult<Vec<u8>> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, &subject.common_name)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, &subject.organization)?;
    name.append_entry_by_nid(Nid::COUNTRYNAME, &subject.country)?;
    let name = name.build();

    let mut req = X509ReqBuilder::new()?;
    req.set_version(0)?;
    req.set_subject_name(&name)?;
    req.set_pubkey(key.pkey())?;
    req.sign(key.pkey(), MessageDigest::sha256())?;

    Ok(req.build().to_der()?)
}

/// Builds a self signed certificate for the given holder, valid for the
/// given number of months from now.
pub fn build_self_signed(
    common_name: &str,
    key: &KeyPair,
    validity_months: u32,
) -> CryptoResult<Vec<u8>> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let name = name.build();

    let not_after = Utc::now()
        .checked_add_months(Months::new(validity_months))
        .ok_or_else(|| CryptoError::Other("validity overflows".to_string()))?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(random_serial()?.as_ref())?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::from_unix(not_after.timestamp())?.as_ref())?;
    builder.set_pubkey(key.pkey())?;
    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .build()?,
    )?;
    builder.sign(key.pkey(), MessageDigest::sha256())?;

    Ok(builder.build().to_der()?)
}

fn random_serial() -> CryptoResult<Asn1Integer> {
    let mut bn = BigNum::new()?;
    bn.rand(159, MsbOption::MAYBE_ZERO, false)?;
    Ok(bn.to_asn1_integer()?)
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_serialize_and_deserialize_key() {
        let key = KeyPair::build_rsa().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        let key_des: KeyPair = serde_json::from_str(json.as_str()).unwrap();
        let json_from_des = serde_json::to_string(&key_des).unwrap();

        // comparing json, because PKey and its internal friends do not
        // implement Eq and PartialEq.
        assert_eq!(json, json_from_des);
    }

    #[test]
    fn self_signed_matches_key() {
        let key = KeyPair::build_ec().unwrap();
        let cert_der = build_self_signed("PROVIDER_01", &key, 12).unwrap();
        let cert = X509::from_der(&cert_der).unwrap();
        assert!(key.matches_certificate(&cert).unwrap());

        let other = KeyPair::build_ec().unwrap();
        assert!(!other.matches_certificate(&cert).unwrap());
    }

    #[test]
    fn csr_carries_subject() {
        let key = KeyPair::build_rsa().unwrap();
        let subject = CsrSubject {
            common_name: "sp-one TLS client authentication".to_string(),
            organization: "eidgate".to_string(),
            country: "DE".to_string(),
        };
        let csr_der = build_csr(&subject, &key).unwrap();
        let req = openssl::x509::X509Req::from_der(&csr_der).unwrap();
        assert!(req.verify(&req.public_key().unwrap()).unwrap());
    }
}
