//! Access to the HSM shared by the cluster, where one is configured.

mod mock;
#[cfg(feature = "hsm")]
mod pkcs11;

pub mod checker;
pub mod rotation;

pub use self::mock::{MockHsm, MockHsmOp};
#[cfg(feature = "hsm")]
pub use self::pkcs11::Pkcs11Hsm;

use std::fmt;

use chrono::{DateTime, Utc};

//------------ HsmError ------------------------------------------------------

#[derive(Debug)]
pub enum HsmError {
    KeyNotFound(String),
    NotExtractable(String),
    Pkcs11(String),
    PermanentlyUnusable,
    Other(String),
}

impl fmt::Display for HsmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HsmError::KeyNotFound(alias) => write!(f, "no key with alias '{alias}'"),
            HsmError::NotExtractable(alias) => {
                write!(f, "key material of '{alias}' cannot be exported")
            }
            HsmError::Pkcs11(msg) => write!(f, "PKCS#11 error: {msg}"),
            HsmError::PermanentlyUnusable => {
                write!(f, "the HSM lacks capabilities required by eidgate")
            }
            HsmError::Other(msg) => msg.fmt(f),
        }
    }
}

impl std::error::Error for HsmError {}

pub type HsmResult<T> = Result<T, HsmError>;

//------------ HsmConnector --------------------------------------------------

/// Dispatches HSM requests to a particular implementation.
///
/// The session towards the device is obtained once per instance and
/// reused; callers must not issue two concurrent operations on the same
/// alias from one instance. Cross instance discipline comes from the
/// [`ChangeKeyLock`][crate::server::locks::ChangeKeyLock] protocol, not
/// from the device.
#[derive(Debug)]
pub enum HsmConnector {
    #[cfg(feature = "hsm")]
    Pkcs11(Pkcs11Hsm),
    Mock(MockHsm),
}

impl HsmConnector {
    /// All key aliases present in the HSM.
    pub fn aliases(&self) -> HsmResult<Vec<String>> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.aliases(),
            HsmConnector::Mock(hsm) => hsm.aliases(),
        }
    }

    pub fn contains_key(&self, alias: &str) -> HsmResult<bool> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.contains_key(alias),
            HsmConnector::Mock(hsm) => hsm.contains_key(alias),
        }
    }

    /// The key's stored expiration attribute. `Ok(None)` means the HSM
    /// does not support or did not record the attribute; callers fall
    /// back to the generation date plus a fixed validity window.
    pub fn expiration_date(&self, alias: &str) -> HsmResult<Option<DateTime<Utc>>> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.expiration_date(alias),
            HsmConnector::Mock(hsm) => hsm.expiration_date(alias),
        }
    }

    pub fn generation_date(&self, alias: &str) -> HsmResult<DateTime<Utc>> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.generation_date(alias),
            HsmConnector::Mock(hsm) => hsm.generation_date(alias),
        }
    }

    pub fn generate_key_pair(&self, alias: &str, validity_days: i64) -> HsmResult<()> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.generate_key_pair(alias, validity_days),
            HsmConnector::Mock(hsm) => hsm.generate_key_pair(alias, validity_days),
        }
    }

    /// The DER encoded subject public key info of the key pair.
    pub fn public_key(&self, alias: &str) -> HsmResult<Vec<u8>> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.public_key(alias),
            HsmConnector::Mock(hsm) => hsm.public_key(alias),
        }
    }

    /// Exports the raw key material, for archival before deletion.
    pub fn export_key(&self, alias: &str) -> HsmResult<Vec<u8>> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.export_key(alias),
            HsmConnector::Mock(hsm) => hsm.export_key(alias),
        }
    }

    /// Imports previously exported key material under the alias.
    pub fn import_key(&self, alias: &str, material: &[u8]) -> HsmResult<()> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.import_key(alias, material),
            HsmConnector::Mock(hsm) => hsm.import_key(alias, material),
        }
    }

    pub fn delete_key(&self, alias: &str) -> HsmResult<()> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.delete_key(alias),
            HsmConnector::Mock(hsm) => hsm.delete_key(alias),
        }
    }

    /// Stores a certificate object under the alias, next to the key pair.
    pub fn import_certificate(&self, alias: &str, certificate: &[u8]) -> HsmResult<()> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.import_certificate(alias, certificate),
            HsmConnector::Mock(hsm) => hsm.import_certificate(alias, certificate),
        }
    }

    pub fn certificate(&self, alias: &str) -> HsmResult<Option<Vec<u8>>> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.certificate(alias),
            HsmConnector::Mock(hsm) => hsm.certificate(alias),
        }
    }

    /// Moves all objects stored under `from` to the alias `to`.
    pub fn rename_key(&self, from: &str, to: &str) -> HsmResult<()> {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.rename_key(from, to),
            HsmConnector::Mock(hsm) => hsm.rename_key(from, to),
        }
    }
}

impl fmt::Display for HsmConnector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            #[cfg(feature = "hsm")]
            HsmConnector::Pkcs11(hsm) => hsm.fmt(f),
            HsmConnector::Mock(_) => write!(f, "mock HSM"),
        }
    }
}
