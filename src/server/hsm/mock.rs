//! An in-process HSM for tests.
//!
//! Keeps key pairs in memory and records every mutating call so that
//! tests can assert on operation ordering, most importantly that key
//! material is exported and archived before it is ever deleted.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};

use crate::commons::crypto::KeyPair;
use crate::server::hsm::{HsmError, HsmResult};

//------------ MockHsmOp -----------------------------------------------------

/// A recorded mutating or exporting call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MockHsmOp {
    Generate(String),
    Export(String),
    Import(String),
    Delete(String),
    ImportCertificate(String),
    Rename(String, String),
}

//------------ MockHsm -------------------------------------------------------

#[derive(Debug)]
struct MockHsmKey {
    material: Vec<u8>,
    generated_at: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    certificate: Option<Vec<u8>>,
    extractable: bool,
}

#[derive(Debug, Default)]
pub struct MockHsm {
    keys: RwLock<HashMap<String, MockHsmKey>>,
    ops: RwLock<Vec<MockHsmOp>>,

    /// Whether this mock reports key expiration attributes. When false,
    /// `expiration_date` reports the attribute as unsupported and callers
    /// must fall back to the generation date.
    supports_expiration: RwLock<bool>,
}

impl MockHsm {
    pub fn new() -> Self {
        let hsm = MockHsm::default();
        *hsm.supports_expiration.write().unwrap() = true;
        hsm
    }

    pub fn without_expiration_attribute() -> Self {
        MockHsm::default()
    }

    /// Inserts a key with explicit dates, as if it had been generated at
    /// `generated_at`.
    pub fn insert_key(
        &self,
        alias: &str,
        generated_at: DateTime<Utc>,
        end_date: Option<DateTime<Utc>>,
    ) {
        let key = KeyPair::build_ec().unwrap();
        self.keys.write().unwrap().insert(
            alias.to_string(),
            MockHsmKey {
                material: key.to_der().unwrap(),
                generated_at,
                end_date,
                certificate: None,
                extractable: true,
            },
        );
    }

    /// Marks a key as not extractable, so export fails.
    pub fn make_unextractable(&self, alias: &str) {
        if let Some(key) = self.keys.write().unwrap().get_mut(alias) {
            key.extractable = false;
        }
    }

    pub fn ops(&self) -> Vec<MockHsmOp> {
        self.ops.read().unwrap().clone()
    }

    fn record(&self, op: MockHsmOp) {
        self.ops.write().unwrap().push(op);
    }
}

impl MockHsm {
    pub fn aliases(&self) -> HsmResult<Vec<String>> {
        let mut aliases: Vec<String> = self.keys.read().unwrap().keys().cloned().collect();
        aliases.sort();
        Ok(aliases)
    }

    pub fn contains_key(&self, alias: &str) -> HsmResult<bool> {
        Ok(self.keys.read().unwrap().contains_key(alias))
    }

    pub fn expiration_date(&self, alias: &str) -> HsmResult<Option<DateTime<Utc>>> {
        if !*self.supports_expiration.read().unwrap() {
            return Ok(None);
        }
        self.keys
            .read()
            .unwrap()
            .get(alias)
            .map(|key| key.end_date)
            .ok_or_else(|| HsmError::KeyNotFound(alias.to_string()))
    }

    pub fn generation_date(&self, alias: &str) -> HsmResult<DateTime<Utc>> {
        self.keys
            .read()
            .unwrap()
            .get(alias)
            .map(|key| key.generated_at)
            .ok_or_else(|| HsmError::KeyNotFound(alias.to_string()))
    }

    pub fn generate_key_pair(&self, alias: &str, validity_days: i64) -> HsmResult<()> {
        let key = KeyPair::build_ec().map_err(|e| HsmError::Other(e.to_string()))?;
        let material = key.to_der().map_err(|e| HsmError::Other(e.to_string()))?;
        let end_date = self
            .supports_expiration
            .read()
            .unwrap()
            .then(|| Utc::now() + Duration::days(validity_days));

        self.keys.write().unwrap().insert(
            alias.to_string(),
            MockHsmKey {
                material,
                generated_at: Utc::now(),
                end_date,
                certificate: None,
                extractable: true,
            },
        );
        self.record(MockHsmOp::Generate(alias.to_string()));
        Ok(())
    }

    pub fn public_key(&self, alias: &str) -> HsmResult<Vec<u8>> {
        let keys = self.keys.read().unwrap();
        let key = keys
            .get(alias)
            .ok_or_else(|| HsmError::KeyNotFound(alias.to_string()))?;
        KeyPair::from_der(&key.material)
            .and_then(|key| key.public_key_der())
            .map_err(|e| HsmError::Other(e.to_string()))
    }

    pub fn export_key(&self, alias: &str) -> HsmResult<Vec<u8>> {
        let material = {
            let keys = self.keys.read().unwrap();
            let key = keys
                .get(alias)
                .ok_or_else(|| HsmError::KeyNotFound(alias.to_string()))?;
            if !key.extractable {
                return Err(HsmError::NotExtractable(alias.to_string()));
            }
            key.material.clone()
        };
        self.record(MockHsmOp::Export(alias.to_string()));
        Ok(material)
    }

    pub fn import_key(&self, alias: &str, material: &[u8]) -> HsmResult<()> {
        self.keys.write().unwrap().insert(
            alias.to_string(),
            MockHsmKey {
                material: material.to_vec(),
                generated_at: Utc::now(),
                end_date: None,
                certificate: None,
                extractable: true,
            },
        );
        self.record(MockHsmOp::Import(alias.to_string()));
        Ok(())
    }

    pub fn delete_key(&self, alias: &str) -> HsmResult<()> {
        self.keys
            .write()
            .unwrap()
            .remove(alias)
            .ok_or_else(|| HsmError::KeyNotFound(alias.to_string()))?;
        self.record(MockHsmOp::Delete(alias.to_string()));
        Ok(())
    }

    pub fn import_certificate(&self, alias: &str, certificate: &[u8]) -> HsmResult<()> {
        let mut keys = self.keys.write().unwrap();
        let key = keys
            .get_mut(alias)
            .ok_or_else(|| HsmError::KeyNotFound(alias.to_string()))?;
        key.certificate = Some(certificate.to_vec());
        drop(keys);
        self.record(MockHsmOp::ImportCertificate(alias.to_string()));
        Ok(())
    }

    pub fn certificate(&self, alias: &str) -> HsmResult<Option<Vec<u8>>> {
        self.keys
            .read()
            .unwrap()
            .get(alias)
            .map(|key| key.certificate.clone())
            .ok_or_else(|| HsmError::KeyNotFound(alias.to_string()))
    }

    pub fn rename_key(&self, from: &str, to: &str) -> HsmResult<()> {
        let mut keys = self.keys.write().unwrap();
        let key = keys
            .remove(from)
            .ok_or_else(|| HsmError::KeyNotFound(from.to_string()))?;
        keys.insert(to.to_string(), key);
        drop(keys);
        self.record(MockHsmOp::Rename(from.to_string(), to.to_string()));
        Ok(())
    }
}
