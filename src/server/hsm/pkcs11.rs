//! The PKCS#11 backed HSM connector.
//!
//! Sessions towards the device are pooled and reused for the lifetime of
//! the process. The device is probed once at startup with retries; key
//! metadata the device cannot report reliably (generation date, intended
//! end of life) is tracked in a small mapper store in shared storage,
//! keyed by alias.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, CertificateType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use log::{info, warn};
use openssl::bn::BigNum;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::commons::storage::{Key, KeyValueStore, SegmentBuf};
use crate::config::HsmConfig;
use crate::server::hsm::{HsmError, HsmResult};

/// The maximum number of concurrent sessions towards the device to pool.
const MAX_CONCURRENT_SESSIONS: u32 = 5;

/// The maximum amount of time to keep probing the device at startup.
const PROBE_UNTIL_MAX: Duration = Duration::from_secs(30);

//------------ HsmKeyRecord --------------------------------------------------

/// Metadata about one HSM resident key, kept in shared storage.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct HsmKeyRecord {
    alias: String,
    generated_at: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
}

//------------ SessionManager ------------------------------------------------

#[derive(Debug)]
struct SessionManager {
    pkcs11: Pkcs11,
    slot: Slot,
    pin: AuthPin,
}

impl r2d2::ManageConnection for SessionManager {
    type Connection = Session;
    type Error = HsmError;

    fn connect(&self) -> Result<Session, HsmError> {
        let session = self
            .pkcs11
            .open_rw_session(self.slot)
            .map_err(|e| HsmError::Pkcs11(format!("cannot open session: {e}")))?;

        if let Err(err) = session.login(UserType::User, Some(&self.pin)) {
            // a second session on the same token may already be logged in
            if !err.to_string().contains("ALREADY_LOGGED_IN") {
                return Err(HsmError::Pkcs11(format!("login failed: {err}")));
            }
        }

        Ok(session)
    }

    fn is_valid(&self, session: &mut Session) -> Result<(), HsmError> {
        session
            .get_session_info()
            .map(|_| ())
            .map_err(|e| HsmError::Pkcs11(format!("session invalid: {e}")))
    }

    fn has_broken(&self, _session: &mut Session) -> bool {
        false
    }
}

//------------ Pkcs11Hsm -----------------------------------------------------

pub struct Pkcs11Hsm {
    pool: r2d2::Pool<SessionManager>,
    mapper: Arc<KeyValueStore>,
    lib_name: String,
}

impl fmt::Debug for Pkcs11Hsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Hsm")
            .field("lib_name", &self.lib_name)
            .finish()
    }
}

impl fmt::Display for Pkcs11Hsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PKCS#11 HSM [library: {}]", self.lib_name)
    }
}

impl Pkcs11Hsm {
    /// Loads the PKCS#11 library, opens the session pool and probes the
    /// device until it answers or the probe window runs out.
    pub fn build(config: &HsmConfig, mapper: Arc<KeyValueStore>) -> HsmResult<Self> {
        let lib_name = config
            .lib_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| config.lib_path.display().to_string());

        let pkcs11 = Pkcs11::new(&config.lib_path)
            .map_err(|e| HsmError::Pkcs11(format!("cannot load library '{lib_name}': {e}")))?;
        pkcs11
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| HsmError::Pkcs11(format!("cannot initialize library '{lib_name}': {e}")))?;

        let slot = Slot::try_from(config.slot_id)
            .map_err(|e| HsmError::Pkcs11(format!("invalid slot id {}: {e}", config.slot_id)))?;

        let manager = SessionManager {
            pkcs11,
            slot,
            pin: AuthPin::new(config.user_pin.expose_secret().to_string()),
        };
        let pool = r2d2::Pool::builder()
            .max_size(MAX_CONCURRENT_SESSIONS)
            .build_unchecked(manager);

        let probe = ExponentialBackoff {
            max_elapsed_time: Some(PROBE_UNTIL_MAX),
            ..Default::default()
        };
        backoff::retry(probe, || {
            pool.get().map(|_| ()).map_err(|e| {
                warn!("HSM not answering yet: {e}");
                backoff::Error::transient(HsmError::Pkcs11(e.to_string()))
            })
        })
        .map_err(|e| match e {
            backoff::Error::Transient { err, .. } => err,
            backoff::Error::Permanent(err) => err,
        })?;

        info!("Connected to PKCS#11 HSM [library: {lib_name}]");

        Ok(Pkcs11Hsm {
            pool,
            mapper,
            lib_name,
        })
    }

    fn session(&self) -> HsmResult<r2d2::PooledConnection<SessionManager>> {
        self.pool
            .get()
            .map_err(|e| HsmError::Pkcs11(format!("no session available: {e}")))
    }

    fn record_key(&self, key: &Key) -> HsmResult<Option<HsmKeyRecord>> {
        self.mapper
            .get(key)
            .map_err(|e| HsmError::Other(format!("mapper store: {e}")))
    }

    fn mapper_key(alias: &str) -> Key {
        Key::new_global(SegmentBuf::parse_lossy(alias))
    }

    fn find_by_label(
        session: &Session,
        alias: &str,
        class: Option<ObjectClass>,
    ) -> HsmResult<Vec<ObjectHandle>> {
        let mut template = vec![Attribute::Label(alias.as_bytes().to_vec())];
        if let Some(class) = class {
            template.push(Attribute::Class(class));
        }
        session
            .find_objects(&template)
            .map_err(|e| HsmError::Pkcs11(format!("find failed for '{alias}': {e}")))
    }

    fn private_key_handle(session: &Session, alias: &str) -> HsmResult<ObjectHandle> {
        Self::find_by_label(session, alias, Some(ObjectClass::PRIVATE_KEY))?
            .into_iter()
            .next()
            .ok_or_else(|| HsmError::KeyNotFound(alias.to_string()))
    }
}

impl Pkcs11Hsm {
    pub fn aliases(&self) -> HsmResult<Vec<String>> {
        let session = self.session()?;
        let handles = session
            .find_objects(&[
                Attribute::Class(ObjectClass::PRIVATE_KEY),
                Attribute::Token(true),
            ])
            .map_err(|e| HsmError::Pkcs11(format!("cannot enumerate keys: {e}")))?;

        let mut aliases = Vec::new();
        for handle in handles {
            let attributes = session
                .get_attributes(handle, &[AttributeType::Label])
                .map_err(|e| HsmError::Pkcs11(format!("cannot read label: {e}")))?;
            for attribute in attributes {
                if let Attribute::Label(label) = attribute {
                    aliases.push(String::from_utf8_lossy(&label).to_string());
                }
            }
        }
        aliases.sort();
        aliases.dedup();
        Ok(aliases)
    }

    pub fn contains_key(&self, alias: &str) -> HsmResult<bool> {
        let session = self.session()?;
        Ok(!Self::find_by_label(&session, alias, Some(ObjectClass::PRIVATE_KEY))?.is_empty())
    }

    pub fn expiration_date(&self, alias: &str) -> HsmResult<Option<DateTime<Utc>>> {
        Ok(self
            .record_key(&Self::mapper_key(alias))?
            .and_then(|record| record.end_date))
    }

    pub fn generation_date(&self, alias: &str) -> HsmResult<DateTime<Utc>> {
        self.record_key(&Self::mapper_key(alias))?
            .map(|record| record.generated_at)
            .ok_or_else(|| HsmError::KeyNotFound(alias.to_string()))
    }

    pub fn generate_key_pair(&self, alias: &str, validity_days: i64) -> HsmResult<()> {
        let session = self.session()?;

        let pub_template = vec![
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::ModulusBits(2048.into()),
            Attribute::PublicExponent(vec![0x01, 0x00, 0x01]),
            Attribute::Label(alias.as_bytes().to_vec()),
        ];
        let priv_template = vec![
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sign(true),
            Attribute::Sensitive(false),
            Attribute::Extractable(true),
            Attribute::Label(alias.as_bytes().to_vec()),
        ];

        session
            .generate_key_pair(&Mechanism::RsaPkcsKeyPairGen, &pub_template, &priv_template)
            .map_err(|e| HsmError::Pkcs11(format!("key generation failed for '{alias}': {e}")))?;

        let now = Utc::now();
        let record = HsmKeyRecord {
            alias: alias.to_string(),
            generated_at: now,
            end_date: Some(now + ChronoDuration::days(validity_days)),
        };
        self.mapper
            .store(&Self::mapper_key(alias), &record)
            .map_err(|e| HsmError::Other(format!("mapper store: {e}")))?;

        Ok(())
    }

    pub fn public_key(&self, alias: &str) -> HsmResult<Vec<u8>> {
        let session = self.session()?;
        let handle = Self::find_by_label(&session, alias, Some(ObjectClass::PUBLIC_KEY))?
            .into_iter()
            .next()
            .ok_or_else(|| HsmError::KeyNotFound(alias.to_string()))?;

        let attributes = session
            .get_attributes(handle, &[AttributeType::Modulus, AttributeType::PublicExponent])
            .map_err(|e| HsmError::Pkcs11(format!("cannot read public key of '{alias}': {e}")))?;

        let mut modulus = None;
        let mut exponent = None;
        for attribute in attributes {
            match attribute {
                Attribute::Modulus(bytes) => modulus = Some(bytes),
                Attribute::PublicExponent(bytes) => exponent = Some(bytes),
                _ => {}
            }
        }
        let (modulus, exponent) = match (modulus, exponent) {
            (Some(modulus), Some(exponent)) => (modulus, exponent),
            _ => {
                return Err(HsmError::Pkcs11(format!(
                    "public key attributes of '{alias}' incomplete"
                )));
            }
        };

        let rsa = Rsa::from_public_components(
            BigNum::from_slice(&modulus).map_err(|e| HsmError::Other(e.to_string()))?,
            BigNum::from_slice(&exponent).map_err(|e| HsmError::Other(e.to_string()))?,
        )
        .map_err(|e| HsmError::Other(e.to_string()))?;
        PKey::from_rsa(rsa)
            .and_then(|pkey| pkey.public_key_to_der())
            .map_err(|e| HsmError::Other(e.to_string()))
    }

    pub fn export_key(&self, alias: &str) -> HsmResult<Vec<u8>> {
        let session = self.session()?;
        let handle = Self::private_key_handle(&session, alias)?;

        let attributes = session
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(|e| HsmError::Pkcs11(format!("cannot export '{alias}': {e}")))?;

        for attribute in attributes {
            if let Attribute::Value(value) = attribute {
                return Ok(value);
            }
        }
        Err(HsmError::NotExtractable(alias.to_string()))
    }

    pub fn import_key(&self, alias: &str, material: &[u8]) -> HsmResult<()> {
        let session = self.session()?;

        let pkey = PKey::private_key_from_der(material)
            .map_err(|_| HsmError::Other(format!("key material for '{alias}' is not DER")))?;
        let rsa = pkey
            .rsa()
            .map_err(|_| HsmError::Other(format!("key material for '{alias}' is not an RSA key")))?;

        let template = vec![
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::KeyType(KeyType::RSA),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sign(true),
            Attribute::Sensitive(false),
            Attribute::Extractable(true),
            Attribute::Label(alias.as_bytes().to_vec()),
            Attribute::Modulus(rsa.n().to_vec()),
            Attribute::PublicExponent(rsa.e().to_vec()),
            Attribute::PrivateExponent(rsa.d().to_vec()),
        ];

        session
            .create_object(&template)
            .map_err(|e| HsmError::Pkcs11(format!("cannot import '{alias}': {e}")))?;

        let record = HsmKeyRecord {
            alias: alias.to_string(),
            generated_at: Utc::now(),
            end_date: None,
        };
        self.mapper
            .store(&Self::mapper_key(alias), &record)
            .map_err(|e| HsmError::Other(format!("mapper store: {e}")))?;

        Ok(())
    }

    pub fn delete_key(&self, alias: &str) -> HsmResult<()> {
        let session = self.session()?;
        let handles = Self::find_by_label(&session, alias, None)?;
        if handles.is_empty() {
            return Err(HsmError::KeyNotFound(alias.to_string()));
        }
        for handle in handles {
            session
                .destroy_object(handle)
                .map_err(|e| HsmError::Pkcs11(format!("cannot delete '{alias}': {e}")))?;
        }

        let key = Self::mapper_key(alias);
        if self.record_key(&key)?.is_some() {
            self.mapper
                .drop_key(&key)
                .map_err(|e| HsmError::Other(format!("mapper store: {e}")))?;
        }

        Ok(())
    }

    pub fn import_certificate(&self, alias: &str, certificate: &[u8]) -> HsmResult<()> {
        let session = self.session()?;
        let template = vec![
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
            Attribute::Token(true),
            Attribute::Label(alias.as_bytes().to_vec()),
            Attribute::Value(certificate.to_vec()),
        ];
        session
            .create_object(&template)
            .map_err(|e| HsmError::Pkcs11(format!("cannot store certificate '{alias}': {e}")))?;
        Ok(())
    }

    pub fn certificate(&self, alias: &str) -> HsmResult<Option<Vec<u8>>> {
        let session = self.session()?;
        let handle = match Self::find_by_label(&session, alias, Some(ObjectClass::CERTIFICATE))?
            .into_iter()
            .next()
        {
            Some(handle) => handle,
            None => return Ok(None),
        };

        let attributes = session
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(|e| HsmError::Pkcs11(format!("cannot read certificate '{alias}': {e}")))?;
        for attribute in attributes {
            if let Attribute::Value(value) = attribute {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    pub fn rename_key(&self, from: &str, to: &str) -> HsmResult<()> {
        let session = self.session()?;
        let handles = Self::find_by_label(&session, from, None)?;
        if handles.is_empty() {
            return Err(HsmError::KeyNotFound(from.to_string()));
        }
        for handle in handles {
            session
                .update_attributes(handle, &[Attribute::Label(to.as_bytes().to_vec())])
                .map_err(|e| HsmError::Pkcs11(format!("cannot rename '{from}' to '{to}': {e}")))?;
        }

        let from_key = Self::mapper_key(from);
        if let Some(mut record) = self.record_key(&from_key)? {
            record.alias = to.to_string();
            self.mapper
                .store(&Self::mapper_key(to), &record)
                .and_then(|_| self.mapper.drop_key(&from_key))
                .map_err(|e| HsmError::Other(format!("mapper store: {e}")))?;
        }

        Ok(())
    }
}
