//! Card verifiable certificates and their renewal.
//!
//! The renewal protocol against the DVCA is asynchronous: a request is
//! created and submitted, the answer arrives later through a callback or
//! poll, and only then is the certificate installed. The intermediate
//! state lives in the terminal's [`PendingCertificateRequest`]; this
//! module drives the transitions.
//!
//! [`PendingCertificateRequest`]: crate::server::terminals::PendingCertificateRequest

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};

use crate::api::{JobReport, ManagementCode};
use crate::commons::crypto::KeyPair;
use crate::commons::{EidResult, Error};
use crate::config::Config;
use crate::server::dvca::DvcaConnection;
use crate::server::locks::LockManager;
use crate::server::rsc::RscManager;
use crate::server::terminals::{PendingCertificateRequest, RequestStatus, TerminalStore};

//------------ CvcInfo -------------------------------------------------------

/// The fields of a parsed card verifiable certificate that the credential
/// core acts on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CvcInfo {
    /// The certificate holder reference (CHR).
    pub holder_reference: String,

    /// The terminal context the certificate belongs to. Derived from the
    /// holder reference.
    pub ref_id: String,

    pub not_on_or_after: DateTime<Utc>,
}

//------------ CVC parsing ---------------------------------------------------

const TAG_CV_CERTIFICATE: u16 = 0x7F21;
const TAG_BODY: u16 = 0x7F4E;
const TAG_CHR: u16 = 0x5F20;
const TAG_EXPIRATION: u16 = 0x5F24;

/// Extracts holder reference and validity from the BER-TLV encoding of a
/// card verifiable certificate.
///
/// Only the fields the credential core needs are decoded; the public key,
/// the holder authorization template and the signature are skipped over.
pub fn parse_cvc(bytes: &[u8]) -> EidResult<CvcInfo> {
    let (tag, certificate, _) = read_tlv(bytes)?;
    if tag != TAG_CV_CERTIFICATE {
        return Err(Error::CvcDecode(format!(
            "expected CV certificate template, got tag {tag:#06x}"
        )));
    }

    let mut body = None;
    let mut rest = certificate;
    while !rest.is_empty() {
        let (tag, value, remaining) = read_tlv(rest)?;
        if tag == TAG_BODY {
            body = Some(value);
        }
        rest = remaining;
    }
    let body = body.ok_or_else(|| Error::CvcDecode("certificate body missing".to_string()))?;

    let mut holder_reference = None;
    let mut expiration = None;
    let mut rest = body;
    while !rest.is_empty() {
        let (tag, value, remaining) = read_tlv(rest)?;
        match tag {
            TAG_CHR => {
                holder_reference = Some(
                    std::str::from_utf8(value)
                        .map_err(|_| Error::CvcDecode("holder reference is not ASCII".to_string()))?
                        .to_string(),
                );
            }
            TAG_EXPIRATION => expiration = Some(parse_cvc_date(value)?),
            _ => {}
        }
        rest = remaining;
    }

    let holder_reference =
        holder_reference.ok_or_else(|| Error::CvcDecode("holder reference missing".to_string()))?;
    let not_on_or_after =
        expiration.ok_or_else(|| Error::CvcDecode("expiration date missing".to_string()))?;

    Ok(CvcInfo {
        ref_id: holder_reference.clone(),
        holder_reference,
        not_on_or_after,
    })
}

/// Reads one TLV element and returns `(tag, value, rest)`.
fn read_tlv(bytes: &[u8]) -> EidResult<(u16, &[u8], &[u8])> {
    let (&first, rest) = bytes
        .split_first()
        .ok_or_else(|| Error::CvcDecode("truncated tag".to_string()))?;

    // high tag numbers use a second tag byte
    let (tag, rest) = if first & 0x1F == 0x1F {
        let (&second, rest) = rest
            .split_first()
            .ok_or_else(|| Error::CvcDecode("truncated tag".to_string()))?;
        (u16::from_be_bytes([first, second]), rest)
    } else {
        (first as u16, rest)
    };

    let (&len_byte, rest) = rest
        .split_first()
        .ok_or_else(|| Error::CvcDecode("truncated length".to_string()))?;

    let (length, rest) = match len_byte {
        0..=0x7F => (len_byte as usize, rest),
        0x81 => {
            let (&len, rest) = rest
                .split_first()
                .ok_or_else(|| Error::CvcDecode("truncated length".to_string()))?;
            (len as usize, rest)
        }
        0x82 => {
            if rest.len() < 2 {
                return Err(Error::CvcDecode("truncated length".to_string()));
            }
            (u16::from_be_bytes([rest[0], rest[1]]) as usize, &rest[2..])
        }
        _ => {
            return Err(Error::CvcDecode(format!(
                "unsupported length encoding {len_byte:#04x}"
            )));
        }
    };

    if rest.len() < length {
        return Err(Error::CvcDecode("value extends past end of data".to_string()));
    }

    Ok((tag, &rest[..length], &rest[length..]))
}

/// Decodes the unpacked BCD date format (YYMMDD, one digit per byte).
fn parse_cvc_date(value: &[u8]) -> EidResult<DateTime<Utc>> {
    if value.len() != 6 || value.iter().any(|&digit| digit > 9) {
        return Err(Error::CvcDecode("malformed date".to_string()));
    }

    let year = 2000 + (value[0] as i32) * 10 + value[1] as i32;
    let month = (value[2] as u32) * 10 + value[3] as u32;
    let day = (value[4] as u32) * 10 + value[5] as u32;

    Utc.with_ymd_and_hms(year, month, day, 23, 59, 59)
        .single()
        .ok_or_else(|| Error::CvcDecode(format!("invalid date {year}-{month:02}-{day:02}")))
}

//------------ CvcManager ----------------------------------------------------

/// Drives CVC renewal for the configured service providers.
#[derive(Debug)]
pub struct CvcManager {
    terminals: Arc<TerminalStore>,
    locks: Arc<LockManager>,
    rsc: Arc<RscManager>,
    dvcas: HashMap<String, Arc<DvcaConnection>>,
    config: Arc<Config>,
}

impl CvcManager {
    pub fn new(
        terminals: Arc<TerminalStore>,
        locks: Arc<LockManager>,
        rsc: Arc<RscManager>,
        dvcas: HashMap<String, Arc<DvcaConnection>>,
        config: Arc<Config>,
    ) -> Self {
        CvcManager {
            terminals,
            locks,
            rsc,
            dvcas,
            config,
        }
    }

    fn provider_context(&self, provider_name: &str) -> EidResult<(String, Arc<DvcaConnection>)> {
        let sp = self
            .config
            .service_provider(provider_name)
            .ok_or_else(|| Error::UnknownServiceProvider(provider_name.to_string()))?;
        let dvca = self
            .dvcas
            .get(&sp.dvca)
            .cloned()
            .ok_or_else(|| Error::dvca(format!("no connection for dvca '{}'", sp.dvca)))?;
        Ok((sp.cvc_ref_id.clone(), dvca))
    }

    /// Initiates or continues the CVC renewal for one provider.
    ///
    /// Takes the provider's renewal lock first; a refusal means another
    /// instance is on it and this run silently moves on. A fresh request
    /// is created with status `Created` and submitted; submission failure
    /// leaves it `Created` so the next run retries, success transitions
    /// it to `Sent`.
    pub async fn renew(&self, provider_name: &str) -> EidResult<()> {
        let (ref_id, dvca) = self.provider_context(provider_name)?;

        let lock = match self.locks.obtain_cvc_update_lock(provider_name)? {
            Some(lock) => lock,
            None => {
                debug!("CVC renewal for '{provider_name}' is locked by another instance");
                return Ok(());
            }
        };

        let result = self.renew_locked(provider_name, &ref_id, &dvca).await;

        self.locks.release_cvc_update_lock(&lock)?;
        result
    }

    async fn renew_locked(
        &self,
        provider_name: &str,
        ref_id: &str,
        dvca: &DvcaConnection,
    ) -> EidResult<()> {
        self.terminals.get_or_create_terminal(ref_id)?;

        let pending = match self.terminals.pending_request(ref_id)? {
            Some(pending) => match pending.status {
                RequestStatus::Sent => {
                    debug!("CVC request for '{provider_name}' already sent, awaiting the DVCA");
                    return Ok(());
                }
                // created but never successfully submitted: retry submission
                RequestStatus::Created => pending,
            },
            None => {
                let key = KeyPair::build_ec()?;
                let payload = key.public_key_der()?;

                let request_data = self
                    .rsc
                    .sign_cms_container(provider_name, &payload)?
                    .ok_or_else(|| {
                        Error::custom(format!(
                            "no usable request signer for '{provider_name}', cannot request CVC"
                        ))
                    })?;

                let pending = PendingCertificateRequest::new(request_data, None, key);
                self.terminals.create_pending_request(ref_id, &pending)?;
                info!(
                    "Created CVC request {} for '{provider_name}'",
                    pending.message_id
                );
                pending
            }
        };

        dvca.send_certificates(Bytes::from(pending.request_data.clone()))
            .await?;
        self.terminals.mark_request_sent(ref_id)?;
        info!("Submitted CVC request {} for '{provider_name}'", pending.message_id);

        Ok(())
    }

    /// Installs a certificate obtained from the DVCA.
    ///
    /// The certificate is parsed and matched against the provider's
    /// terminal context before anything is written; the pending request is
    /// cleared, the certificate stored and appended to the bounded chain
    /// in one atomic step.
    pub fn store_cvc_obtained(&self, provider_name: &str, cvc: Vec<u8>) -> EidResult<()> {
        let (ref_id, _) = self.provider_context(provider_name)?;

        let info = parse_cvc(&cvc)?;
        if !info.ref_id.starts_with(ref_id.trim_end_matches(char::is_numeric)) {
            return Err(Error::custom(format!(
                "certificate holder '{}' does not belong to terminal '{ref_id}'",
                info.holder_reference
            )));
        }

        let next_index = self
            .terminals
            .chain(&ref_id)?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(1);

        self.terminals.complete_pending_request(
            &ref_id,
            cvc,
            next_index,
            self.config.cvc_chain_max_length,
        )?;

        info!(
            "Stored CVC '{}' for '{provider_name}', valid until {}",
            info.holder_reference, info.not_on_or_after
        );
        Ok(())
    }

    /// Aborts the provider's pending request, clearing the intermediate
    /// state.
    pub fn abort_pending_request(&self, provider_name: &str) -> EidResult<bool> {
        let (ref_id, _) = self.provider_context(provider_name)?;
        self.terminals.abort_pending_request(&ref_id)
    }

    /// The scheduled deadline check: renews every enabled provider whose
    /// CVC is missing or expires within the configured lead time.
    pub async fn renew_due_all(&self) -> JobReport {
        let mut report = JobReport::new("CVC renewal");

        for sp in self.config.service_providers.iter().filter(|sp| sp.enabled) {
            match self.renew_if_due(&sp.name, &sp.cvc_ref_id).await {
                Ok(Some(message)) => report.add_success(&sp.name, message),
                Ok(None) => {}
                Err(e) => {
                    warn!("CVC renewal for '{}' failed: {e}", sp.name);
                    let code = match &e {
                        Error::DvcaError(_) | Error::HttpClientError(_) => {
                            ManagementCode::RemoteUnavailable
                        }
                        Error::CvcDecode(_) => ManagementCode::UnexpectedError,
                        Error::ConfigError(_) => ManagementCode::ConfigurationError,
                        _ => ManagementCode::UnexpectedError,
                    };
                    report.add_failure(&sp.name, code, e.to_string());
                }
            }
        }

        report
    }

    async fn renew_if_due(&self, provider_name: &str, ref_id: &str) -> EidResult<Option<String>> {
        let cvc = self
            .terminals
            .get_terminal(ref_id)?
            .and_then(|terminal| terminal.cvc);

        let due = match cvc {
            None => true,
            Some(cvc) => {
                let info = parse_cvc(&cvc)?;
                let deadline = Utc::now() + chrono::Duration::days(self.config.cvc_renewal_lead_days);
                info.not_on_or_after <= deadline
            }
        };

        if !due {
            return Ok(None);
        }

        self.renew(provider_name).await?;
        Ok(Some("renewal initiated".to_string()))
    }

    /// Fetches the DVCA's certificate chain and stores it as the
    /// terminal's chain entries, bounded like any other chain insertion.
    pub async fn refresh_ca_chain(&self, provider_name: &str) -> EidResult<usize> {
        let (ref_id, dvca) = self.provider_context(provider_name)?;

        let certificates = dvca.get_ca_certificates().await?;
        let count = certificates.len();

        let next_index = self
            .terminals
            .chain(&ref_id)?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(1);

        for (offset, certificate) in certificates.into_iter().enumerate() {
            self.terminals.add_chain_entry(
                &ref_id,
                next_index + offset as u32,
                certificate,
                self.config.cvc_chain_max_length,
            )?;
        }

        Ok(count)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::storage::KeyValueStore;
    use crate::constants::{KEY_ARCHIVE_NS, LOCKS_NS, TERMINALS_NS};
    use crate::server::dvca::{DvcaCall, MockDvcaClient};
    use crate::test;

    /// Encodes a minimal CV certificate with the given holder reference
    /// and expiration date digits (YYMMDD, one digit per byte).
    pub fn encode_cvc(chr: &str, expiry: [u8; 6]) -> Vec<u8> {
        fn tlv(tag: u16, value: &[u8]) -> Vec<u8> {
            let mut out = Vec::new();
            if tag > 0xFF {
                out.extend_from_slice(&tag.to_be_bytes());
            } else {
                out.push(tag as u8);
            }
            if value.len() < 0x80 {
                out.push(value.len() as u8);
            } else {
                out.push(0x81);
                out.push(value.len() as u8);
            }
            out.extend_from_slice(value);
            out
        }

        let mut body = Vec::new();
        body.extend(tlv(0x5F29, &[0x00]));
        body.extend(tlv(0x42, b"DETESTDVCA00001"));
        body.extend(tlv(0x7F49, &[0x06, 0x01, 0x01]));
        body.extend(tlv(TAG_CHR, chr.as_bytes()));
        body.extend(tlv(0x7F4C, &[0x00]));
        body.extend(tlv(0x5F25, &[0x02, 0x05, 0x00, 0x01, 0x00, 0x01]));
        body.extend(tlv(TAG_EXPIRATION, &expiry));

        let mut certificate = tlv(TAG_BODY, &body);
        certificate.extend(tlv(0x5F37, &[0xAB; 64]));

        tlv(TAG_CV_CERTIFICATE, &certificate)
    }

    #[test]
    fn parse_round_trip() {
        let bytes = encode_cvc("DETESTSP00001", [0x02, 0x08, 0x01, 0x02, 0x00, 0x03]);
        let info = parse_cvc(&bytes).unwrap();

        assert_eq!(info.holder_reference, "DETESTSP00001");
        assert_eq!(info.ref_id, "DETESTSP00001");
        assert_eq!(
            info.not_on_or_after,
            Utc.with_ymd_and_hms(2028, 12, 3, 23, 59, 59).unwrap()
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_cvc(b"not a certificate").is_err());
        assert!(parse_cvc(&[]).is_err());

        // a correct outer tag without a body inside
        let mut bytes = vec![0x7F, 0x21, 0x02, 0x5F, 0x37];
        bytes.push(0x00);
        assert!(parse_cvc(&bytes).is_err());
    }

    fn test_config() -> Arc<Config> {
        Arc::new(
            toml::from_str(
                r#"
                country_code = "DE"
                public_service_provider = "sp-one"

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

    fn cvc_manager() -> (CvcManager, Arc<TerminalStore>, Arc<DvcaConnection>) {
        let storage = test::mem_storage();
        let config = test_config();
        let terminals = Arc::new(TerminalStore::new(
            Arc::new(KeyValueStore::create(&storage, TERMINALS_NS).unwrap()),
            Arc::new(KeyValueStore::create(&storage, KEY_ARCHIVE_NS).unwrap()),
        ));
        let locks = Arc::new(LockManager::new(
            Arc::new(KeyValueStore::create(&storage, LOCKS_NS).unwrap()),
            "instance-a".to_string(),
            config.lock_stale_minutes,
        ));
        let rsc = Arc::new(RscManager::new(terminals.clone(), config.clone()));

        // the provider needs a usable request signer
        rsc.generate_new_pending_rsc("sp-one", None, 12).unwrap();
        rsc.promote_pending_rsc("sp-one").unwrap();

        let dvca = Arc::new(DvcaConnection::Mock(MockDvcaClient::new()));
        let mut dvcas = HashMap::new();
        dvcas.insert("test-dvca".to_string(), dvca.clone());

        let manager = CvcManager::new(terminals.clone(), locks, rsc, dvcas, config);
        (manager, terminals, dvca)
    }

    #[tokio::test]
    async fn renewal_walks_created_sent_obtained() {
        let (manager, terminals, dvca) = cvc_manager();
        let ref_id = "DETESTSP00001";

        manager.renew("sp-one").await.unwrap();

        let pending = terminals.pending_request(ref_id).unwrap().unwrap();
        assert_eq!(pending.status, RequestStatus::Sent);
        let DvcaConnection::Mock(mock) = dvca.as_ref() else {
            unreachable!()
        };
        assert_eq!(mock.calls().len(), 1);

        // a second run must not create a second request
        manager.renew("sp-one").await.unwrap();
        assert_eq!(mock.calls().len(), 1);

        let cvc = encode_cvc("DETESTSP00001", [0x03, 0x00, 0x00, 0x01, 0x00, 0x01]);
        manager.store_cvc_obtained("sp-one", cvc.clone()).unwrap();

        assert!(terminals.pending_request(ref_id).unwrap().is_none());
        let terminal = terminals.get_terminal(ref_id).unwrap().unwrap();
        assert_eq!(terminal.cvc, Some(cvc.clone()));
        assert_eq!(terminals.chain(ref_id).unwrap(), vec![(1, cvc)]);
    }

    #[tokio::test]
    async fn submission_failure_leaves_request_created() {
        let (manager, terminals, dvca) = cvc_manager();
        let ref_id = "DETESTSP00001";
        let DvcaConnection::Mock(mock) = dvca.as_ref() else {
            unreachable!()
        };

        mock.set_unreachable("connection refused");
        assert!(manager.renew("sp-one").await.is_err());
        assert_eq!(
            terminals.pending_request(ref_id).unwrap().unwrap().status,
            RequestStatus::Created
        );
    }

    #[tokio::test]
    async fn deadline_sweep_renews_only_when_due() {
        let (manager, terminals, dvca) = cvc_manager();
        let ref_id = "DETESTSP00001";
        let DvcaConnection::Mock(mock) = dvca.as_ref() else {
            unreachable!()
        };

        // no CVC at all: due
        let report = manager.renew_due_all().await;
        assert!(report.success(), "{report}");
        assert_eq!(mock.calls().len(), 1);

        // install a long lived certificate and clear the pending state
        let cvc = encode_cvc("DETESTSP00001", [0x09, 0x09, 0x01, 0x02, 0x00, 0x01]);
        manager.store_cvc_obtained("sp-one", cvc).unwrap();

        // not due anymore: the sweep stays quiet
        let report = manager.renew_due_all().await;
        assert!(report.is_empty(), "{report}");
        assert_eq!(mock.calls().len(), 1);
        assert!(terminals.pending_request(ref_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn ca_chain_refresh_appends_bounded_entries() {
        let (manager, terminals, dvca) = cvc_manager();
        let DvcaConnection::Mock(mock) = dvca.as_ref() else {
            unreachable!()
        };

        mock.set_ca_certificates(vec![b"root".to_vec(), b"intermediate".to_vec()]);

        let count = manager.refresh_ca_chain("sp-one").await.unwrap();
        assert_eq!(count, 2);

        let chain = terminals.chain("DETESTSP00001").unwrap();
        assert_eq!(
            chain,
            vec![(1, b"root".to_vec()), (2, b"intermediate".to_vec())]
        );
    }

    #[test]
    fn obtained_certificate_for_wrong_terminal_is_rejected() {
        let (manager, terminals, _) = cvc_manager();

        terminals
            .create_pending_request(
                "DETESTSP00001",
                &PendingCertificateRequest::new(b"req".to_vec(), None, KeyPair::build_ec().unwrap()),
            )
            .unwrap();

        let cvc = encode_cvc("DEOTHERSP00001", [0x03, 0x00, 0x00, 0x01, 0x00, 0x01]);
        assert!(manager.store_cvc_obtained("sp-one", cvc).is_err());

        // the pending request is untouched
        assert!(terminals.pending_request("DETESTSP00001").unwrap().is_some());
    }
}
