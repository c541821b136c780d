//! End to end credential lifecycle scenarios against in-memory storage
//! and mocked collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use eidgate::commons::storage::KeyValueStore;
use eidgate::config::Config;
use eidgate::constants::{KEY_ARCHIVE_NS, LOCKS_NS, TERMINALS_NS};
use eidgate::server::cvc::CvcManager;
use eidgate::server::dvca::{DvcaConnection, MockDvcaClient};
use eidgate::server::locks::LockManager;
use eidgate::server::rsc::RscManager;
use eidgate::server::terminals::{RequestStatus, TerminalStore};

/// Encodes a minimal CV certificate in the BER-TLV layout the parser
/// understands: certificate template, body with holder reference and
/// expiration date, detached signature.
fn encode_cvc(chr: &str, expiry: [u8; 6]) -> Vec<u8> {
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
    body.extend(tlv(0x5F20, chr.as_bytes()));
    body.extend(tlv(0x7F4C, &[0x00]));
    body.extend(tlv(0x5F25, &[0x02, 0x05, 0x00, 0x01, 0x00, 0x01]));
    body.extend(tlv(0x5F24, &expiry));

    let mut certificate = tlv(0x7F4E, &body);
    certificate.extend(tlv(0x5F37, &[0xAB; 64]));

    tlv(0x7F21, &certificate)
}

fn mem_storage() -> Url {
    let mut bytes = [0; 8];
    openssl::rand::rand_bytes(&mut bytes).unwrap();
    Url::parse(&format!("memory://{}", hex::encode(bytes))).unwrap()
}

fn test_config() -> Arc<Config> {
    Arc::new(
        toml::from_str(
            r#"
            country_code = "DE"
            public_service_provider = "sp-one"
            cvc_chain_max_length = 2

            [[service_providers]]
            name = "sp-one"
            cvc_ref_id = "DETESTSP00001"
            dvca = "test-dvca"
            client_key_pair = "tls-client"
            pending_client_key_pair = "tls-client-pending"

            [dvca.test-dvca]
            base_url = "https://dvca.example.org/api/"
            "#,
        )
        .unwrap(),
    )
}

struct Gateway {
    cvc: CvcManager,
    terminals: Arc<TerminalStore>,
}

fn gateway() -> Gateway {
    stderrlog::new().verbosity(2).init().ok();

    let storage = mem_storage();
    let config = test_config();

    let terminals = Arc::new(TerminalStore::new(
        Arc::new(KeyValueStore::create(&storage, TERMINALS_NS).unwrap()),
        Arc::new(KeyValueStore::create(&storage, KEY_ARCHIVE_NS).unwrap()),
    ));
    let locks = Arc::new(LockManager::new(
        Arc::new(KeyValueStore::create(&storage, LOCKS_NS).unwrap()),
        "test-instance".to_string(),
        config.lock_stale_minutes,
    ));
    let rsc = Arc::new(RscManager::new(terminals.clone(), config.clone()));

    // bootstrap the public provider's request signer
    assert!(rsc.generate_new_pending_rsc("sp-one", None, 12).unwrap());
    assert!(rsc.promote_pending_rsc("sp-one").unwrap());

    let mut dvcas = HashMap::new();
    dvcas.insert(
        "test-dvca".to_string(),
        Arc::new(DvcaConnection::Mock(MockDvcaClient::new())),
    );

    let cvc = CvcManager::new(terminals.clone(), locks, rsc, dvcas, config);

    Gateway { cvc, terminals }
}

#[tokio::test]
async fn provider_without_cvc_walks_the_full_renewal() {
    let gateway = gateway();
    let ref_id = "DETESTSP00001";

    // no credential state exists before the first operation
    assert!(gateway.terminals.get_terminal(ref_id).unwrap().is_none());

    // renewal creates the pending request and submits it
    gateway.cvc.renew("sp-one").await.unwrap();
    let pending = gateway.terminals.pending_request(ref_id).unwrap().unwrap();
    assert_eq!(pending.status, RequestStatus::Sent);

    // the DVCA answers with the certificate
    let cvc = encode_cvc(ref_id, [0x03, 0x05, 0x01, 0x02, 0x03, 0x01]);
    gateway.cvc.store_cvc_obtained("sp-one", cvc.clone()).unwrap();

    let terminal = gateway.terminals.get_terminal(ref_id).unwrap().unwrap();
    assert_eq!(terminal.cvc, Some(cvc.clone()));
    assert!(terminal.cvc_private_key.is_some());
    assert!(gateway.terminals.pending_request(ref_id).unwrap().is_none());
    assert_eq!(gateway.terminals.chain(ref_id).unwrap(), vec![(1, cvc)]);
}

#[tokio::test]
async fn chain_stays_bounded_over_repeated_renewals() {
    let gateway = gateway();
    let ref_id = "DETESTSP00001";

    // three full renewal rounds with a configured chain bound of two
    for round in 0..3u8 {
        gateway.cvc.renew("sp-one").await.unwrap();
        let cvc = encode_cvc(ref_id, [0x03, round, 0x01, 0x02, 0x00, 0x01 + round]);
        gateway.cvc.store_cvc_obtained("sp-one", cvc).unwrap();
    }

    let chain = gateway.terminals.chain(ref_id).unwrap();
    assert_eq!(chain.len(), 2);
    // the oldest entry was evicted first
    assert_eq!(chain[0].0, 2);
    assert_eq!(chain[1].0, 3);
}

#[tokio::test]
async fn aborting_clears_the_pending_request() {
    let gateway = gateway();
    let ref_id = "DETESTSP00001";

    gateway.cvc.renew("sp-one").await.unwrap();
    assert!(gateway.terminals.pending_request(ref_id).unwrap().is_some());

    assert!(gateway.cvc.abort_pending_request("sp-one").unwrap());
    assert!(gateway.terminals.pending_request(ref_id).unwrap().is_none());

    // aborting again reports there was nothing to do
    assert!(!gateway.cvc.abort_pending_request("sp-one").unwrap());
}
