//! The remote operations offered by a DVCA.
//!
//! Everything the credential core needs from the certification authority
//! goes through [`DvcaConnection`]. The HTTP variant talks to a real
//! endpoint; the mock variant records calls and plays back canned
//! responses for tests. Transport details beyond this boundary — SOAP
//! envelopes, WS-Security and friends — are not this crate's concern.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::commons::ext_serde;
use crate::commons::httpclient;
use crate::commons::{EidResult, Error};

//------------ TlsRequestReceipt ---------------------------------------------

/// What the DVCA answers to a TLS client certificate request.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsRequestReceipt {
    /// Do not ask for the result before this point in time.
    pub no_poll_before: Option<DateTime<Utc>>,
}

//------------ BlacklistResult -----------------------------------------------

/// The payload of a verified block list response.
///
/// This is what remains after the CMS signature on the DVCA response has
/// been checked and stripped.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlacklistResult {
    /// A complete list, to be downloaded separately and applied as the
    /// sector's entire new set.
    Complete {
        version: i64,
        sector_id: String,
        download_url: String,
    },

    /// An incremental delta against the version the caller asked for.
    Delta {
        version: i64,
        sector_id: String,
        added: Vec<String>,
        removed: Vec<String>,
    },

    /// The DVCA has pruned history past the requested baseline version.
    /// The caller falls back to a full sync.
    UnknownBaseline,
}

//------------ Wire types ----------------------------------------------------

#[derive(Serialize)]
struct CertificatesRequest {
    request: String,
}

#[derive(Serialize)]
struct TlsRequest {
    csr: String,
}

#[derive(Serialize)]
struct BlacklistRequest {
    since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sector_id: Option<String>,
}

#[derive(Deserialize)]
struct CaCertificatesResponse {
    certificates: Vec<CaCertificate>,
}

#[derive(Deserialize)]
struct CaCertificate {
    #[serde(deserialize_with = "ext_serde::de_bytes")]
    certificate: Vec<u8>,
}

//------------ DvcaConnection ------------------------------------------------

/// Dispatches DVCA requests to a particular implementation.
#[derive(Debug)]
pub enum DvcaConnection {
    Http(HttpDvcaClient),
    Mock(MockDvcaClient),
}

impl DvcaConnection {
    /// Submits the CMS signed certificate request of a pending CVC
    /// renewal.
    pub async fn send_certificates(&self, request: Bytes) -> EidResult<()> {
        match self {
            DvcaConnection::Http(client) => client.send_certificates(request).await,
            DvcaConnection::Mock(mock) => mock.send_certificates(request),
        }
    }

    /// Submits a CMS signed CSR for a new TLS client certificate.
    pub async fn request_new_tls(&self, csr: Bytes) -> EidResult<TlsRequestReceipt> {
        match self {
            DvcaConnection::Http(client) => client.request_new_tls(csr).await,
            DvcaConnection::Mock(mock) => mock.request_new_tls(csr),
        }
    }

    /// Asks for the block list; a `since` version requests a delta, no
    /// version requests the complete list. Returns the raw CMS signed
    /// response — verification is the caller's first move.
    pub async fn get_blacklist(
        &self,
        since: Option<i64>,
        sector_id: Option<&[u8]>,
    ) -> EidResult<Vec<u8>> {
        match self {
            DvcaConnection::Http(client) => client.get_blacklist(since, sector_id).await,
            DvcaConnection::Mock(mock) => mock.get_blacklist(since),
        }
    }

    /// Downloads a complete block list from the URL named in a
    /// [`BlacklistResult::Complete`] response.
    pub async fn fetch_list(&self, url: &str) -> EidResult<Vec<u8>> {
        match self {
            DvcaConnection::Http(client) => client.fetch_list(url).await,
            DvcaConnection::Mock(mock) => mock.fetch_list(url),
        }
    }

    /// Returns the DVCA's own certificate chain.
    pub async fn get_ca_certificates(&self) -> EidResult<Vec<Vec<u8>>> {
        match self {
            DvcaConnection::Http(client) => client.get_ca_certificates().await,
            DvcaConnection::Mock(mock) => mock.get_ca_certificates(),
        }
    }
}

//------------ HttpDvcaClient ------------------------------------------------

/// Talks to a DVCA endpoint over HTTPS.
#[derive(Debug)]
pub struct HttpDvcaClient {
    base_url: Url,
}

impl HttpDvcaClient {
    pub fn new(base_url: Url) -> Self {
        HttpDvcaClient { base_url }
    }

    fn endpoint(&self, path: &str) -> EidResult<String> {
        self.base_url
            .join(path)
            .map(|url| url.to_string())
            .map_err(|e| Error::dvca(format!("cannot build endpoint URL for '{path}': {e}")))
    }

    async fn send_certificates(&self, request: Bytes) -> EidResult<()> {
        let uri = self.endpoint("certificates")?;
        let body = CertificatesRequest {
            request: BASE64.encode(&request),
        };
        httpclient::post_json(&uri, body).await.map_err(Error::from)
    }

    async fn request_new_tls(&self, csr: Bytes) -> EidResult<TlsRequestReceipt> {
        let uri = self.endpoint("tls")?;
        let body = TlsRequest {
            csr: BASE64.encode(&csr),
        };
        httpclient::post_json_with_response(&uri, body)
            .await
            .map_err(Error::from)
    }

    async fn get_blacklist(&self, since: Option<i64>, sector_id: Option<&[u8]>) -> EidResult<Vec<u8>> {
        let uri = self.endpoint("blacklist")?;
        let body = BlacklistRequest {
            since,
            sector_id: sector_id.map(|bytes| BASE64.encode(bytes)),
        };
        httpclient::post_json_with_bytes_response(&uri, body)
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(Error::from)
    }

    async fn fetch_list(&self, url: &str) -> EidResult<Vec<u8>> {
        httpclient::get_bytes(url)
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(Error::from)
    }

    async fn get_ca_certificates(&self) -> EidResult<Vec<Vec<u8>>> {
        let uri = self.endpoint("ca-certificates")?;
        let response: CaCertificatesResponse =
            httpclient::get_json(&uri).await.map_err(Error::from)?;
        Ok(response
            .certificates
            .into_iter()
            .map(|c| c.certificate)
            .collect())
    }
}

//------------ MockDvcaClient ------------------------------------------------

/// A recorded DVCA call, for assertions in tests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DvcaCall {
    SendCertificates(Vec<u8>),
    RequestNewTls(Vec<u8>),
    GetBlacklist(Option<i64>),
    FetchList(String),
    GetCaCertificates,
}

/// An in-process DVCA that plays back canned responses.
#[derive(Debug, Default)]
pub struct MockDvcaClient {
    calls: Mutex<Vec<DvcaCall>>,

    /// Responses for `get_blacklist`, served in order. The front entry is
    /// served next; the last entry keeps being served when the queue runs
    /// out.
    blacklist_responses: Mutex<VecDeque<Vec<u8>>>,

    /// Bodies for `fetch_list` by URL.
    list_downloads: Mutex<Vec<(String, Vec<u8>)>>,

    tls_receipt: Mutex<Option<TlsRequestReceipt>>,

    ca_certificates: Mutex<Vec<Vec<u8>>>,

    /// When set, every remote operation fails with this message.
    unreachable: Mutex<Option<String>>,
}

impl MockDvcaClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_blacklist_response(&self, cms_der: Vec<u8>) {
        self.blacklist_responses.lock().unwrap().push_back(cms_der);
    }

    pub fn add_list_download(&self, url: &str, body: Vec<u8>) {
        self.list_downloads
            .lock()
            .unwrap()
            .push((url.to_string(), body));
    }

    pub fn set_tls_receipt(&self, receipt: TlsRequestReceipt) {
        *self.tls_receipt.lock().unwrap() = Some(receipt);
    }

    pub fn set_ca_certificates(&self, certificates: Vec<Vec<u8>>) {
        *self.ca_certificates.lock().unwrap() = certificates;
    }

    pub fn set_unreachable(&self, message: &str) {
        *self.unreachable.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<DvcaCall> {
        self.calls.lock().unwrap().clone()
    }

    fn check_reachable(&self) -> EidResult<()> {
        match self.unreachable.lock().unwrap().as_ref() {
            Some(message) => Err(Error::dvca(message)),
            None => Ok(()),
        }
    }

    fn send_certificates(&self, request: Bytes) -> EidResult<()> {
        self.check_reachable()?;
        self.calls
            .lock()
            .unwrap()
            .push(DvcaCall::SendCertificates(request.to_vec()));
        Ok(())
    }

    fn request_new_tls(&self, csr: Bytes) -> EidResult<TlsRequestReceipt> {
        self.check_reachable()?;
        self.calls
            .lock()
            .unwrap()
            .push(DvcaCall::RequestNewTls(csr.to_vec()));
        Ok(self
            .tls_receipt
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(TlsRequestReceipt { no_poll_before: None }))
    }

    fn get_blacklist(&self, since: Option<i64>) -> EidResult<Vec<u8>> {
        self.check_reachable()?;
        self.calls.lock().unwrap().push(DvcaCall::GetBlacklist(since));

        let mut responses = self.blacklist_responses.lock().unwrap();
        match responses.len() {
            0 => Err(Error::dvca("mock has no blacklist response")),
            1 => Ok(responses.front().unwrap().clone()),
            _ => Ok(responses.pop_front().unwrap()),
        }
    }

    fn fetch_list(&self, url: &str) -> EidResult<Vec<u8>> {
        self.check_reachable()?;
        self.calls
            .lock()
            .unwrap()
            .push(DvcaCall::FetchList(url.to_string()));
        self.list_downloads
            .lock()
            .unwrap()
            .iter()
            .find(|(stored, _)| stored == url)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| Error::dvca(format!("mock has no download for '{url}'")))
    }

    fn get_ca_certificates(&self) -> EidResult<Vec<Vec<u8>>> {
        self.check_reachable()?;
        self.calls.lock().unwrap().push(DvcaCall::GetCaCertificates);
        Ok(self.ca_certificates.lock().unwrap().clone())
    }
}

impl fmt::Display for DvcaConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DvcaConnection::Http(client) => write!(f, "dvca at {}", client.base_url),
            DvcaConnection::Mock(_) => write!(f, "mock dvca"),
        }
    }
}
