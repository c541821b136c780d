//! Some helper functions for HTTP calls towards the DVCA.

use std::time::Duration;
use std::{env, fmt};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::constants::EIDGATE_VERSION;

const JSON_CONTENT: &str = "application/json";

/// The timeout used for remote calls. Remote calls are not cancelled by
/// the callers; a call that runs into this timeout is treated as a
/// transient failure and retried on the next scheduled run.
const HTTP_CLIENT_TIMEOUT_SECS: u64 = 120;

/// Performs a GET request that expects a json response that can be
/// deserialized into an owned value of the expected type.
pub async fn get_json<T: DeserializeOwned>(uri: &str) -> Result<T, Error> {
    let headers = headers(uri, Some(JSON_CONTENT))?;

    let res = client(uri)?
        .get(uri)
        .headers(headers)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    process_json_response(uri, res).await
}

/// Performs a GET request and returns the raw response bytes.
pub async fn get_bytes(uri: &str) -> Result<Bytes, Error> {
    let headers = headers(uri, None)?;
    let res = client(uri)?
        .get(uri)
        .headers(headers)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    match opt_response(uri, res).await? {
        Some(bytes) => Ok(bytes),
        None => Err(Error::Custom(format!("expected body at: {uri}"))),
    }
}

/// Performs a POST of data that can be serialized into json, and expects
/// a json response that can be deserialized into the expected type.
pub async fn post_json_with_response<T: DeserializeOwned>(
    uri: &str,
    data: impl Serialize,
) -> Result<T, Error> {
    let body = serde_json::to_string_pretty(&data).map_err(|e| Error::request_build_json(uri, e))?;
    let headers = headers(uri, Some(JSON_CONTENT))?;

    let res = client(uri)?
        .post(uri)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    process_json_response(uri, res).await
}

/// Performs a POST of data that can be serialized into json, and expects
/// a 200 OK response, with or without a body.
pub async fn post_json(uri: &str, data: impl Serialize) -> Result<(), Error> {
    let body = serde_json::to_string_pretty(&data).map_err(|e| Error::request_build_json(uri, e))?;
    let headers = headers(uri, Some(JSON_CONTENT))?;

    let res = client(uri)?
        .post(uri)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    opt_response(uri, res).await.map(|_| ())
}

/// Performs a POST of data that can be serialized into json, and returns
/// the raw response bytes.
pub async fn post_json_with_bytes_response(uri: &str, data: impl Serialize) -> Result<Bytes, Error> {
    let body = serde_json::to_string_pretty(&data).map_err(|e| Error::request_build_json(uri, e))?;
    let headers = headers(uri, Some(JSON_CONTENT))?;

    let res = client(uri)?
        .post(uri)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    match opt_response(uri, res).await? {
        Some(bytes) => Ok(bytes),
        None => Err(Error::Custom(format!("expected body at: {uri}"))),
    }
}

/// Default client for verified connections.
fn client(uri: &str) -> Result<reqwest::Client, Error> {
    client_with_tweaks(uri, Duration::from_secs(HTTP_CLIENT_TIMEOUT_SECS), true)
}

/// Client with tweakable timeout and option to allow insecure connections.
fn client_with_tweaks(uri: &str, timeout: Duration, allow_insecure: bool) -> Result<reqwest::Client, Error> {
    let builder = reqwest::ClientBuilder::new().timeout(timeout);

    if uri.starts_with("https://") {
        if allow_insecure && env::var("EIDGATE_ACCEPT_INVALID_CERTS").is_ok() {
            builder
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| Error::request_build(uri, e))
        } else {
            builder.build().map_err(|e| Error::request_build(uri, e))
        }
    } else {
        builder.build().map_err(|e| Error::request_build(uri, e))
    }
}

fn headers(uri: &str, content_type: Option<&str>) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("eidgate/{EIDGATE_VERSION}"))
            .map_err(|_| Error::request_build_header(uri))?,
    );
    if let Some(content_type) = content_type {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(content_type).map_err(|_| Error::request_build_header(uri))?,
        );
    }
    Ok(headers)
}

async fn process_json_response<T: DeserializeOwned>(uri: &str, res: Response) -> Result<T, Error> {
    match opt_response(uri, res).await? {
        None => Err(Error::Custom(format!("expected JSON body at: {uri}"))),
        Some(bytes) => {
            serde_json::from_slice(&bytes).map_err(|e| Error::response_json(uri, e))
        }
    }
}

/// Checks the response status and returns the body bytes, if any.
async fn opt_response(uri: &str, res: Response) -> Result<Option<Bytes>, Error> {
    match res.status() {
        StatusCode::OK => {
            let bytes = res.bytes().await.map_err(|e| Error::execute(uri, e))?;
            if bytes.is_empty() {
                Ok(None)
            } else {
                Ok(Some(bytes))
            }
        }
        StatusCode::FORBIDDEN => Err(Error::Forbidden(uri.to_string())),
        status => {
            let body = res.bytes().await.map_err(|e| Error::execute(uri, e))?;
            if body.is_empty() {
                Err(Error::error_response(uri, status, "no body"))
            } else {
                Err(Error::error_response(
                    uri,
                    status,
                    &String::from_utf8_lossy(&body),
                ))
            }
        }
    }
}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    RequestBuild(String, String),
    Execute(String, String),
    Forbidden(String),
    ErrorResponse(String, StatusCode, String),
    ResponseJson(String, serde_json::Error),
    Custom(String),
}

impl Error {
    fn request_build(uri: &str, e: impl fmt::Display) -> Self {
        Error::RequestBuild(uri.to_string(), e.to_string())
    }

    fn request_build_json(uri: &str, e: serde_json::Error) -> Self {
        Error::RequestBuild(uri.to_string(), format!("cannot serialize body: {e}"))
    }

    fn request_build_header(uri: &str) -> Self {
        Error::RequestBuild(uri.to_string(), "cannot create header".to_string())
    }

    fn execute(uri: &str, e: impl fmt::Display) -> Self {
        Error::Execute(uri.to_string(), e.to_string())
    }

    fn error_response(uri: &str, status: StatusCode, msg: &str) -> Self {
        Error::ErrorResponse(uri.to_string(), status, msg.to_string())
    }

    fn response_json(uri: &str, e: serde_json::Error) -> Self {
        Error::ResponseJson(uri.to_string(), e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::RequestBuild(uri, msg) => {
                write!(f, "cannot build request for: {uri}, error: {msg}")
            }
            Error::Execute(uri, msg) => {
                write!(f, "cannot execute request for: {uri}, error: {msg}")
            }
            Error::Forbidden(uri) => write!(f, "access forbidden at: {uri}"),
            Error::ErrorResponse(uri, status, msg) => {
                write!(f, "error response from: {uri}, status: {status}, body: {msg}")
            }
            Error::ResponseJson(uri, e) => {
                write!(f, "cannot parse JSON response from: {uri}, error: {e}")
            }
            Error::Custom(msg) => msg.fmt(f),
        }
    }
}

impl std::error::Error for Error {}
