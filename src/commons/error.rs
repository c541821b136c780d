//! Defines all eidgate server side errors.

use std::{fmt, io};

use crate::commons::crypto::CryptoError;
use crate::commons::httpclient;
use crate::commons::storage::KeyValueError;

//------------ FatalIoError --------------------------------------------------

/// An I/O error together with a human readable description of what was
/// being attempted.
///
/// Plain [`io::Error`] values rarely carry enough context to act on when
/// they surface in a log file on an operator's screen.
#[derive(Debug)]
pub struct FatalIoError {
    context: String,
    cause: io::Error,
}

impl FatalIoError {
    pub fn new(context: impl Into<String>, cause: io::Error) -> Self {
        FatalIoError {
            context: context.into(),
            cause,
        }
    }
}

impl fmt::Display for FatalIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.cause)
    }
}

impl std::error::Error for FatalIoError {}

//------------ Error ---------------------------------------------------------

/// The one error type used by the server side components.
///
/// Scheduled jobs generally do not propagate these errors; they catch them
/// per provider or per key and accumulate them into a
/// [`JobReport`][crate::api::JobReport]. The exceptions are genuinely
/// unexpected conditions, such as local I/O failures, which abort the
/// whole job invocation.
#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // System issues
    //-----------------------------------------------------------------
    IoError(FatalIoError),
    KeyValueError(KeyValueError),
    JsonError(serde_json::Error),
    HttpClientError(httpclient::Error),

    //-----------------------------------------------------------------
    // Configuration issues — terminal for the operation, never retried
    //-----------------------------------------------------------------
    ConfigError(String),
    UnknownServiceProvider(String),
    KeyPairNotFound(String),

    //-----------------------------------------------------------------
    // Crypto and remote issues
    //-----------------------------------------------------------------
    CryptoError(CryptoError),
    HsmError(String),
    DvcaError(String),
    SignatureInvalid(String),
    CvcDecode(String),

    //-----------------------------------------------------------------
    // Credential state issues
    //-----------------------------------------------------------------
    PendingRequestExists(String),
    NoPendingRequest(String),

    Custom(String),
}

impl Error {
    pub fn custom(msg: impl fmt::Display) -> Self {
        Error::Custom(msg.to_string())
    }

    pub fn config(msg: impl fmt::Display) -> Self {
        Error::ConfigError(msg.to_string())
    }

    pub fn hsm(msg: impl fmt::Display) -> Self {
        Error::HsmError(msg.to_string())
    }

    pub fn dvca(msg: impl fmt::Display) -> Self {
        Error::DvcaError(msg.to_string())
    }

    pub fn signature_invalid(msg: impl fmt::Display) -> Self {
        Error::SignatureInvalid(msg.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IoError(e) => e.fmt(f),
            Error::KeyValueError(e) => write!(f, "storage issue: {e}"),
            Error::JsonError(e) => write!(f, "invalid JSON: {e}"),
            Error::HttpClientError(e) => e.fmt(f),
            Error::ConfigError(msg) => write!(f, "configuration error: {msg}"),
            Error::UnknownServiceProvider(name) => {
                write!(f, "unknown service provider '{name}'")
            }
            Error::KeyPairNotFound(name) => write!(f, "key pair '{name}' not found"),
            Error::CryptoError(e) => write!(f, "signing issue: {e}"),
            Error::HsmError(msg) => write!(f, "HSM issue: {msg}"),
            Error::DvcaError(msg) => write!(f, "DVCA issue: {msg}"),
            Error::SignatureInvalid(msg) => write!(f, "signature verification failed: {msg}"),
            Error::CvcDecode(msg) => write!(f, "cannot decode CVC: {msg}"),
            Error::PendingRequestExists(ref_id) => {
                write!(f, "terminal '{ref_id}' already has a pending request")
            }
            Error::NoPendingRequest(ref_id) => {
                write!(f, "terminal '{ref_id}' has no pending request")
            }
            Error::Custom(msg) => msg.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<FatalIoError> for Error {
    fn from(e: FatalIoError) -> Self {
        Error::IoError(e)
    }
}

impl From<KeyValueError> for Error {
    fn from(e: KeyValueError) -> Self {
        Error::KeyValueError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonError(e)
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::CryptoError(e)
    }
}

impl From<httpclient::Error> for Error {
    fn from(e: httpclient::Error) -> Self {
        Error::HttpClientError(e)
    }
}
