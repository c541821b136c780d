//! Key pairs, certificate building and CMS containers.

mod cms;
mod keys;

pub use self::cms::{sign_cms, verify_cms};
pub use self::keys::{CsrSubject, KeyPair, build_csr, build_self_signed};

use std::fmt;

use openssl::error::ErrorStack;

pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

//------------ CryptoError ---------------------------------------------------

#[derive(Debug)]
pub enum CryptoError {
    OpenSslError(ErrorStack),
    DecodeError,
    KeyNotFound,
    InvalidSignature,
    Other(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CryptoError::OpenSslError(e) => write!(f, "OpenSSL error: {e}"),
            CryptoError::DecodeError => write!(f, "could not decode key or certificate"),
            CryptoError::KeyNotFound => write!(f, "key not found"),
            CryptoError::InvalidSignature => write!(f, "invalid signature"),
            CryptoError::Other(msg) => msg.fmt(f),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<ErrorStack> for CryptoError {
    fn from(e: ErrorStack) -> Self {
        CryptoError::OpenSslError(e)
    }
}
