//! Common types used by the various eidgate components.

pub mod crypto;
pub mod error;
pub mod ext_serde;
pub mod httpclient;
pub mod storage;

pub use self::error::Error;

//------------ Response Aliases ----------------------------------------------

pub type EidResult<T> = std::result::Result<T, self::error::Error>;
pub type EidEmptyResult = std::result::Result<(), self::error::Error>;
