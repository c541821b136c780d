//! The _eidgate_ library crate.
//!
//! eidgate is the credential lifecycle core of an eID authentication
//! gateway. It keeps the long lived cryptographic credentials of the
//! connected service providers — card verifiable certificates, TLS client
//! certificates used towards the issuing DVCA, and the request signer
//! certificates that authorize certificate requests — and renews them
//! before they expire. Multiple instances can run against the same
//! storage; they coordinate through leased locks rather than an external
//! coordinator.

pub mod api;
pub mod commons;
pub mod config;
pub mod constants;
pub mod server;

#[cfg(test)]
pub mod test;
