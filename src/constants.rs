//! Various eidgate-wide constants.

use crate::commons::storage::Namespace;

//------------ Binary Names -------------------------------------------------

/// The friendly name of the `eidgate` binary.
pub const EIDGATE_SERVER_APP: &str = "Eidgate";

/// The version of this crate.
pub const EIDGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

//------------ Config Files Paths -------------------------------------------

/// The default path to the eidgate config file.
pub const EIDGATE_DEFAULT_CONFIG_FILE: &str = "/etc/eidgate.conf";

//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const EIDGATE_ENV_LOG_LEVEL: &str = "EIDGATE_LOG_LEVEL";

/// The environment variable with the log target.
///
/// The variable should contain the name of a
/// [`LogType`][crate::config::LogType]. It will be overwritten by the
/// config file. The default is “file.”
pub const EIDGATE_ENV_LOG_TYPE: &str = "EIDGATE_LOG_TYPE";

/// The environment variable indicating the default storage URI.
///
/// The value will be overwritten with that in the config file. Defaults to
/// `local://./data` if not set or not a valid URI.
pub const EIDGATE_ENV_STORAGE_URI: &str = "EIDGATE_STORAGE_URI";

//------------ Storage Namespaces -------------------------------------------

/// Per service provider credential state ([`TerminalPermission`]).
///
/// [`TerminalPermission`]: crate::server::terminals::TerminalPermission
pub const TERMINALS_NS: &Namespace = Namespace::make("terminals");

/// Leased locks, both per provider and per HSM key.
pub const LOCKS_NS: &Namespace = Namespace::make("locks");

/// Revocation ("block") list sets and their version bookkeeping.
pub const BLOCKLIST_NS: &Namespace = Namespace::make("blocklist");

/// Archived copies of HSM key material, written before deletion.
pub const KEY_ARCHIVE_NS: &Namespace = Namespace::make("key-archive");

/// TLS client key pairs and certificates for the database custody backend.
pub const KEYSTORE_NS: &Namespace = Namespace::make("keystore");

/// Metadata about HSM resident keys (generation date, validity).
pub const HSM_KEYS_NS: &Namespace = Namespace::make("hsm-keys");

//------------ Scheduling defaults ------------------------------------------

/// How long an unreleased lock is considered fresh, in minutes.
pub const DEFAULT_LOCK_STALE_MINUTES: i64 = 5;

/// How long expired HSM keys are retained before rotation, in days.
pub const DEFAULT_HSM_KEY_RETENTION_DAYS: i64 = 2;

/// Fallback validity window for HSM keys without an expiration
/// attribute, in days.
pub const DEFAULT_HSM_KEY_VALIDITY_DAYS: i64 = 90;

/// The maximum number of retained CVC chain entries per terminal.
pub const DEFAULT_CVC_CHAIN_MAX_LENGTH: usize = 5;

/// Days before TLS client certificate expiry at which renewal starts.
pub const DEFAULT_TLS_RENEWAL_LEAD_DAYS: i64 = 14;

/// Days before CVC expiry at which renewal starts. Card verifiable
/// certificates are short lived, so this lead is short as well.
pub const DEFAULT_CVC_RENEWAL_LEAD_DAYS: i64 = 2;

/// The ceiling for requested request signer certificate validity.
pub const DEFAULT_RSC_MAX_VALIDITY_MONTHS: u32 = 36;
