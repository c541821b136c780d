//! Configuration of the eidgate daemon.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, fs, io};

use log::{LevelFilter, error};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;
use url::Url;

#[cfg(feature = "hsm")]
use secrecy::SecretString;

use crate::constants::*;

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn storage_uri() -> Url {
        match env::var(EIDGATE_ENV_STORAGE_URI) {
            Ok(uri) => match Url::parse(&uri) {
                Ok(uri) => return uri,
                Err(_) => {
                    eprintln!("Unrecognized value for storage URI in env var {EIDGATE_ENV_STORAGE_URI}");
                    std::process::exit(1);
                }
            },
            Err(_) => Url::parse("local://./data").unwrap(),
        }
    }

    fn log_level() -> LevelFilter {
        match env::var(EIDGATE_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!("Unrecognized value for log level in env var {EIDGATE_ENV_LOG_LEVEL}");
                    std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        match env::var(EIDGATE_ENV_LOG_TYPE) {
            Ok(log_type) => match LogType::from_str(&log_type) {
                Ok(log_type) => log_type,
                Err(e) => {
                    eprintln!("Unrecognized value for log type in env var {EIDGATE_ENV_LOG_TYPE}: {e}");
                    std::process::exit(1);
                }
            },
            _ => LogType::File,
        }
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./eidgate.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn instance_address() -> String {
        env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }

    fn organization() -> String {
        "eidgate".to_string()
    }

    fn blocklist_store_dir() -> PathBuf {
        PathBuf::from("./data/blocklists")
    }

    fn lock_stale_minutes() -> i64 {
        DEFAULT_LOCK_STALE_MINUTES
    }

    fn hsm_key_retention_days() -> i64 {
        DEFAULT_HSM_KEY_RETENTION_DAYS
    }

    fn hsm_key_validity_days() -> i64 {
        DEFAULT_HSM_KEY_VALIDITY_DAYS
    }

    fn cvc_chain_max_length() -> usize {
        DEFAULT_CVC_CHAIN_MAX_LENGTH
    }

    fn tls_renewal_lead_days() -> i64 {
        DEFAULT_TLS_RENEWAL_LEAD_DAYS
    }

    fn rsc_max_validity_months() -> u32 {
        DEFAULT_RSC_MAX_VALIDITY_MONTHS
    }

    fn blocklist_sync_seconds() -> u32 {
        3600
    }

    fn key_rotation_seconds() -> u32 {
        3600
    }

    fn lock_check_seconds() -> u32 {
        300
    }

    fn tls_check_seconds() -> u32 {
        3600
    }

    fn cvc_check_seconds() -> u32 {
        3600
    }

    fn cvc_renewal_lead_days() -> i64 {
        DEFAULT_CVC_RENEWAL_LEAD_DAYS
    }

    fn enabled() -> bool {
        true
    }

    fn key_custody() -> KeyCustodyType {
        KeyCustodyType::Database
    }

    fn service_providers() -> Vec<ServiceProviderConfig> {
        vec![]
    }

    fn dvca() -> HashMap<String, DvcaConfig> {
        HashMap::new()
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration for the eidgate daemon.
///
/// Parsed from a TOML config file. Every setting has a default so that a
/// minimal config only needs the service provider and DVCA tables.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::storage_uri")]
    pub storage_uri: Url,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "deserialize_level_filter"
    )]
    log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    syslog_facility: String,

    /// The identity under which this instance takes locks in shared
    /// storage. Must differ between the instances of a cluster.
    #[serde(default = "ConfigDefaults::instance_address")]
    pub instance_address: String,

    /// ISO 3166-1 alpha-2 code used in TLS client certificate subjects.
    /// There is no default: a missing or invalid code is a configuration
    /// error that fails startup rather than any renewal later on.
    pub country_code: String,

    #[serde(default = "ConfigDefaults::organization")]
    pub organization: String,

    /// The single provider allowed to bootstrap a request signer
    /// certificate without a prior holder reference.
    pub public_service_provider: Option<String>,

    #[serde(default = "ConfigDefaults::blocklist_store_dir")]
    pub blocklist_store_dir: PathBuf,

    #[serde(default = "ConfigDefaults::lock_stale_minutes")]
    pub lock_stale_minutes: i64,

    #[serde(default = "ConfigDefaults::hsm_key_retention_days")]
    pub hsm_key_retention_days: i64,

    #[serde(default = "ConfigDefaults::hsm_key_validity_days")]
    pub hsm_key_validity_days: i64,

    #[serde(default = "ConfigDefaults::cvc_chain_max_length")]
    pub cvc_chain_max_length: usize,

    #[serde(default = "ConfigDefaults::tls_renewal_lead_days")]
    pub tls_renewal_lead_days: i64,

    #[serde(default = "ConfigDefaults::rsc_max_validity_months")]
    pub rsc_max_validity_months: u32,

    #[serde(default = "ConfigDefaults::blocklist_sync_seconds")]
    pub blocklist_sync_seconds: u32,

    #[serde(default = "ConfigDefaults::key_rotation_seconds")]
    pub key_rotation_seconds: u32,

    #[serde(default = "ConfigDefaults::lock_check_seconds")]
    pub lock_check_seconds: u32,

    #[serde(default = "ConfigDefaults::tls_check_seconds")]
    pub tls_check_seconds: u32,

    #[serde(default = "ConfigDefaults::cvc_check_seconds")]
    pub cvc_check_seconds: u32,

    #[serde(default = "ConfigDefaults::cvc_renewal_lead_days")]
    pub cvc_renewal_lead_days: i64,

    #[serde(default = "ConfigDefaults::service_providers")]
    pub service_providers: Vec<ServiceProviderConfig>,

    #[serde(default = "ConfigDefaults::dvca")]
    pub dvca: HashMap<String, DvcaConfig>,

    #[cfg(feature = "hsm")]
    pub hsm: Option<HsmConfig>,
}

/// The static settings of one connected service provider.
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceProviderConfig {
    pub name: String,

    /// The identifier of the provider's CVC terminal context.
    pub cvc_ref_id: String,

    /// Which `[dvca.<name>]` section this provider renews against.
    pub dvca: String,

    /// Name of the key pair entry backing the current TLS client
    /// certificate.
    pub client_key_pair: String,

    /// Name of the key pair entry used while a renewal is in flight.
    pub pending_client_key_pair: String,

    #[serde(default = "ConfigDefaults::enabled")]
    pub enabled: bool,

    #[serde(default = "ConfigDefaults::key_custody")]
    pub key_custody: KeyCustodyType,
}

/// Where a provider's TLS client key material lives.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum KeyCustodyType {
    Database,
    Hsm,
}

/// Connection settings for one DVCA endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct DvcaConfig {
    pub base_url: Url,

    /// Path to the PEM encoded trust anchor used to verify block list
    /// responses from this DVCA.
    pub trust_anchor: Option<PathBuf>,
}

/// Connection settings for the PKCS#11 HSM, if one is used.
#[cfg(feature = "hsm")]
#[derive(Clone, Debug, Deserialize)]
pub struct HsmConfig {
    pub lib_path: PathBuf,
    pub slot_id: u64,
    pub user_pin: SecretString,
}

impl Config {
    /// Creates the config from the given file, and verifies it.
    pub fn create(config_file: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_config(config_file)?;
        config.verify()?;
        Ok(config)
    }

    fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read_to_string(file).map_err(|e| {
            ConfigError::Other(format!(
                "cannot read config file '{}': {}",
                file.display(),
                e
            ))
        })?;
        toml::from_str(&bytes).map_err(|e| {
            ConfigError::Other(format!(
                "error parsing config file '{}': {}",
                file.display(),
                e
            ))
        })
    }

    /// Checks the semantic constraints that toml parsing cannot express.
    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.country_code.len() != 2
            || !self.country_code.chars().all(|c| c.is_ascii_uppercase())
        {
            return Err(ConfigError::Other(format!(
                "country_code '{}' is not a valid ISO 3166-1 alpha-2 code",
                self.country_code
            )));
        }

        for sp in &self.service_providers {
            if !self.dvca.contains_key(&sp.dvca) {
                return Err(ConfigError::Other(format!(
                    "service provider '{}' references unknown dvca '{}'",
                    sp.name, sp.dvca
                )));
            }
        }

        if let Some(public) = &self.public_service_provider {
            if !self.service_providers.iter().any(|sp| &sp.name == public) {
                return Err(ConfigError::Other(format!(
                    "public_service_provider '{public}' is not a configured service provider"
                )));
            }
        }

        Ok(())
    }

    pub fn service_provider(&self, name: &str) -> Option<&ServiceProviderConfig> {
        self.service_providers.iter().find(|sp| sp.name == name)
    }

    /// Whether the named provider is the cluster's single public provider.
    pub fn is_public_service_provider(&self, name: &str) -> bool {
        self.public_service_provider.as_deref() == Some(name)
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            LogType::Syslog => self.syslog_logger(),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("failed to init stderr logging: {e}")))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("failed to init file logging: {e}")))
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        let facility = Facility::from_str(&self.syslog_facility)
            .map_err(|_| ConfigError::other("invalid syslog_facility"))?;
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("eidgate"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("failed to init syslog: {e}"))),
            Err(err) => Err(ConfigError::Other(format!("cannot connect to syslog: {err}"))),
        }
    }

    #[cfg(not(unix))]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        Err(ConfigError::other("syslog is not supported on this platform"))
    }

    /// Creates and returns a fern logger with log level tweaks.
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging from the frameworks underneath
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target =
            self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("reqwest", framework_level)
            .level_for("hyper", framework_level)
            .level_for("mio", framework_level)
            .level_for("want", framework_level)
            .level_for("h2", framework_level)
    }
}

fn deserialize_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(format!("expected 'stderr', 'file' or 'syslog', got: {s}")),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

impl std::error::Error for ConfigError {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config_toml() -> &'static str {
        r#"
            country_code = "DE"
            storage_uri = "memory://config-test"

            [[service_providers]]
            name = "sp-one"
            cvc_ref_id = "DETESTSP00001"
            dvca = "test-dvca"
            client_key_pair = "sp-one-tls"
            pending_client_key_pair = "sp-one-tls-pending"

            [dvca.test-dvca]
            base_url = "https://dvca.example.org/api/"
        "#
    }

    #[test]
    fn parse_minimal_config() {
        let config: Config = toml::from_str(minimal_config_toml()).unwrap();
        config.verify().unwrap();

        assert_eq!(config.country_code, "DE");
        assert_eq!(config.lock_stale_minutes, DEFAULT_LOCK_STALE_MINUTES);
        let sp = config.service_provider("sp-one").unwrap();
        assert!(sp.enabled);
        assert_eq!(sp.key_custody, KeyCustodyType::Database);
    }

    #[test]
    fn reject_invalid_country_code() {
        let toml_str = minimal_config_toml().replace("\"DE\"", "\"de1\"");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.verify().is_err());
    }

    #[test]
    fn reject_unknown_dvca_reference() {
        let toml_str = minimal_config_toml().replace("[dvca.test-dvca]", "[dvca.other]");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.verify().is_err());
    }
}
