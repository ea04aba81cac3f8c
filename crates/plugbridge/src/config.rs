//! Configuration file parsing and structures.
//!
//! plugbridge reads a single TOML file. Every section is optional; a missing
//! file yields the built-in defaults. The file is first deserialized into
//! [`ConfigFile`] and then resolved and validated into [`Config`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use crate::device::Quirk;

const DEFAULT_NAME: &str = "plugbridge";
const DEFAULT_PIN: &str = "00102003";
const DEFAULT_BROKER_HOST: &str = "localhost";
const DEFAULT_BROKER_URL: &str = "tcp://localhost:1883";
const DEFAULT_BROKER_PORT: u16 = 1883;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 500;

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

/// Resolved configuration used by the bridge
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,

    /// Eight-digit pairing code, digits only
    pub pin: String,

    /// Root for per-device accessory storage
    pub storage_dir: Option<PathBuf>,

    pub shutdown_grace: Duration,
    pub broker: BrokerConfig,
    pub accessory: AccessoryConfig,
    pub logging: LoggingConfig,
    pub families: Vec<FamilyConfig>,
}

/// Resolved broker connection settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Prefix of the discovery namespace (default: "homeassistant")
    pub discovery_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccessoryConfig {
    /// Address the accessory transports listen on
    pub bind: IpAddr,
}

impl Default for AccessoryConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `rumqttc = "warn"`
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build the target filter for the tracing subscriber
    pub fn filter(&self) -> Targets {
        self.overrides.iter().fold(
            Targets::new().with_default(LevelFilter::from(self.level)),
            |targets, (target, level)| targets.with_target(target.clone(), LevelFilter::from(*level)),
        )
    }
}

/// A family of devices sharing firmware and therefore payload conventions
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FamilyConfig {
    /// Prefix of the discovery node id, e.g. "gosundsw2"
    pub node_prefix: String,

    pub quirk: Quirk,
    pub manufacturer: String,
    pub model: String,

    /// First level of the firmware's own state topics. When set, state
    /// messages can introduce a device before its discovery announcement.
    #[serde(default)]
    pub state_prefix: Option<String>,
}

impl FamilyConfig {
    fn builtin(node_prefix: &str, quirk: Quirk, manufacturer: &str, model: &str) -> Self {
        Self {
            node_prefix: node_prefix.to_string(),
            quirk,
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            state_prefix: Some(node_prefix.to_string()),
        }
    }
}

/// Device families recognised without configuration
pub fn default_families() -> Vec<FamilyConfig> {
    vec![
        FamilyConfig::builtin("gosundsw2", Quirk::SplitTopics, "Gosund", "SW2"),
        FamilyConfig::builtin("treatlifeds03", Quirk::CombinedPayload, "Treatlife", "DS03"),
        FamilyConfig::builtin("treatlifeds03", Quirk::SpeedBuckets, "Treatlife", "DS03"),
    ]
}

/// On-disk layout of the configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub name: Option<String>,
    pub pin: Option<String>,
    pub storage_dir: Option<PathBuf>,
    pub shutdown_grace_ms: Option<u64>,
    pub broker: BrokerSection,
    pub accessory: AccessoryConfig,
    pub logging: LoggingConfig,
    pub families: Option<Vec<FamilyConfig>>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    /// Broker URL, e.g. "tcp://localhost:1883"
    pub url: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_BROKER_URL.to_string(),
            client_id: None,
            username: None,
            password: None,
            discovery_prefix: default_discovery_prefix(),
        }
    }
}

impl Default for Config {
    /// Built-in values, identical to resolving an empty configuration file
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            pin: DEFAULT_PIN.to_string(),
            storage_dir: None,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            broker: BrokerConfig {
                host: DEFAULT_BROKER_HOST.to_string(),
                port: DEFAULT_BROKER_PORT,
                client_id: default_client_id(DEFAULT_NAME),
                username: None,
                password: None,
                discovery_prefix: default_discovery_prefix(),
            },
            accessory: AccessoryConfig::default(),
            logging: LoggingConfig::default(),
            families: default_families(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(contents)?;
        file.resolve()
    }

    /// Load from `path` when given and present, otherwise use the defaults.
    ///
    /// Returns whether the defaults were used alongside the configuration.
    pub fn load(path: Option<&Path>) -> Result<(Self, bool), ConfigError> {
        match path {
            Some(path) if path.exists() => Ok((Self::from_file(path)?, false)),
            _ => Ok((Self::default(), true)),
        }
    }

    /// Per-device storage directory, if storage is configured
    pub fn device_storage(&self, device_name: &str) -> Option<PathBuf> {
        self.storage_dir
            .as_ref()
            .map(|dir| dir.join(sanitize_path_component(device_name)))
    }
}

impl ConfigFile {
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let name = self.name.unwrap_or_else(|| DEFAULT_NAME.to_string());
        let pin = parse_pin(self.pin.as_deref().unwrap_or(DEFAULT_PIN))?;
        let (host, port) = parse_broker_url(&self.broker.url)?;

        let client_id = self
            .broker
            .client_id
            .unwrap_or_else(|| default_client_id(&name));

        let families = self.families.unwrap_or_else(default_families);

        Ok(Config {
            name,
            pin,
            storage_dir: self.storage_dir,
            shutdown_grace: Duration::from_millis(
                self.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
            broker: BrokerConfig {
                host,
                port,
                client_id,
                username: self.broker.username,
                password: self.broker.password,
                discovery_prefix: self.broker.discovery_prefix,
            },
            accessory: self.accessory,
            logging: self.logging,
            families,
        })
    }
}

fn default_client_id(name: &str) -> String {
    match hostname::get().ok().and_then(|h| h.into_string().ok()) {
        Some(host) => format!("{}-{}", name, host),
        None => name.to_string(),
    }
}

/// Accept "12345678" or "123-45-678"; returns the bare digits
fn parse_pin(pin: &str) -> Result<String, ConfigError> {
    let digits: String = pin.chars().filter(|c| *c != '-').collect();
    if digits.len() == 8 && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(digits)
    } else {
        Err(ConfigError::InvalidPin(pin.to_string()))
    }
}

fn parse_broker_url(raw: &str) -> Result<(String, u16), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBrokerUrl(raw.to_string(), reason.to_string());

    let url = url::Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "tcp" | "mqtt") {
        return Err(invalid("scheme must be tcp:// or mqtt://"));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host"))?;

    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_BROKER_PORT)))
}

fn sanitize_path_component(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid pairing PIN {0:?}: expected 8 digits")]
    InvalidPin(String),

    #[error("Invalid broker URL {0:?}: {1}")]
    InvalidBrokerUrl(String, String),
}
