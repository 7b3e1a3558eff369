//! Configuration vault – reads/writes `~/.cmdbridge/config.toml`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cmdbridge_middleware::BridgeSettings;
use cmdbridge_middleware::topic::keys;
use cmdbridge_types::{BridgeError, DeliveryOptions, DeviceDescriptor, QosLevel};
use serde::{Deserialize, Serialize};

/// Broker connection parameters shared by the external and internal links.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// MQTT client ID. A unique one is generated at connect time when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    /// Stored as plain text – restrict permissions on the config file.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: String::new(),
            keep_alive_secs: default_keep_alive_secs(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// The broker external clients talk to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalMqttConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub qos: QosLevel,

    #[serde(default)]
    pub retain: bool,

    /// Dead-letter topic for requests that cannot be answered on their own
    /// response topic. Unset means log and drop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_topic: Option<String>,

    #[serde(default = "default_external_topics")]
    pub topics: HashMap<String, String>,
}

impl Default for ExternalMqttConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            qos: QosLevel::default(),
            retain: false,
            fallback_topic: None,
            topics: default_external_topics(),
        }
    }
}

/// The internal message bus, carried over MQTT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBusConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub qos: QosLevel,

    #[serde(default = "default_internal_topics")]
    pub topics: HashMap<String, String>,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            qos: QosLevel::default(),
            topics: default_internal_topics(),
        }
    }
}

/// Persisted bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upper bound on the wait for a device-service response.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub external_mqtt: ExternalMqttConfig,

    #[serde(default)]
    pub message_bus: MessageBusConfig,

    /// Device catalogue used for routing and command queries.
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            external_mqtt: ExternalMqttConfig::default(),
            message_bus: MessageBusConfig::default(),
            devices: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_request_timeout_ms() -> u64 {
    5000
}

fn topic_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn default_external_topics() -> HashMap<String, String> {
    topic_map(&[
        (keys::COMMAND_REQUEST_TOPIC, "edgex/command/request/#"),
        (keys::COMMAND_QUERY_REQUEST_TOPIC, "edgex/commandquery/request/#"),
        (keys::COMMAND_RESPONSE_TOPIC_PREFIX, "edgex/command/response"),
        (keys::QUERY_RESPONSE_TOPIC, "edgex/commandquery/response"),
    ])
}

fn default_internal_topics() -> HashMap<String, String> {
    topic_map(&[
        (keys::DEVICE_COMMAND_REQUEST_TOPIC_PREFIX, "edgex/device/command/request"),
        (keys::COMMAND_RESPONSE_TOPIC_PREFIX, "edgex/response"),
    ])
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reject configurations the bridge cannot run with.
    ///
    /// Missing topic keys are deliberately not checked here: the handlers
    /// report them per message.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.request_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        for (name, conn) in [
            ("external_mqtt", &self.external_mqtt.connection),
            ("message_bus", &self.message_bus.connection),
        ] {
            if conn.host.trim().is_empty() {
                return Err(BridgeError::Config(format!("{name}.host must not be empty")));
            }
            if conn.port == 0 {
                return Err(BridgeError::Config(format!("{name}.port must not be 0")));
            }
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.name.as_str()) {
                return Err(BridgeError::Config(format!(
                    "device '{}' is listed more than once",
                    device.name
                )));
            }
        }
        Ok(())
    }

    /// Immutable settings handed to the bridge.
    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            external_topics: self.external_mqtt.topics.clone(),
            internal_topics: self.message_bus.topics.clone(),
            delivery: DeliveryOptions {
                qos: self.external_mqtt.qos,
                retain: self.external_mqtt.retain,
            },
            request_timeout: self.request_timeout(),
            fallback_topic: self.external_mqtt.fallback_topic.clone(),
        }
    }
}

/// Return the path to `~/.cmdbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".cmdbridge").join("config.toml")
}

/// Load, override and validate the config. Returns `None` if the file does
/// not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, BridgeError> {
    load_with(path, env_var)
}

/// [`load_from`] with an explicit variable lookup for the overrides.
pub(crate) fn load_with(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<Config>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| BridgeError::Config(format!("failed to parse config: {e}")))?;
    apply_overrides(&mut cfg, lookup);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `CMDBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CMDBRIDGE_EXTERNAL_HOST` | `external_mqtt.host` |
/// | `CMDBRIDGE_EXTERNAL_PORT` | `external_mqtt.port` |
/// | `CMDBRIDGE_BUS_HOST` | `message_bus.host` |
/// | `CMDBRIDGE_BUS_PORT` | `message_bus.port` |
/// | `CMDBRIDGE_REQUEST_TIMEOUT_MS` | `request_timeout_ms` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, env_var);
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CMDBRIDGE_EXTERNAL_HOST") {
        cfg.external_mqtt.connection.host = v;
    }
    if let Some(port) = lookup("CMDBRIDGE_EXTERNAL_PORT").and_then(|v| v.parse::<u16>().ok()) {
        cfg.external_mqtt.connection.port = port;
    }
    if let Some(v) = lookup("CMDBRIDGE_BUS_HOST") {
        cfg.message_bus.connection.host = v;
    }
    if let Some(port) = lookup("CMDBRIDGE_BUS_PORT").and_then(|v| v.parse::<u16>().ok()) {
        cfg.message_bus.connection.port = port;
    }
    if let Some(ms) = lookup("CMDBRIDGE_REQUEST_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        cfg.request_timeout_ms = ms;
    }
}

/// Save the config to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BridgeError::Config(format!("failed to create config directory: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                BridgeError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BridgeError::Config(format!("failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| {
                BridgeError::Config(format!("failed to write config at {}: {e}", path.display()))
            })?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| {
        BridgeError::Config(format!("failed to write config at {}: {e}", path.display()))
    })?;
    Ok(())
}
