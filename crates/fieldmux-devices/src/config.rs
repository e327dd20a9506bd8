/*!
 * Device configuration.
 *
 * A [`DeviceConfig`] carries the fields every device shares plus one
 * protocol-specific settings struct selected by the `protocol` tag.
 */
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use config::{Config as ConfigLib, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fieldmux_core::pool::PoolConfig;

use crate::adapter::{DeviceError, Result};

/// Protocol families a device can speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Register-based Modbus TCP
    Modbus,
    /// Node-based OPC UA
    #[serde(rename = "opcua")]
    OpcUa,
    /// Topic-based MQTT
    Mqtt,
    /// Area-based Siemens S7
    S7,
}

impl Protocol {
    /// Lowercase protocol tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Modbus => "modbus",
            Protocol::OpcUa => "opcua",
            Protocol::Mqtt => "mqtt",
            Protocol::S7 => "s7",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "modbus" => Ok(Protocol::Modbus),
            "opcua" | "opc-ua" => Ok(Protocol::OpcUa),
            "mqtt" => Ok(Protocol::Mqtt),
            "s7" => Ok(Protocol::S7),
            other => Err(DeviceError::Validation(format!("Unknown protocol: {}", other))),
        }
    }
}

/// Reconnect policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Whether the adapter retries after losing its transport
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Attempts before giving up
    #[serde(default = "default_max_attempts", alias = "maxAttempts")]
    pub max_attempts: u32,
    /// Delay before the first attempt
    #[serde(default = "default_initial_delay_ms", alias = "initialDelayMs")]
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    #[serde(default = "default_max_delay_ms", alias = "maxDelayMs")]
    pub max_delay_ms: u64,
    /// Factor applied to the delay after each failed attempt
    #[serde(default = "default_backoff_multiplier", alias = "backoffMultiplier")]
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl ReconnectConfig {
    /// Check the numbers make a usable policy
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_attempts == 0 {
            return Err(DeviceError::Validation(
                "reconnect.max_attempts must be positive".to_string(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(DeviceError::Validation(format!(
                "reconnect.initial_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(DeviceError::Validation(format!(
                "reconnect.backoff_multiplier must be at least 1, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// Modbus TCP settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusSettings {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// Unit (slave) identifier
    #[serde(default = "default_unit_id", alias = "unitId")]
    pub unit_id: u8,
    /// Sizing of the per-device connection pool
    #[serde(default = "default_modbus_pool")]
    pub pool: PoolConfig,
}

/// OPC UA settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpcUaSettings {
    /// Server endpoint, e.g. `opc.tcp://host:4840`
    #[serde(alias = "endpointUrl")]
    pub endpoint_url: String,
    /// Security policy name
    #[serde(default, alias = "securityPolicy")]
    pub security_policy: Option<String>,
    /// Security mode name
    #[serde(default, alias = "securityMode")]
    pub security_mode: Option<String>,
    /// User name for session activation
    #[serde(default)]
    pub username: Option<String>,
    /// Password for session activation
    #[serde(default)]
    pub password: Option<String>,
}

/// MQTT settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSettings {
    /// Broker host name or IP address
    pub broker: String,
    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Client identifier; generated when absent
    #[serde(default, alias = "clientId")]
    pub client_id: Option<String>,
    /// User name
    #[serde(default)]
    pub username: Option<String>,
    /// Password
    #[serde(default)]
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs", alias = "keepAliveSecs")]
    pub keep_alive_secs: u64,
    /// QoS used for subscriptions and publishes (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Start with a clean session
    #[serde(default = "default_true", alias = "cleanSession")]
    pub clean_session: bool,
    /// Retain flag for writes
    #[serde(default)]
    pub retain: bool,
}

/// Siemens S7 settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S7Settings {
    /// PLC host name or IP address
    pub host: String,
    /// ISO-on-TCP port
    #[serde(default = "default_s7_port")]
    pub port: u16,
    /// Rack number
    #[serde(default)]
    pub rack: u16,
    /// Slot number
    #[serde(default = "default_s7_slot")]
    pub slot: u16,
}

/// Protocol-specific part of a device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolSettings {
    /// Modbus TCP
    Modbus(ModbusSettings),
    /// OPC UA
    #[serde(rename = "opcua")]
    OpcUa(OpcUaSettings),
    /// MQTT
    Mqtt(MqttSettings),
    /// Siemens S7
    S7(S7Settings),
}

impl ProtocolSettings {
    /// Protocol tag of the variant
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolSettings::Modbus(_) => Protocol::Modbus,
            ProtocolSettings::OpcUa(_) => Protocol::OpcUa,
            ProtocolSettings::Mqtt(_) => Protocol::Mqtt,
            ProtocolSettings::S7(_) => Protocol::S7,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            ProtocolSettings::Modbus(s) => {
                require_host("host", &s.host)?;
                require_port(s.port)?;
                s.pool.validate()?;
            }
            ProtocolSettings::OpcUa(s) => {
                if !s.endpoint_url.starts_with("opc.tcp://") {
                    return Err(DeviceError::Validation(format!(
                        "endpoint_url must start with opc.tcp://, got {:?}",
                        s.endpoint_url
                    )));
                }
            }
            ProtocolSettings::Mqtt(s) => {
                require_host("broker", &s.broker)?;
                require_port(s.port)?;
                if s.qos > 2 {
                    return Err(DeviceError::Validation(format!("qos must be 0, 1 or 2, got {}", s.qos)));
                }
                if s.keep_alive_secs == 0 {
                    return Err(DeviceError::Validation("keep_alive_secs must be positive".to_string()));
                }
            }
            ProtocolSettings::S7(s) => {
                require_host("host", &s.host)?;
                require_port(s.port)?;
            }
        }
        Ok(())
    }
}

/// Description of one device
///
/// Immutable once registered; replacing it means adding the device again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Process-wide unique device identifier
    #[serde(alias = "deviceId")]
    pub device_id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: Option<String>,
    /// Whether `connect_all` should connect the device
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default timeout for connect, read and write
    #[serde(default = "default_timeout_ms", alias = "timeoutMs")]
    pub timeout_ms: u64,
    /// Reconnect policy
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Protocol-specific settings, tagged by `protocol`
    #[serde(flatten)]
    pub settings: ProtocolSettings,
}

impl DeviceConfig {
    /// Create a configuration with default common fields
    pub fn new(device_id: impl Into<String>, settings: ProtocolSettings) -> Self {
        Self {
            device_id: device_id.into(),
            name: None,
            enabled: true,
            timeout_ms: default_timeout_ms(),
            reconnect: ReconnectConfig::default(),
            settings,
        }
    }

    /// Set the operation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the reconnect policy
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Enable or disable the device
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Protocol of the device
    pub fn protocol(&self) -> Protocol {
        self.settings.protocol()
    }

    /// Default operation timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check the configuration once, before it is used
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(DeviceError::Validation("device_id must not be empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(DeviceError::Validation(format!(
                "device {}: timeout_ms must be positive",
                self.device_id
            )));
        }
        self.reconnect
            .validate()
            .and_then(|_| self.settings.validate())
            .map_err(|e| match e {
                DeviceError::Validation(msg) => {
                    DeviceError::Validation(format!("device {}: {}", self.device_id, msg))
                }
                other => other,
            })
    }
}

#[derive(Debug, Deserialize)]
struct DeviceFile {
    #[serde(default)]
    devices: Vec<DeviceConfig>,
}

/// Load and validate the `devices` list from a TOML, YAML or JSON file
pub fn load_device_configs<P: AsRef<Path>>(path: P) -> Result<Vec<DeviceConfig>> {
    let path = path.as_ref();
    debug!("Loading device configuration from {}", path.display());

    let source = ConfigLib::builder()
        .add_source(File::from(path))
        .build()
        .map_err(|e| DeviceError::Validation(format!("Failed to read {}: {}", path.display(), e)))?;

    let file: DeviceFile = source
        .try_deserialize()
        .map_err(|e| DeviceError::Validation(format!("Invalid device configuration: {}", e)))?;

    let mut seen = std::collections::HashSet::new();
    for device in &file.devices {
        device.validate()?;
        if !seen.insert(device.device_id.as_str()) {
            return Err(DeviceError::Validation(format!(
                "duplicate device_id {}",
                device.device_id
            )));
        }
    }

    info!("Loaded {} device configurations", file.devices.len());
    Ok(file.devices)
}

fn require_host(field: &str, host: &str) -> Result<()> {
    if host.trim().is_empty() {
        return Err(DeviceError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn require_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(DeviceError::Validation("port must not be 0".to_string()));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_modbus_pool() -> PoolConfig {
    // most Modbus TCP servers accept only a handful of clients
    PoolConfig {
        min_connections: 1,
        max_connections: 2,
        ..PoolConfig::default()
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_qos() -> u8 {
    1
}

fn default_s7_port() -> u16 {
    102
}

fn default_s7_slot() -> u16 {
    1
}
