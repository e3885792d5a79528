//! Configuration model for the collection service.
//!
//! All sections are read once at startup, validated as a tree, and immutable
//! afterwards. Devices may be added or removed through the pool API at
//! runtime, but individual configs never mutate.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::mqtt::topics::validate_filter;
use crate::utils::{CounterSrvError, Result};

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

fn default_register_count() -> u16 {
    2
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_timeout_ms() -> u64 {
    3_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_mqtt_port() -> u16 {
    1_883
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_qos() -> u8 {
    1
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_pg_port() -> u16 {
    5_432
}

fn default_table_name() -> String {
    "counter_data".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_timeout_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_dlq_path() -> String {
    "data/dlq".to_string()
}

fn default_replay_interval_secs() -> u64 {
    30
}

fn default_min_connections() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    5
}

fn default_init_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "countersrv".to_string()
}

/// Top-level application configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub modbus_devices: Vec<ModbusDeviceConfig>,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    pub timescale: TimescaleSettings,
}

impl AppConfig {
    /// Validate the whole configuration tree. Called once at startup;
    /// any error here is fatal.
    pub fn validate(&self) -> Result<()> {
        let mut device_ids = std::collections::HashSet::new();

        if self.modbus_devices.is_empty() && self.mqtt.as_ref().is_none_or(|m| m.devices.is_empty())
        {
            return Err(CounterSrvError::ConfigError(
                "no devices configured: need at least one Modbus or MQTT device".to_string(),
            ));
        }

        for device in &self.modbus_devices {
            device.validate()?;
            if !device_ids.insert(device.device_id.clone()) {
                return Err(CounterSrvError::ConfigError(format!(
                    "duplicate device id: {}",
                    device.device_id
                )));
            }
        }

        if let Some(mqtt) = &self.mqtt {
            mqtt.settings.validate()?;
            for device in &mqtt.devices {
                device.validate()?;
                if !device_ids.insert(device.device_id.clone()) {
                    return Err(CounterSrvError::ConfigError(format!(
                        "duplicate device id: {}",
                        device.device_id
                    )));
                }
            }
        }

        self.timescale.validate()?;
        self.api.validate()?;
        self.processing.validate()?;

        Ok(())
    }
}

/// Service identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

/// Authentication scheme guarding the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    None,
    ApiKey,
    Jwt,
}

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_auth_mode")]
    pub auth: AuthMode,
    /// Accepted keys for `AuthMode::ApiKey` (header `X-API-Key`).
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// HS256 secret for `AuthMode::Jwt` bearer validation.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

fn default_auth_mode() -> AuthMode {
    AuthMode::None
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            auth: AuthMode::None,
            api_keys: Vec::new(),
            jwt_secret: None,
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> Result<()> {
        match self.auth {
            AuthMode::ApiKey if self.api_keys.is_empty() => Err(CounterSrvError::ConfigError(
                "api.auth = api_key but api.api_keys is empty".to_string(),
            )),
            AuthMode::Jwt if self.jwt_secret.as_ref().is_none_or(String::is_empty) => {
                Err(CounterSrvError::ConfigError(
                    "api.auth = jwt but api.jwt_secret is not set".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Reading pipeline knobs (rate window presets: 30/60/180/600 seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            rate_window_secs: default_rate_window_secs(),
        }
    }
}

impl ProcessingConfig {
    const PRESETS: [u64; 4] = [30, 60, 180, 600];

    pub fn validate(&self) -> Result<()> {
        if !Self::PRESETS.contains(&self.rate_window_secs) {
            return Err(CounterSrvError::ConfigError(format!(
                "processing.rate_window_secs must be one of {:?}, got {}",
                Self::PRESETS,
                self.rate_window_secs
            )));
        }
        Ok(())
    }
}

/// One counter channel on a Modbus device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel: u32,
    pub start_register: u16,
    #[serde(default = "default_register_count")]
    pub register_count: u16,
    #[serde(default = "default_scale")]
    pub scale_factor: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    /// Anomaly threshold in processed units per second.
    #[serde(default)]
    pub max_change_rate: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.register_count, 1 | 2 | 4) {
            return Err(CounterSrvError::ConfigError(format!(
                "channel {}: register_count must be 1, 2 or 4, got {}",
                self.channel, self.register_count
            )));
        }
        if self.scale_factor <= 0.0 {
            return Err(CounterSrvError::ConfigError(format!(
                "channel {}: scale_factor must be positive, got {}",
                self.channel, self.scale_factor
            )));
        }
        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min >= max {
                return Err(CounterSrvError::ConfigError(format!(
                    "channel {}: min_value {} must be below max_value {}",
                    self.channel, min, max
                )));
            }
        }
        Ok(())
    }

    /// Unit string for readings on this channel, taken from the tag map.
    pub fn unit(&self) -> Option<String> {
        self.tags.get("unit").cloned()
    }
}

/// One Modbus/TCP counter module (ADAM-6051 class).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusDeviceConfig {
    pub device_id: String,
    pub ip_address: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default)]
    pub recv_buffer_size: Option<u32>,
    #[serde(default)]
    pub send_buffer_size: Option<u32>,
    pub channels: Vec<ChannelConfig>,
}

impl ModbusDeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            return Err(CounterSrvError::ConfigError(
                "modbus device with empty device_id".to_string(),
            ));
        }
        if self.ip_address.parse::<IpAddr>().is_err() {
            return Err(CounterSrvError::ConfigError(format!(
                "device {}: invalid ip_address {}",
                self.device_id, self.ip_address
            )));
        }
        if self.port == 0 {
            return Err(CounterSrvError::ConfigError(format!(
                "device {}: port must be in [1,65535]",
                self.device_id
            )));
        }
        if self.unit_id == 0 {
            return Err(CounterSrvError::ConfigError(format!(
                "device {}: unit_id must be in [1,255]",
                self.device_id
            )));
        }
        if self.channels.is_empty() {
            return Err(CounterSrvError::ConfigError(format!(
                "device {}: at least one channel is required",
                self.device_id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            channel.validate().map_err(|e| {
                CounterSrvError::ConfigError(format!("device {}: {}", self.device_id, e))
            })?;
            if !seen.insert(channel.channel) {
                return Err(CounterSrvError::ConfigError(format!(
                    "device {}: duplicate channel number {}",
                    self.device_id, channel.channel
                )));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Wire format of an MQTT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Json,
    Binary,
    Csv,
}

/// Numeric type carried inside an MQTT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MqttDataType {
    UInt32,
    Int16,
    UInt16,
    Float32,
    Float64,
}

/// One MQTT-publishing sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttDeviceConfig {
    pub device_id: String,
    /// MQTT topic filters (`+` single level, `#` multi level terminal).
    pub topics: Vec<String>,
    pub format: PayloadFormat,
    pub data_type: MqttDataType,
    /// Per-device QoS override; broker default applies when absent.
    #[serde(default)]
    pub qos: Option<u8>,
    /// JSON path to the channel number, e.g. `$.ch` (Json format only).
    #[serde(default)]
    pub channel_path: Option<String>,
    /// JSON path to the value, e.g. `$.v` (Json format only).
    #[serde(default)]
    pub value_path: Option<String>,
    #[serde(default)]
    pub device_id_path: Option<String>,
    #[serde(default)]
    pub timestamp_path: Option<String>,
    #[serde(default = "default_scale")]
    pub scale_factor: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

impl MqttDeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            return Err(CounterSrvError::ConfigError(
                "mqtt device with empty device_id".to_string(),
            ));
        }
        if self.topics.is_empty() {
            return Err(CounterSrvError::ConfigError(format!(
                "device {}: at least one topic is required",
                self.device_id
            )));
        }
        for topic in &self.topics {
            validate_filter(topic).map_err(|e| {
                CounterSrvError::ConfigError(format!("device {}: {}", self.device_id, e))
            })?;
        }
        if let Some(qos) = self.qos {
            if qos > 2 {
                return Err(CounterSrvError::ConfigError(format!(
                    "device {}: qos must be 0, 1 or 2",
                    self.device_id
                )));
            }
        }
        if self.scale_factor <= 0.0 {
            return Err(CounterSrvError::ConfigError(format!(
                "device {}: scale_factor must be positive",
                self.device_id
            )));
        }
        if self.format == PayloadFormat::Json
            && (self.channel_path.is_none() || self.value_path.is_none())
        {
            return Err(CounterSrvError::ConfigError(format!(
                "device {}: json format requires channel_path and value_path",
                self.device_id
            )));
        }
        Ok(())
    }
}

/// Broker connection settings shared by all MQTT devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    pub broker_host: String,
    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    /// CA certificate path, required when `use_tls` is set.
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_qos")]
    pub default_qos: u8,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// 0 means reconnect forever.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

impl MqttSettings {
    pub fn validate(&self) -> Result<()> {
        if self.broker_host.is_empty() {
            return Err(CounterSrvError::ConfigError(
                "mqtt.broker_host must be set".to_string(),
            ));
        }
        if self.client_id.is_empty() {
            return Err(CounterSrvError::ConfigError(
                "mqtt.client_id must be set".to_string(),
            ));
        }
        if self.default_qos > 2 {
            return Err(CounterSrvError::ConfigError(
                "mqtt.default_qos must be 0, 1 or 2".to_string(),
            ));
        }
        match (&self.username, &self.password) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(CounterSrvError::ConfigError(
                    "mqtt credentials require both username and password".to_string(),
                ));
            }
            _ => {}
        }
        if self.use_tls && self.ca_cert.as_ref().is_none_or(String::is_empty) {
            return Err(CounterSrvError::ConfigError(
                "mqtt.use_tls requires mqtt.ca_cert".to_string(),
            ));
        }
        if self.use_tls && self.broker_port == 1_883 {
            tracing::warn!("mqtt TLS enabled on plain-text port 1883; did you mean 8883?");
        }
        Ok(())
    }
}

/// MQTT section: broker settings plus the device set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub settings: MqttSettings,
    #[serde(default)]
    pub devices: Vec<MqttDeviceConfig>,
}

/// TimescaleDB sink, batch writer and dead-letter queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimescaleSettings {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub dlq_enabled: bool,
    #[serde(default = "default_dlq_path")]
    pub dlq_path: String,
    #[serde(default = "default_replay_interval_secs")]
    pub dlq_replay_interval_secs: u64,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub ssl_mode: bool,
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl TimescaleSettings {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(CounterSrvError::ConfigError(
                "timescale.host must be set".to_string(),
            ));
        }
        if self.database.is_empty() || self.username.is_empty() {
            return Err(CounterSrvError::ConfigError(
                "timescale.database and timescale.username must be set".to_string(),
            ));
        }
        if self.table_name.is_empty() {
            return Err(CounterSrvError::ConfigError(
                "timescale.table_name must be set".to_string(),
            ));
        }
        if self.batch_size == 0 || self.queue_capacity == 0 {
            return Err(CounterSrvError::ConfigError(
                "timescale batch_size and queue_capacity must be positive".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(CounterSrvError::ConfigError(format!(
                "timescale.min_connections {} exceeds max_connections {}",
                self.min_connections, self.max_connections
            )));
        }
        if self.dlq_enabled && self.dlq_path.is_empty() {
            return Err(CounterSrvError::ConfigError(
                "timescale.dlq_path must be set when the dead-letter queue is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(n: u32) -> ChannelConfig {
        ChannelConfig {
            channel: n,
            start_register: 0,
            register_count: 2,
            scale_factor: 1.0,
            offset: 0.0,
            min_value: None,
            max_value: None,
            max_change_rate: None,
            enabled: true,
            tags: HashMap::new(),
        }
    }

    fn modbus_device(id: &str) -> ModbusDeviceConfig {
        ModbusDeviceConfig {
            device_id: id.to_string(),
            ip_address: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            enabled: true,
            poll_interval_ms: 1_000,
            timeout_ms: 3_000,
            max_retries: 3,
            keep_alive: true,
            recv_buffer_size: None,
            send_buffer_size: None,
            channels: vec![channel(0)],
        }
    }

    fn timescale() -> TimescaleSettings {
        TimescaleSettings {
            host: "localhost".to_string(),
            port: 5_432,
            database: "counters".to_string(),
            username: "logger".to_string(),
            password: String::new(),
            table_name: default_table_name(),
            batch_size: 50,
            batch_timeout_ms: 5_000,
            queue_capacity: 10_000,
            max_retry_attempts: 5,
            retry_base_delay_ms: 500,
            max_retry_delay_ms: 30_000,
            dlq_enabled: true,
            dlq_path: "data/dlq".to_string(),
            dlq_replay_interval_secs: 30,
            min_connections: 1,
            max_connections: 5,
            ssl_mode: false,
            init_timeout_secs: 30,
            shutdown_timeout_secs: 10,
        }
    }

    #[test]
    fn test_channel_bounds_must_be_ordered() {
        let mut ch = channel(0);
        ch.min_value = Some(100.0);
        ch.max_value = Some(100.0);
        assert!(ch.validate().is_err());

        ch.max_value = Some(200.0);
        assert!(ch.validate().is_ok());
    }

    #[test]
    fn test_channel_scale_must_be_positive() {
        let mut ch = channel(0);
        ch.scale_factor = 0.0;
        assert!(ch.validate().is_err());
        ch.scale_factor = -1.0;
        assert!(ch.validate().is_err());
    }

    #[test]
    fn test_channel_register_count_presets() {
        for count in [1u16, 2, 4] {
            let mut ch = channel(0);
            ch.register_count = count;
            assert!(ch.validate().is_ok());
        }
        let mut ch = channel(0);
        ch.register_count = 3;
        assert!(ch.validate().is_err());
    }

    #[test]
    fn test_device_requires_channels() {
        let mut dev = modbus_device("adam-1");
        dev.channels.clear();
        assert!(dev.validate().is_err());
    }

    #[test]
    fn test_device_rejects_duplicate_channel_numbers() {
        let mut dev = modbus_device("adam-1");
        dev.channels = vec![channel(0), channel(0)];
        assert!(dev.validate().is_err());
    }

    #[test]
    fn test_device_rejects_bad_address() {
        let mut dev = modbus_device("adam-1");
        dev.ip_address = "not-an-ip".to_string();
        assert!(dev.validate().is_err());

        let mut dev = modbus_device("adam-1");
        dev.unit_id = 0;
        assert!(dev.validate().is_err());
    }

    #[test]
    fn test_app_config_rejects_duplicate_device_ids() {
        let config = AppConfig {
            service: ServiceConfig::default(),
            api: ApiConfig::default(),
            processing: ProcessingConfig::default(),
            modbus_devices: vec![modbus_device("dev-1"), modbus_device("dev-1")],
            mqtt: None,
            timescale: timescale(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_app_config_requires_some_device() {
        let config = AppConfig {
            service: ServiceConfig::default(),
            api: ApiConfig::default(),
            processing: ProcessingConfig::default(),
            modbus_devices: Vec::new(),
            mqtt: None,
            timescale: timescale(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mqtt_settings_credentials_consistency() {
        let mut settings = MqttSettings {
            broker_host: "broker.local".to_string(),
            broker_port: 1_883,
            client_id: "countersrv-1".to_string(),
            username: Some("user".to_string()),
            password: None,
            use_tls: false,
            ca_cert: None,
            keep_alive_secs: 60,
            default_qos: 1,
            reconnect_delay_secs: 5,
            max_reconnect_attempts: 0,
        };
        assert!(settings.validate().is_err());

        settings.password = Some("secret".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_mqtt_tls_requires_ca() {
        let settings = MqttSettings {
            broker_host: "broker.local".to_string(),
            broker_port: 8_883,
            client_id: "countersrv-1".to_string(),
            username: None,
            password: None,
            use_tls: true,
            ca_cert: None,
            keep_alive_secs: 60,
            default_qos: 1,
            reconnect_delay_secs: 5,
            max_reconnect_attempts: 0,
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_mqtt_device_rejects_invalid_filter() {
        let dev = MqttDeviceConfig {
            device_id: "sensor-1".to_string(),
            topics: vec!["factory/##".to_string()],
            format: PayloadFormat::Csv,
            data_type: MqttDataType::UInt32,
            qos: None,
            channel_path: None,
            value_path: None,
            device_id_path: None,
            timestamp_path: None,
            scale_factor: 1.0,
            unit: None,
        };
        assert!(dev.validate().is_err());
    }

    #[test]
    fn test_mqtt_json_device_requires_paths() {
        let dev = MqttDeviceConfig {
            device_id: "sensor-1".to_string(),
            topics: vec!["factory/line1/+/counter".to_string()],
            format: PayloadFormat::Json,
            data_type: MqttDataType::Float32,
            qos: None,
            channel_path: None,
            value_path: None,
            device_id_path: None,
            timestamp_path: None,
            scale_factor: 1.0,
            unit: None,
        };
        assert!(dev.validate().is_err());
    }

    #[test]
    fn test_timescale_pool_bounds() {
        let mut settings = timescale();
        settings.min_connections = 10;
        settings.max_connections = 5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rate_window_presets() {
        for preset in [30u64, 60, 180, 600] {
            let cfg = ProcessingConfig {
                rate_window_secs: preset,
            };
            assert!(cfg.validate().is_ok());
        }
        let cfg = ProcessingConfig {
            rate_window_secs: 45,
        };
        assert!(cfg.validate().is_err());
    }
}
