//! Configuration loading and validation.
//!
//! YAML file as source of truth, `COUNTERSRV_`-prefixed environment
//! variables as overlay (`__` separates nesting levels). The tree is
//! validated once; a validation failure is fatal at startup.

pub mod types;

use std::path::Path;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use tracing::info;

pub use types::{
    ApiConfig, AppConfig, AuthMode, ChannelConfig, ModbusDeviceConfig, MqttConfig, MqttDataType,
    MqttDeviceConfig, MqttSettings, PayloadFormat, ProcessingConfig, ServiceConfig,
    TimescaleSettings,
};

use crate::utils::{CounterSrvError, Result};

const ENV_PREFIX: &str = "COUNTERSRV_";

/// Immutable configuration handle shared across the service.
#[derive(Debug)]
pub struct ConfigManager {
    config: AppConfig,
}

impl ConfigManager {
    /// Load from an explicit file plus environment overlay.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CounterSrvError::ConfigError(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let config: AppConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        info!(path = %path.display(), "configuration loaded");

        Ok(Self { config })
    }

    /// Load using `COUNTERSRV_CONFIG` or the conventional default path.
    pub fn load() -> Result<Self> {
        let path = std::env::var("COUNTERSRV_CONFIG")
            .unwrap_or_else(|_| "config/countersrv.yaml".to_string());
        Self::from_file(path)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn into_config(self) -> AppConfig {
        self.config
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.config.service
    }

    pub fn api(&self) -> &ApiConfig {
        &self.config.api
    }

    pub fn timescale(&self) -> &TimescaleSettings {
        &self.config.timescale
    }

    pub fn modbus_devices(&self) -> &[ModbusDeviceConfig] {
        &self.config.modbus_devices
    }

    pub fn mqtt(&self) -> Option<&MqttConfig> {
        self.config.mqtt.as_ref()
    }

    pub fn log_level(&self) -> &str {
        &self.config.service.log_level
    }
}
