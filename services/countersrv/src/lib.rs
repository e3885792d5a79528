//! countersrv: industrial counter-data collection service.
//!
//! Harvests 32-bit counter readings from Modbus/TCP counter modules and
//! MQTT-publishing sensors, normalizes them into one reading record, and
//! persists them in batches to a TimescaleDB hypertable with an on-disk
//! dead-letter queue for batches that outlive their retries. A small
//! authenticated HTTP surface exposes health, device status, the latest-
//! reading cache and operational actions.

pub mod api;
pub mod core;
pub mod utils;

pub use crate::core::config::{AppConfig, ConfigManager};
pub use crate::core::reading::{DeviceReading, Quality};
pub use crate::core::service::CollectorService;
pub use crate::core::storage::{StorageSink, TimescaleSink};
pub use crate::utils::{CounterSrvError, Result};
