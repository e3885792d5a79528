//! Core collection, processing and persistence components.

pub mod cache;
pub mod config;
pub mod health;
pub mod modbus;
pub mod mqtt;
pub mod reading;
pub mod service;
pub mod storage;

pub use cache::LatestReadingCache;
pub use config::{AppConfig, ConfigManager};
pub use health::{DeviceHealth, DeviceHealthTracker, MAX_CONSECUTIVE_FAILURES};
pub use reading::{DeviceReading, Quality, ReadingProcessor};
pub use service::{CollectorService, ServiceStatus};
