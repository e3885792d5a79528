//! Service-wide error handling.
//!
//! One error enumeration covers every failure kind the service can hit:
//! configuration problems (fatal at startup), transient I/O (retried with
//! backoff at the owning layer), storage exhaustion (spilled to the
//! dead-letter queue), and decode failures (counted and dropped). Variants
//! carry rendered messages so errors stay `Clone` across retry bookkeeping.

use thiserror::Error;

/// Error type for all collection-service operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CounterSrvError {
    /// Invalid topology or missing required fields. Fatal at startup.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// TCP connect/session failures, broker loss, refused sockets.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// An operation exceeded its configured deadline.
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Modbus protocol violations and device exception responses.
    #[error("Modbus error: {0}")]
    ModbusError(String),

    /// MQTT client and subscription failures.
    #[error("MQTT error: {0}")]
    MqttError(String),

    /// Malformed payload, missing JSON path, wrong binary length.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Storage sink failures (transient or terminal after retries).
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Dead-letter queue spool or replay failures.
    #[error("Dead letter queue error: {0}")]
    DlqError(String),

    /// File system and socket I/O outside a more specific category.
    #[error("IO error: {0}")]
    IoError(String),

    /// Internal channel closed or a component used after shutdown.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// Result alias used throughout the service.
pub type Result<T> = std::result::Result<T, CounterSrvError>;

impl From<std::io::Error> for CounterSrvError {
    fn from(err: std::io::Error) -> Self {
        CounterSrvError::IoError(err.to_string())
    }
}

impl From<figment::Error> for CounterSrvError {
    fn from(err: figment::Error) -> Self {
        CounterSrvError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for CounterSrvError {
    fn from(err: serde_json::Error) -> Self {
        CounterSrvError::DecodeError(err.to_string())
    }
}

impl From<sqlx::Error> for CounterSrvError {
    fn from(err: sqlx::Error) -> Self {
        CounterSrvError::StorageError(err.to_string())
    }
}

impl From<rumqttc::ClientError> for CounterSrvError {
    fn from(err: rumqttc::ClientError) -> Self {
        CounterSrvError::MqttError(err.to_string())
    }
}
