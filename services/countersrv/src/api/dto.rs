//! API request/response envelopes and view models.
//!
//! Every endpoint answers with `SuccessResponse<T>` or `ErrorResponse`;
//! `AppError` carries the HTTP status and implements `IntoResponse` so
//! handlers can use `?` freely.

use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core::config::AppConfig;
use crate::core::health::DeviceHealth;
use crate::core::reading::DeviceReading;
use crate::core::storage::BatchWriterStats;

/// Standard success envelope.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SuccessResponse<T> {
    /// Always true.
    pub success: bool,
    pub data: T,
}

impl<T> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Error payload carried by `ErrorResponse`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorInfo {
    pub message: String,
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code,
            details: None,
        }
    }
}

/// Standard error envelope.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Always false.
    pub success: bool,
    pub error: ErrorInfo,
}

/// HTTP error with status code; converts straight into a response.
#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub error: ErrorInfo,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ErrorInfo::new(message, 400),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: ErrorInfo::new(message, 401),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ErrorInfo::new(message, 404),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: ErrorInfo::new(message, 500),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.error.details = Some(details.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                success: false,
                error: self.error,
            }),
        )
            .into_response()
    }
}

/// `GET /health` payload. Never touches the database.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub version: String,
    pub running: bool,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
    pub modbus_devices: usize,
    pub connected_devices: usize,
    pub devices: Vec<DeviceHealth>,
}

/// One component inside the detailed health view.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ComponentHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
            details: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// `GET /health/detailed` payload: everything wrapped in `components`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DetailedHealth {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub components: HashMap<String, ComponentHealth>,
}

/// `GET /data/latest` payload.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LatestReadings {
    pub count: usize,
    pub readings: Vec<DeviceReading>,
}

/// `GET /data/stats` payload.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DataStats {
    pub cached_readings: usize,
    /// Reading count per quality tag across the cache.
    pub quality_distribution: HashMap<String, u64>,
    /// Mean of the rates currently present in the cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_rate: Option<f64>,
    pub writer: BatchWriterStats,
}

/// Credential-free configuration view for `GET /config`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SafeConfigView {
    pub service_name: String,
    pub database_host: String,
    pub database_port: u16,
    pub database_name: String,
    pub table_name: String,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub queue_capacity: usize,
    pub dlq_enabled: bool,
    pub modbus_device_count: usize,
    pub mqtt_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_broker: Option<String>,
    pub rate_window_secs: u64,
}

impl SafeConfigView {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            service_name: config.service.name.clone(),
            database_host: config.timescale.host.clone(),
            database_port: config.timescale.port,
            database_name: config.timescale.database.clone(),
            table_name: config.timescale.table_name.clone(),
            batch_size: config.timescale.batch_size,
            batch_timeout_ms: config.timescale.batch_timeout_ms,
            queue_capacity: config.timescale.queue_capacity,
            dlq_enabled: config.timescale.dlq_enabled,
            modbus_device_count: config.modbus_devices.len(),
            mqtt_configured: config.mqtt.is_some(),
            mqtt_broker: config.mqtt.as_ref().map(|m| {
                format!("{}:{}", m.settings.broker_host, m.settings.broker_port)
            }),
            rate_window_secs: config.processing.rate_window_secs,
        }
    }
}

/// Result body for mutating operations (restart, cache flush).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OperationResult {
    pub operation: String,
    pub target: String,
    pub completed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_shape() {
        let body = serde_json::to_value(SuccessResponse::new(41)).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], 41);
    }

    #[test]
    fn test_error_envelope_omits_empty_details() {
        let err = AppError::not_found("no such device");
        let body = serde_json::to_value(ErrorResponse {
            success: false,
            error: err.error,
        })
        .unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], 404);
        assert!(body["error"].get("details").is_none());
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(AppError::bad_request("x").status, StatusCode::BAD_REQUEST);
        assert_eq!(AppError::unauthorized("x").status, StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::not_found("x").status, StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::internal_error("x").status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_safe_config_view_has_no_credentials() {
        // The view is a fixed allow-list of fields; make sure serialization
        // never grows a password-looking key.
        let view = SafeConfigView {
            service_name: "countersrv".to_string(),
            database_host: "db".to_string(),
            database_port: 5432,
            database_name: "counters".to_string(),
            table_name: "counter_data".to_string(),
            batch_size: 50,
            batch_timeout_ms: 5_000,
            queue_capacity: 10_000,
            dlq_enabled: true,
            modbus_device_count: 1,
            mqtt_configured: false,
            mqtt_broker: None,
            rate_window_secs: 60,
        };
        let body = serde_json::to_string(&view).unwrap();
        assert!(!body.contains("password"));
        assert!(!body.contains("secret"));
        assert!(!body.contains("api_key"));
    }
}
