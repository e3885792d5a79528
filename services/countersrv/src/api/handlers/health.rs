//! Liveness and component health endpoints.

use std::collections::HashMap;

use axum::extract::State;
use axum::response::Json;
use chrono::Utc;

use crate::api::dto::{ComponentHealth, DetailedHealth, HealthStatus, SuccessResponse};
use crate::api::routes::AppState;

/// Basic liveness. Never touches the database.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is alive", body = HealthStatus)),
    tag = "countersrv"
)]
pub async fn health(State(state): State<AppState>) -> Json<SuccessResponse<HealthStatus>> {
    let status = state.service.status().await;

    Json(SuccessResponse::new(HealthStatus {
        status: if status.running { "healthy" } else { "stopped" }.to_string(),
        service: state.service.config().service.name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        running: status.running,
        uptime_seconds: status.uptime_seconds,
        timestamp: Utc::now(),
        modbus_devices: status.modbus_devices,
        connected_devices: status.connected_devices,
        devices: status.devices,
    }))
}

/// Component-level health: database reachability, MQTT, writer, DLQ.
#[utoipa::path(
    get,
    path = "/health/detailed",
    responses((status = 200, description = "Component health", body = DetailedHealth)),
    tag = "countersrv"
)]
pub async fn health_detailed(
    State(state): State<AppState>,
) -> Json<SuccessResponse<DetailedHealth>> {
    let mut components = HashMap::new();

    let database = match state.service.sink().test_connection().await {
        Ok(()) => ComponentHealth::healthy(),
        Err(e) => ComponentHealth::unhealthy(e.to_string()),
    };
    components.insert("database".to_string(), database);

    let writer_stats = state.service.writer_stats().await;
    let writer = ComponentHealth {
        healthy: writer_stats.last_error.is_none() || writer_stats.batches_failed == 0,
        message: writer_stats.last_error.clone(),
        details: serde_json::to_value(&writer_stats).ok(),
    };
    components.insert("batch_writer".to_string(), writer);

    if let Some(mqtt_stats) = state.service.mqtt_stats().await {
        let mqtt = ComponentHealth {
            healthy: mqtt_stats.connected,
            message: mqtt_stats.last_error.clone(),
            details: serde_json::to_value(&mqtt_stats).ok(),
        };
        components.insert("mqtt".to_string(), mqtt);
    }

    if let Some(pending) = state.service.dlq_pending() {
        let dlq = if pending == 0 {
            ComponentHealth::healthy()
        } else {
            ComponentHealth::unhealthy(format!("{pending} batch(es) awaiting replay"))
        }
        .with_details(serde_json::json!({ "pending": pending }));
        components.insert("dead_letter_queue".to_string(), dlq);
    }

    let all_healthy = components.values().all(|c| c.healthy);
    Json(SuccessResponse::new(DetailedHealth {
        status: if all_healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: Utc::now(),
        components,
    }))
}
