//! Per-device health and operational actions.

use axum::extract::{Path, State};
use axum::response::Json;

use crate::api::dto::{AppError, OperationResult, SuccessResponse};
use crate::api::routes::AppState;
use crate::core::health::DeviceHealth;

/// Health for every known device.
#[utoipa::path(
    get,
    path = "/devices",
    responses((status = 200, description = "All device health", body = [DeviceHealth])),
    tag = "countersrv"
)]
pub async fn list_devices(
    State(state): State<AppState>,
) -> Json<SuccessResponse<Vec<DeviceHealth>>> {
    Json(SuccessResponse::new(state.service.health().snapshot()))
}

/// Health for one device; 404 on unknown id.
#[utoipa::path(
    get,
    path = "/devices/{id}",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Device health", body = DeviceHealth),
        (status = 404, description = "Unknown device")
    ),
    tag = "countersrv"
)]
pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<SuccessResponse<DeviceHealth>>, AppError> {
    state
        .service
        .health()
        .get(&device_id)
        .map(|health| Json(SuccessResponse::new(health)))
        .ok_or_else(|| AppError::not_found(format!("unknown device: {device_id}")))
}

/// Restart a device's poll task and session.
#[utoipa::path(
    post,
    path = "/devices/{id}/restart",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Device restarted", body = OperationResult),
        (status = 404, description = "Unknown device"),
        (status = 500, description = "Restart failed")
    ),
    tag = "countersrv"
)]
pub async fn restart_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<SuccessResponse<OperationResult>>, AppError> {
    if !state.service.restart_device(&device_id).await {
        return Err(AppError::not_found(format!("unknown device: {device_id}")));
    }
    Ok(Json(SuccessResponse::new(OperationResult {
        operation: "restart".to_string(),
        target: device_id,
        completed: true,
    })))
}
