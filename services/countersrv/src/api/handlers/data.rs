//! Latest-reading cache views and aggregate statistics.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::response::Json;

use crate::api::dto::{AppError, DataStats, LatestReadings, OperationResult, SuccessResponse};
use crate::api::routes::AppState;

/// Snapshot of the whole latest-reading cache.
#[utoipa::path(
    get,
    path = "/data/latest",
    responses((status = 200, description = "Cached readings", body = LatestReadings)),
    tag = "countersrv"
)]
pub async fn latest(State(state): State<AppState>) -> Json<SuccessResponse<LatestReadings>> {
    let readings = state.service.cache().all();
    Json(SuccessResponse::new(LatestReadings {
        count: readings.len(),
        readings,
    }))
}

/// Cached readings for one device; 404 when the device is unknown.
#[utoipa::path(
    get,
    path = "/data/latest/{id}",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Cached readings for the device", body = LatestReadings),
        (status = 404, description = "Unknown device")
    ),
    tag = "countersrv"
)]
pub async fn latest_for_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<SuccessResponse<LatestReadings>>, AppError> {
    let readings = state.service.cache().for_device(&device_id);
    if readings.is_empty() && state.service.health().get(&device_id).is_none() {
        return Err(AppError::not_found(format!("unknown device: {device_id}")));
    }
    Ok(Json(SuccessResponse::new(LatestReadings {
        count: readings.len(),
        readings,
    })))
}

/// Aggregate counts, quality distribution and average rate.
#[utoipa::path(
    get,
    path = "/data/stats",
    responses((status = 200, description = "Aggregate statistics", body = DataStats)),
    tag = "countersrv"
)]
pub async fn stats(State(state): State<AppState>) -> Json<SuccessResponse<DataStats>> {
    let cached = state.service.cache().all();

    let mut quality_distribution: HashMap<String, u64> = HashMap::new();
    for reading in &cached {
        *quality_distribution
            .entry(reading.quality.as_str().to_string())
            .or_insert(0) += 1;
    }

    let rates: Vec<f64> = cached.iter().filter_map(|r| r.rate).collect();
    let average_rate = if rates.is_empty() {
        None
    } else {
        Some(rates.iter().sum::<f64>() / rates.len() as f64)
    };

    Json(SuccessResponse::new(DataStats {
        cached_readings: cached.len(),
        quality_distribution,
        average_rate,
        writer: state.service.writer_stats().await,
    }))
}

/// Flush the latest-reading cache. Storage is untouched.
#[utoipa::path(
    delete,
    path = "/data/cache",
    responses((status = 200, description = "Cache flushed", body = OperationResult)),
    tag = "countersrv"
)]
pub async fn flush_cache(State(state): State<AppState>) -> Json<SuccessResponse<OperationResult>> {
    let flushed = state.service.cache().len();
    state.service.cache().clear();
    Json(SuccessResponse::new(OperationResult {
        operation: "flush_cache".to_string(),
        target: format!("{flushed} reading(s)"),
        completed: true,
    }))
}
