//! Router assembly and shared handler state.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use super::auth::{require_auth, Authenticator};
use super::handlers::{config, data, devices, health};
use crate::core::service::CollectorService;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CollectorService>,
    pub auth: Authenticator,
}

impl AppState {
    pub fn new(service: Arc<CollectorService>) -> Self {
        let auth = Authenticator::from_config(&service.config().api);
        Self { service, auth }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::health_detailed,
        devices::list_devices,
        devices::get_device,
        devices::restart_device,
        data::latest,
        data::latest_for_device,
        data::stats,
        data::flush_cache,
        config::get_config,
    ),
    components(schemas(
        crate::api::dto::HealthStatus,
        crate::api::dto::DetailedHealth,
        crate::api::dto::ComponentHealth,
        crate::api::dto::LatestReadings,
        crate::api::dto::DataStats,
        crate::api::dto::SafeConfigView,
        crate::api::dto::OperationResult,
        crate::api::dto::ErrorResponse,
        crate::api::dto::ErrorInfo,
        crate::core::health::DeviceHealth,
        crate::core::reading::DeviceReading,
        crate::core::reading::Quality,
        crate::core::storage::BatchWriterStats,
        crate::core::mqtt::MqttIngestStats,
    )),
    tags((name = "countersrv", description = "Counter collection service API"))
)]
pub struct ApiDoc;

/// Build the service router. `/health` and the OpenAPI document stay open
/// for probes; everything else goes through the authenticator.
pub fn create_router(state: AppState) -> Router {
    let open = Router::new()
        .route("/health", get(health::health))
        .route(
            "/api-docs/openapi.json",
            get(|| async { axum::Json(ApiDoc::openapi()) }),
        );

    let guarded = Router::new()
        .route("/health/detailed", get(health::health_detailed))
        .route("/devices", get(devices::list_devices))
        .route("/devices/{id}", get(devices::get_device))
        .route("/devices/{id}/restart", post(devices::restart_device))
        .route("/data/latest", get(data::latest))
        .route("/data/latest/{id}", get(data::latest_for_device))
        .route("/data/stats", get(data::stats))
        .route("/data/cache", delete(data::flush_cache))
        .route("/config", get(config::get_config))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("x-api-key"),
        ])
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ]);

    open.merge(guarded)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
