//! Safe configuration view.

use axum::extract::State;
use axum::response::Json;

use crate::api::dto::{SafeConfigView, SuccessResponse};
use crate::api::routes::AppState;

/// Operational knobs without credentials.
#[utoipa::path(
    get,
    path = "/config",
    responses((status = 200, description = "Safe configuration view", body = SafeConfigView)),
    tag = "countersrv"
)]
pub async fn get_config(State(state): State<AppState>) -> Json<SuccessResponse<SafeConfigView>> {
    Json(SuccessResponse::new(SafeConfigView::from_config(
        state.service.config(),
    )))
}
