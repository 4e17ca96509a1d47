use axum::{Json, extract::State};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    response::{ApiResponse, Meta},
    state::AppState,
};

#[derive(Serialize, ToSchema)]
pub struct HealthData {
    pub status: String,
    /// `postgres`, `memory`, or `postgres (unreachable)`.
    pub storage: String,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "OK", body = ApiResponse<HealthData>),
    ),
    tag = "Health"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthData>> {
    let (status, storage) = match state.pool.as_ref() {
        None => ("ok", "memory"),
        Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => ("ok", "postgres"),
            Err(err) => {
                tracing::warn!(error = %err, "health check could not reach the database");
                ("degraded", "postgres (unreachable)")
            }
        },
    };

    let data = HealthData {
        status: status.to_string(),
        storage: storage.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    Json(ApiResponse::success(
        "Health check",
        data,
        Some(Meta::empty()),
    ))
}
