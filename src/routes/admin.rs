use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use chrono::Utc;
use uuid::Uuid;

use crate::{
    audit::audit_or_warn,
    dto::{loyalty::AdjustPointsRequest, promo::CreatePromoRequest},
    error::AppResult,
    middleware::auth::{AuthUser, ensure_admin},
    models::{LoyaltyTransaction, PromoCode},
    response::{ApiResponse, Meta},
    services::{
        loyalty_service::{self, ExpiryReport},
        promo_service,
    },
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/promo-codes", post(create_promo_code))
        .route("/loyalty/expire", post(expire_points))
        .route("/loyalty/{user_id}/adjust", post(adjust_points))
}

#[utoipa::path(
    post,
    path = "/api/admin/promo-codes",
    request_body = CreatePromoRequest,
    responses(
        (status = 200, description = "Promo code created", body = ApiResponse<PromoCode>),
        (status = 400, description = "Invalid definition"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "Code already exists"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn create_promo_code(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreatePromoRequest>,
) -> AppResult<Json<ApiResponse<PromoCode>>> {
    ensure_admin(&user)?;
    let promo = promo_service::create(&state, payload).await?;
    audit_or_warn(
        &state,
        Some(user.user_id),
        "promo_create",
        "promo_codes",
        serde_json::json!({ "promo_code_id": promo.id, "code": promo.code }),
    )
    .await;
    Ok(Json(ApiResponse::success("Promo code created", promo, Some(Meta::empty()))))
}

#[utoipa::path(
    post,
    path = "/api/admin/loyalty/{user_id}/adjust",
    params(("user_id" = Uuid, Path, description = "User ID")),
    request_body = AdjustPointsRequest,
    responses(
        (status = 200, description = "Manual ledger entry written", body = ApiResponse<LoyaltyTransaction>),
        (status = 403, description = "Forbidden"),
        (status = 422, description = "Adjustment would overdraw the balance"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn adjust_points(
    State(state): State<AppState>,
    user: AuthUser,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<AdjustPointsRequest>,
) -> AppResult<Json<ApiResponse<LoyaltyTransaction>>> {
    ensure_admin(&user)?;
    let entry =
        loyalty_service::adjust(&state, user_id, payload.points, &payload.description).await?;
    audit_or_warn(
        &state,
        Some(user.user_id),
        "loyalty_adjust",
        "loyalty_transactions",
        serde_json::json!({ "user_id": user_id, "points": payload.points }),
    )
    .await;
    Ok(Json(ApiResponse::success("Points adjusted", entry, None)))
}

/// Same run as the `expire-points` binary, for ad-hoc use.
#[utoipa::path(
    post,
    path = "/api/admin/loyalty/expire",
    responses(
        (status = 200, description = "Expiry run finished", body = ApiResponse<ExpiryReport>),
        (status = 403, description = "Forbidden"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn expire_points(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<ApiResponse<ExpiryReport>>> {
    ensure_admin(&user)?;
    let report = loyalty_service::expire(&state, Utc::now()).await?;
    Ok(Json(ApiResponse::success("Expiry finished", report, None)))
}
