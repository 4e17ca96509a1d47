use axum::{Json, Router, extract::State, routing::post};

use crate::{
    dto::promo::{PromoValidation, ValidatePromoRequest},
    error::AppResult,
    middleware::auth::AuthUser,
    response::ApiResponse,
    services::promo_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/validate", post(validate_promo))
}

/// Rejections come back as `valid: false` with a reason rather than an error.
#[utoipa::path(
    post,
    path = "/api/promo-codes/validate",
    request_body = ValidatePromoRequest,
    responses(
        (status = 200, description = "Validation result", body = ApiResponse<PromoValidation>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "Promo Codes"
)]
pub async fn validate_promo(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ValidatePromoRequest>,
) -> AppResult<Json<ApiResponse<PromoValidation>>> {
    let result =
        promo_service::validate_code(&state, user.user_id, &payload.code, payload.order_amount)
            .await?;
    Ok(Json(ApiResponse::success("OK", result, None)))
}
