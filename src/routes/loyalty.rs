use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};

use crate::{
    dto::loyalty::{LoyaltySummary, TransactionList},
    error::AppResult,
    middleware::auth::AuthUser,
    response::{ApiResponse, Meta},
    routes::params::Pagination,
    services::loyalty_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_balance))
        .route("/transactions", get(list_transactions))
}

#[utoipa::path(
    get,
    path = "/api/loyalty",
    responses(
        (status = 200, description = "Current points balance", body = ApiResponse<LoyaltySummary>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "Loyalty"
)]
pub async fn get_balance(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<ApiResponse<LoyaltySummary>>> {
    let balance = loyalty_service::balance(&state, user.user_id).await?;
    let data = LoyaltySummary {
        user_id: user.user_id,
        balance,
    };
    Ok(Json(ApiResponse::success("OK", data, Some(Meta::empty()))))
}

#[utoipa::path(
    get,
    path = "/api/loyalty/transactions",
    params(Pagination),
    responses(
        (status = 200, description = "Ledger entries, newest first", body = ApiResponse<TransactionList>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "Loyalty"
)]
pub async fn list_transactions(
    State(state): State<AppState>,
    user: AuthUser,
    Query(pagination): Query<Pagination>,
) -> AppResult<Json<ApiResponse<TransactionList>>> {
    let (page, limit, offset) = pagination.normalize();
    let (items, total) = loyalty_service::history(&state, user.user_id, offset, limit).await?;

    let meta = Meta::new(page, limit, total);
    Ok(Json(ApiResponse::success(
        "OK",
        TransactionList { items },
        Some(meta),
    )))
}
