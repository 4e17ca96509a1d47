use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, patch, post},
};
use uuid::Uuid;

use crate::{
    dto::orders::{CheckoutReceipt, CheckoutRequest, UpdateOrderStatusRequest},
    error::AppResult,
    middleware::{auth::AuthUser, session::SessionId},
    models::Order,
    response::{ApiResponse, Meta},
    services::checkout_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(checkout))
        .route("/{id}", get(get_order))
        .route("/{id}/payment", post(start_payment))
        .route("/{id}/status", patch(update_order_status))
}

#[utoipa::path(
    post,
    path = "/api/orders/checkout",
    params(("x-session-id" = Uuid, Header, description = "Cart session")),
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Order placed", body = ApiResponse<CheckoutReceipt>),
        (status = 400, description = "Empty cart or invalid request"),
        (status = 409, description = "Stale cart or unavailable items"),
        (status = 422, description = "Applied promo code is no longer valid"),
    ),
    tag = "Orders"
)]
pub async fn checkout(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    user: Option<AuthUser>,
    Json(payload): Json<CheckoutRequest>,
) -> AppResult<Json<ApiResponse<CheckoutReceipt>>> {
    let user_id = user.map(|u| u.user_id);
    let (receipt, notices) =
        checkout_service::checkout(&state, session_id, user_id, payload).await?;
    Ok(Json(
        ApiResponse::success("Checkout success", receipt, Some(Meta::empty()))
            .with_notices(notices),
    ))
}

#[utoipa::path(
    get,
    path = "/api/orders/{id}",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order detail", body = ApiResponse<Order>),
        (status = 404, description = "Order not found"),
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Order>>> {
    let order = checkout_service::get_order(&state, user.as_ref(), id).await?;
    Ok(Json(ApiResponse::success("OK", order, Some(Meta::empty()))))
}

#[utoipa::path(
    post,
    path = "/api/orders/{id}/payment",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Payment is being processed", body = ApiResponse<Order>),
        (status = 400, description = "Order is not paid online"),
        (status = 404, description = "Order not found"),
    ),
    tag = "Orders"
)]
pub async fn start_payment(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Order>>> {
    let order = checkout_service::start_payment(&state, user.as_ref(), id).await?;
    Ok(Json(ApiResponse::success("Payment started", order, None)))
}

#[utoipa::path(
    patch,
    path = "/api/orders/{id}/status",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<Order>),
        (status = 400, description = "Transition not allowed"),
        (status = 403, description = "Forbidden"),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateOrderStatusRequest>,
) -> AppResult<Json<ApiResponse<Order>>> {
    let order = checkout_service::advance_status(&state, &user, id, payload.status).await?;
    Ok(Json(ApiResponse::success("Order status updated", order, None)))
}
