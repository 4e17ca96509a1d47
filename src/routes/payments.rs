use axum::{Json, Router, extract::State, routing::post};

use crate::{
    dto::orders::PaymentConfirmation,
    error::AppResult,
    models::Order,
    response::ApiResponse,
    services::checkout_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/confirm", post(confirm_payment))
}

/// Called by the payment gateway integration. Redeliveries are harmless.
#[utoipa::path(
    post,
    path = "/api/payments/confirm",
    request_body = PaymentConfirmation,
    responses(
        (status = 200, description = "Confirmation applied", body = ApiResponse<Order>),
        (status = 404, description = "Order not found"),
        (status = 409, description = "Payment already settled the other way"),
    ),
    tag = "Payments"
)]
pub async fn confirm_payment(
    State(state): State<AppState>,
    Json(event): Json<PaymentConfirmation>,
) -> AppResult<Json<ApiResponse<Order>>> {
    let order = checkout_service::confirm_payment(&state, event).await?;
    Ok(Json(ApiResponse::success("Payment confirmation applied", order, None)))
}
