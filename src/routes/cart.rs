use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{delete, get, post},
};
use uuid::Uuid;

use crate::{
    dto::{
        cart::{AddToCartRequest, ApplyPromoRequest, CartVersionQuery, CartView},
        promo::AppliedPromo,
    },
    error::AppResult,
    middleware::{auth::AuthUser, session::SessionId},
    response::{ApiResponse, Meta},
    services::{cart_service, promo_service},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart).delete(clear_cart))
        .route("/items", post(add_to_cart))
        .route("/items/{item_id}", delete(remove_from_cart))
        .route("/promo", post(apply_promo).delete(remove_promo))
}

#[utoipa::path(
    get,
    path = "/api/cart",
    params(("x-session-id" = Uuid, Header, description = "Cart session")),
    responses(
        (status = 200, description = "Current cart for the session", body = ApiResponse<CartView>)
    ),
    tag = "Cart"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
) -> AppResult<Json<ApiResponse<CartView>>> {
    let cart = cart_service::get_cart(&state, session_id).await?;
    Ok(Json(ApiResponse::success("OK", cart.into(), Some(Meta::empty()))))
}

#[utoipa::path(
    post,
    path = "/api/cart/items",
    params(("x-session-id" = Uuid, Header, description = "Cart session")),
    request_body = AddToCartRequest,
    responses(
        (status = 200, description = "Add or update a cart line", body = ApiResponse<CartView>),
        (status = 400, description = "Invalid quantity or unknown item"),
        (status = 409, description = "Stale cart version or unavailable item"),
    ),
    tag = "Cart"
)]
pub async fn add_to_cart(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    user: Option<AuthUser>,
    Json(payload): Json<AddToCartRequest>,
) -> AppResult<Json<ApiResponse<CartView>>> {
    let user_id = user.map(|u| u.user_id);
    let cart = cart_service::add_item(&state, session_id, user_id, payload).await?;
    Ok(Json(ApiResponse::success("Cart updated", cart.into(), None)))
}

#[utoipa::path(
    delete,
    path = "/api/cart/items/{item_id}",
    params(
        ("x-session-id" = Uuid, Header, description = "Cart session"),
        ("item_id" = Uuid, Path, description = "Menu item ID"),
        CartVersionQuery
    ),
    responses(
        (status = 200, description = "Line removed", body = ApiResponse<CartView>),
        (status = 409, description = "Stale cart version"),
    ),
    tag = "Cart"
)]
pub async fn remove_from_cart(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    user: Option<AuthUser>,
    Path(item_id): Path<Uuid>,
    Query(query): Query<CartVersionQuery>,
) -> AppResult<Json<ApiResponse<CartView>>> {
    let user_id = user.map(|u| u.user_id);
    let cart =
        cart_service::remove_item(&state, session_id, user_id, item_id, query.version).await?;
    Ok(Json(ApiResponse::success("Removed from cart", cart.into(), None)))
}

#[utoipa::path(
    delete,
    path = "/api/cart",
    params(("x-session-id" = Uuid, Header, description = "Cart session"), CartVersionQuery),
    responses(
        (status = 200, description = "Cart emptied", body = ApiResponse<CartView>),
        (status = 409, description = "Stale cart version"),
    ),
    tag = "Cart"
)]
pub async fn clear_cart(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    Query(query): Query<CartVersionQuery>,
) -> AppResult<Json<ApiResponse<CartView>>> {
    let cart = cart_service::clear_cart(&state, session_id, query.version).await?;
    Ok(Json(ApiResponse::success("Cart cleared", cart.into(), None)))
}

#[utoipa::path(
    post,
    path = "/api/cart/promo",
    params(("x-session-id" = Uuid, Header, description = "Cart session")),
    request_body = ApplyPromoRequest,
    responses(
        (status = 200, description = "Promo code attached", body = ApiResponse<AppliedPromo>),
        (status = 400, description = "Guest session or empty cart"),
        (status = 422, description = "Promo code rejected"),
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn apply_promo(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    user: Option<AuthUser>,
    Json(payload): Json<ApplyPromoRequest>,
) -> AppResult<Json<ApiResponse<AppliedPromo>>> {
    let user_id = user.map(|u| u.user_id);
    let (cart, discount) =
        promo_service::apply_to_cart(&state, session_id, user_id, payload).await?;
    let data = AppliedPromo {
        cart: cart.into(),
        discount,
    };
    Ok(Json(ApiResponse::success("Promo code applied", data, None)))
}

#[utoipa::path(
    delete,
    path = "/api/cart/promo",
    params(("x-session-id" = Uuid, Header, description = "Cart session"), CartVersionQuery),
    responses(
        (status = 200, description = "Promo code detached", body = ApiResponse<CartView>),
        (status = 409, description = "Stale cart version"),
    ),
    tag = "Cart"
)]
pub async fn remove_promo(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    Query(query): Query<CartVersionQuery>,
) -> AppResult<Json<ApiResponse<CartView>>> {
    let cart = promo_service::detach_from_cart(&state, session_id, query.version).await?;
    Ok(Json(ApiResponse::success("Promo code removed", cart.into(), None)))
}
