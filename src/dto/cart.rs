use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::models::{Cart, CartLine};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Set the line quantity to the given value.
    Replace,
    /// Add the given value to the current quantity.
    #[default]
    Increment,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddToCartRequest {
    pub item_id: Uuid,
    pub quantity: i64,
    #[serde(default)]
    pub mode: UpdateMode,
    /// Cart version the client last saw.
    pub version: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ApplyPromoRequest {
    pub code: String,
    pub version: i64,
}

#[derive(Debug, Deserialize, ToSchema, IntoParams)]
pub struct CartVersionQuery {
    pub version: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CartView {
    pub session_id: Uuid,
    pub version: i64,
    pub lines: Vec<CartLine>,
    pub applied_promo_code_id: Option<Uuid>,
    pub subtotal: Decimal,
}

impl From<Cart> for CartView {
    fn from(cart: Cart) -> Self {
        let subtotal = cart.subtotal();
        Self {
            session_id: cart.session_id,
            version: cart.version,
            applied_promo_code_id: cart.applied_promo_code_id,
            lines: cart.lines.into_values().collect(),
            subtotal,
        }
    }
}
