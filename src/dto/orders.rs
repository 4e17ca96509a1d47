use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{DeliveryMethod, Order, OrderStatus, PaymentMethod};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    pub delivery_method: DeliveryMethod,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub points_to_redeem: i64,
    /// When present, checkout is refused if the cart moved past this version.
    pub cart_version: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckoutReceipt {
    pub order: Order,
    pub points_earned: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Captured,
    Failed,
}

/// Delivered by the payment gateway integration once the signature is verified.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PaymentConfirmation {
    pub order_id: Uuid,
    pub status: PaymentOutcome,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}
