use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dto::cart::CartView,
    models::{DiscountType, PromoCode},
    services::promo_service::{Discount, PromoRejection},
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct ValidatePromoRequest {
    pub code: String,
    pub order_amount: Decimal,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PromoValidation {
    pub code: String,
    pub valid: bool,
    /// First failing check, when invalid.
    pub reason: Option<PromoRejection>,
    pub discount_amount: Decimal,
    pub free_delivery: bool,
}

impl PromoValidation {
    pub fn accepted(promo: &PromoCode, discount: Discount) -> Self {
        Self {
            code: promo.code.clone(),
            valid: true,
            reason: None,
            discount_amount: discount.amount,
            free_delivery: discount.free_delivery,
        }
    }

    pub fn rejected(code: &str, reason: PromoRejection) -> Self {
        Self {
            code: PromoCode::normalize_code(code),
            valid: false,
            reason: Some(reason),
            discount_amount: Decimal::ZERO,
            free_delivery: false,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AppliedPromo {
    pub cart: CartView,
    pub discount: Discount,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePromoRequest {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    #[serde(default)]
    pub minimum_order_amount: Decimal,
    pub max_discount_amount: Option<Decimal>,
    pub usage_limit: Option<i32>,
    pub usage_limit_per_user: Option<i32>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub restaurant_id: Option<Uuid>,
    #[serde(default)]
    pub first_time_only: bool,
}

impl From<CreatePromoRequest> for PromoCode {
    fn from(payload: CreatePromoRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: PromoCode::normalize_code(&payload.code),
            discount_type: payload.discount_type,
            discount_value: payload.discount_value,
            minimum_order_amount: payload.minimum_order_amount,
            max_discount_amount: payload.max_discount_amount,
            usage_limit: payload.usage_limit,
            usage_limit_per_user: payload.usage_limit_per_user,
            start_date: payload.start_date,
            end_date: payload.end_date,
            restaurant_id: payload.restaurant_id,
            first_time_only: payload.first_time_only,
            is_active: true,
            times_used: 0,
        }
    }
}
