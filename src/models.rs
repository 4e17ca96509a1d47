use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Enums persisted as lower-case text columns.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    Delivery,
    Takeaway,
    DineIn,
}

text_enum!(DeliveryMethod {
    Delivery => "delivery",
    Takeaway => "takeaway",
    DineIn => "dine_in",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Online,
}

text_enum!(PaymentMethod {
    Cash => "cash",
    Online => "online",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Accepted,
    Preparing,
    Serving,
    OutForDelivery,
    Delivered,
    Cancelled,
}

text_enum!(OrderStatus {
    Pending => "pending",
    Accepted => "accepted",
    Preparing => "preparing",
    Serving => "serving",
    OutForDelivery => "out_for_delivery",
    Delivered => "delivered",
    Cancelled => "cancelled",
});

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// `serving` only exists for dine-in orders and `out_for_delivery` only
    /// for delivery orders; the other methods skip straight to `delivered`.
    pub fn can_transition_to(&self, next: OrderStatus, method: DeliveryMethod) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Accepted) => true,
            (Pending | Accepted, Cancelled) => true,
            (Accepted, Preparing) => true,
            (Preparing, Serving) => method == DeliveryMethod::DineIn,
            (Preparing, OutForDelivery) => method == DeliveryMethod::Delivery,
            (Preparing, Delivered) => method != DeliveryMethod::Delivery,
            (Serving, Delivered) => method == DeliveryMethod::DineIn,
            (OutForDelivery, Delivered) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

text_enum!(PaymentStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl PaymentStatus {
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending | Processing, Completed) | (Pending | Processing, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
    FreeDelivery,
}

text_enum!(DiscountType {
    Percentage => "percentage",
    Fixed => "fixed",
    FreeDelivery => "free_delivery",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Earned,
    Redeemed,
    Expired,
    Manual,
    Refunded,
}

text_enum!(TransactionType {
    Earned => "earned",
    Redeemed => "redeemed",
    Expired => "expired",
    Manual => "manual",
    Refunded => "refunded",
});

/// What the catalog knows about a menu item at lookup time.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CatalogItem {
    pub item_id: Uuid,
    pub name: String,
    pub unit_price: Decimal,
    pub is_available: bool,
    pub restaurant_id: Uuid,
    pub restaurant_active: bool,
}

impl CatalogItem {
    pub fn is_orderable(&self) -> bool {
        self.is_available && self.restaurant_active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CartLine {
    pub item_id: Uuid,
    pub name: String,
    pub restaurant_id: Uuid,
    pub quantity: u32,
    /// Price captured when the line was added.
    pub unit_price: Decimal,
}

impl CartLine {
    pub fn line_subtotal(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Cart {
    pub session_id: Uuid,
    #[schema(value_type = Object)]
    pub lines: BTreeMap<Uuid, CartLine>,
    pub applied_promo_code_id: Option<Uuid>,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PromoCode {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub minimum_order_amount: Decimal,
    pub max_discount_amount: Option<Decimal>,
    pub usage_limit: Option<i32>,
    pub usage_limit_per_user: Option<i32>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub restaurant_id: Option<Uuid>,
    pub first_time_only: bool,
    pub is_active: bool,
    pub times_used: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PromoCodeUsage {
    pub id: Uuid,
    pub promo_code_id: Uuid,
    pub user_id: Uuid,
    pub order_id: Uuid,
    pub discount_amount: Decimal,
    pub free_delivery_applied: bool,
    pub used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LoyaltyTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Position in the user's ledger, assigned under the user's lock.
    pub seq: i64,
    pub transaction_type: TransactionType,
    pub points: i64,
    pub balance_after: i64,
    pub order_id: Option<Uuid>,
    pub description: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OrderLine {
    pub item_id: Uuid,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub line_subtotal: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub lines: Vec<OrderLine>,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub delivery_charge: Decimal,
    pub free_delivery_applied: bool,
    pub points_used: i64,
    pub points_discount: Decimal,
    pub final_total: Decimal,
    pub promo_code_id: Option<Uuid>,
    pub delivery_method: DeliveryMethod,
    pub payment_method: PaymentMethod,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
