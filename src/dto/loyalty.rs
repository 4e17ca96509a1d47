use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::LoyaltyTransaction;

#[derive(Debug, Serialize, ToSchema)]
pub struct LoyaltySummary {
    pub user_id: Uuid,
    pub balance: i64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(transparent)]
pub struct TransactionList {
    #[schema(value_type = Vec<LoyaltyTransaction>)]
    pub items: Vec<LoyaltyTransaction>,
}

/// Manual correction by an admin. Negative values debit the balance.
#[derive(Debug, Deserialize, ToSchema)]
pub struct AdjustPointsRequest {
    pub points: i64,
    pub description: String,
}
