use thiserror::Error;

use crate::services::promo_service::PromoRejection;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("version conflict: stored version is {current}")]
    VersionConflict { current: i64 },

    #[error("state changed concurrently")]
    StateConflict,

    #[error("promo code exhausted: {0}")]
    PromoExhausted(PromoRejection),

    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}
