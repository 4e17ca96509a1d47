use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    response::{ApiResponse, Meta},
    services::promo_service::PromoRejection,
    store::StoreError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not Found")]
    NotFound,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Cart changed elsewhere, refresh and retry (cart is at version {current_version}; affected: {})", .items.join(", "))]
    StaleCart {
        current_version: i64,
        items: Vec<String>,
    },

    #[error("Items no longer available and removed from cart: {}", .items.join(", "))]
    ItemUnavailable { items: Vec<String> },

    #[error("Promo code invalid: {0}")]
    PromoInvalid(PromoRejection),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient points: requested {requested}, available {available}")]
    InsufficientPoints { requested: i64, available: i64 },

    #[error("Already recorded for order {order_id}")]
    DuplicateUsage { order_id: Uuid },

    #[error("Could not persist order")]
    Persistence(#[source] StoreError),

    #[error("Database error")]
    DbError(#[from] sqlx::Error),

    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => AppError::NotFound,
            StoreError::VersionConflict { current } => AppError::StaleCart {
                current_version: current,
                items: Vec::new(),
            },
            StoreError::PromoExhausted(reason) => AppError::PromoInvalid(reason),
            StoreError::StateConflict => {
                AppError::Conflict("order changed concurrently, reload and retry".into())
            }
            StoreError::Duplicate(what) => AppError::Conflict(format!("{what} already exists")),
            other => AppError::Persistence(other),
        }
    }
}

#[derive(Serialize)]
struct ErrorData {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    items: Vec<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::StaleCart { .. } => StatusCode::CONFLICT,
            AppError::ItemUnavailable { .. } => StatusCode::CONFLICT,
            AppError::PromoInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InsufficientPoints { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::DuplicateUsage { .. } => StatusCode::OK,
            AppError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::DbError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }

        let items = match &self {
            AppError::StaleCart { items, .. } | AppError::ItemUnavailable { items } => {
                items.clone()
            }
            _ => Vec::new(),
        };

        let body = ApiResponse {
            message: self.to_string(),
            data: Some(ErrorData {
                error: self.to_string(),
                items,
            }),
            meta: Some(Meta::empty()),
            notices: Vec::new(),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
