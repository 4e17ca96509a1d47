//! Storage ports for the order-composition core.
//!
//! Each collaborator the core talks to is an async trait here, with an
//! in-memory implementation for tests and local runs and a Postgres one
//! built on sea-orm.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Cart, CatalogItem, LoyaltyTransaction, Order, OrderStatus, PaymentStatus, PromoCode,
    PromoCodeUsage, TransactionType,
};

mod error;
pub mod memory;
pub mod postgres;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Menu lookup. Catalog storage itself lives outside this service.
#[async_trait]
pub trait CatalogAdapter: Send + Sync {
    async fn lookup(&self, item_id: Uuid) -> Result<Option<CatalogItem>, StoreError>;
}

/// Session-scoped carts.
#[async_trait]
pub trait CartStore: Send + Sync {
    /// Returns an empty cart at version 0 when the session has none yet.
    async fn load(&self, session_id: Uuid) -> Result<Cart, StoreError>;

    /// Compare-and-swap write: succeeds only while the stored version still
    /// equals `expected_version`.
    async fn save(&self, cart: &Cart, expected_version: i64) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome {
    Recorded,
    Duplicate,
}

#[async_trait]
pub trait PromoStore: Send + Sync {
    /// `code` must already be normalized.
    async fn find_by_code(&self, code: &str) -> Result<Option<PromoCode>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PromoCode>, StoreError>;

    async fn usage_count(&self, promo_code_id: Uuid, user_id: Uuid) -> Result<i64, StoreError>;

    /// Inserts the usage row and bumps `times_used` in place. Limits are
    /// re-checked under the promo row lock.
    async fn record_usage(&self, usage: &PromoCodeUsage) -> Result<UsageOutcome, StoreError>;

    async fn insert(&self, promo: &PromoCode) -> Result<(), StoreError>;
}

/// A ledger write request. The store serializes these per user and asks
/// [`crate::services::loyalty_service::decide`] what to write.
#[derive(Debug, Clone)]
pub struct LedgerAppend {
    pub user_id: Uuid,
    pub movement: crate::services::loyalty_service::Movement,
    pub order_id: Option<Uuid>,
    pub description: String,
    /// Earned entries this append offsets (expiry only).
    pub consumes: Vec<Uuid>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Written(LoyaltyTransaction),
    /// The same movement was already written for this order.
    Duplicate(LoyaltyTransaction),
    Shortfall { available: i64 },
    /// Nothing left to write, e.g. every grant was already expired.
    Skipped,
}

#[async_trait]
pub trait LoyaltyStore: Send + Sync {
    async fn balance(&self, user_id: Uuid) -> Result<i64, StoreError>;

    /// One page of the user's entries, newest first, with the total count.
    async fn history(
        &self,
        user_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<LoyaltyTransaction>, u64), StoreError>;

    async fn find_for_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        kind: TransactionType,
    ) -> Result<Option<LoyaltyTransaction>, StoreError>;

    /// `earned` entries with `expires_at <= now` not yet offset by an expiry.
    async fn expiring(&self, now: DateTime<Utc>) -> Result<Vec<LoyaltyTransaction>, StoreError>;

    /// Runs under an exclusive per-user lock.
    async fn append(&self, request: LedgerAppend) -> Result<AppendOutcome, StoreError>;
}

#[async_trait]
pub trait OrderSink: Send + Sync {
    /// Writes the order, its lines and the promo usage (if any) as one unit.
    async fn save_order(
        &self,
        order: &Order,
        usage: Option<&PromoCodeUsage>,
    ) -> Result<Uuid, StoreError>;

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn has_orders(&self, user_id: Uuid) -> Result<bool, StoreError>;

    /// Moves the order only if it is still in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: (OrderStatus, PaymentStatus),
        to: (OrderStatus, PaymentStatus),
    ) -> Result<Order, StoreError>;
}
