//! In-memory store.
//!
//! Used by tests and local runs without a database. A single async mutex
//! guards all state, which also makes every ledger append exclusive per user.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    models::{
        Cart, CatalogItem, LoyaltyTransaction, Order, OrderStatus, PaymentStatus, PromoCode,
        PromoCodeUsage, TransactionType,
    },
    services::{
        loyalty_service::{self, LedgerHead},
        promo_service,
    },
    store::{
        AppendOutcome, CartStore, CatalogAdapter, LedgerAppend, LoyaltyStore, OrderSink,
        PromoStore, StoreError, UsageOutcome,
    },
};

#[derive(Debug, Default)]
struct MemoryState {
    catalog: HashMap<Uuid, CatalogItem>,
    carts: HashMap<Uuid, Cart>,
    promos: HashMap<Uuid, PromoCode>,
    usages: Vec<PromoCodeUsage>,
    ledger: Vec<LoyaltyTransaction>,
    balances: HashMap<Uuid, i64>,
    expired_grants: HashSet<Uuid>,
    orders: HashMap<Uuid, Order>,
}

impl MemoryState {
    fn admit_usage(&mut self, usage: &PromoCodeUsage) -> Result<UsageOutcome, StoreError> {
        if self
            .usages
            .iter()
            .any(|u| u.user_id == usage.user_id && u.order_id == usage.order_id)
        {
            return Ok(UsageOutcome::Duplicate);
        }

        let user_count = self
            .usages
            .iter()
            .filter(|u| u.promo_code_id == usage.promo_code_id && u.user_id == usage.user_id)
            .count() as i64;
        let promo = self
            .promos
            .get_mut(&usage.promo_code_id)
            .ok_or(StoreError::NotFound)?;
        promo_service::check_usage_limits(promo, user_count).map_err(StoreError::PromoExhausted)?;

        promo.times_used += 1;
        self.usages.push(usage.clone());
        Ok(UsageOutcome::Recorded)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_order_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_item(&self, item: CatalogItem) {
        self.state.lock().await.catalog.insert(item.item_id, item);
    }

    pub async fn put_promo(&self, promo: PromoCode) {
        self.state.lock().await.promos.insert(promo.id, promo);
    }

    /// Makes `save_order` fail until switched off again.
    pub fn fail_order_writes(&self, fail: bool) {
        self.fail_order_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn usages(&self) -> Vec<PromoCodeUsage> {
        self.state.lock().await.usages.clone()
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }
}

#[async_trait]
impl CatalogAdapter for MemoryStore {
    async fn lookup(&self, item_id: Uuid) -> Result<Option<CatalogItem>, StoreError> {
        Ok(self.state.lock().await.catalog.get(&item_id).cloned())
    }
}

#[async_trait]
impl CartStore for MemoryStore {
    async fn load(&self, session_id: Uuid) -> Result<Cart, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .carts
            .get(&session_id)
            .cloned()
            .unwrap_or_else(|| Cart::new(session_id)))
    }

    async fn save(&self, cart: &Cart, expected_version: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let current = state
            .carts
            .get(&cart.session_id)
            .map(|stored| stored.version)
            .unwrap_or(0);
        if current != expected_version {
            return Err(StoreError::VersionConflict { current });
        }
        state.carts.insert(cart.session_id, cart.clone());
        Ok(())
    }
}

#[async_trait]
impl PromoStore for MemoryStore {
    async fn find_by_code(&self, code: &str) -> Result<Option<PromoCode>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .promos
            .values()
            .find(|promo| promo.code == code)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PromoCode>, StoreError> {
        Ok(self.state.lock().await.promos.get(&id).cloned())
    }

    async fn usage_count(&self, promo_code_id: Uuid, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .usages
            .iter()
            .filter(|u| u.promo_code_id == promo_code_id && u.user_id == user_id)
            .count() as i64)
    }

    async fn record_usage(&self, usage: &PromoCodeUsage) -> Result<UsageOutcome, StoreError> {
        self.state.lock().await.admit_usage(usage)
    }

    async fn insert(&self, promo: &PromoCode) -> Result<(), StoreError> {
        promo.validate_definition().map_err(StoreError::Corrupt)?;
        let mut state = self.state.lock().await;
        if state.promos.values().any(|p| p.code == promo.code) {
            return Err(StoreError::Duplicate(format!("promo code {}", promo.code)));
        }
        state.promos.insert(promo.id, promo.clone());
        Ok(())
    }
}

#[async_trait]
impl LoyaltyStore for MemoryStore {
    async fn balance(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .get(&user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn history(
        &self,
        user_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<LoyaltyTransaction>, u64), StoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<&LoyaltyTransaction> = state
            .ledger
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        let total = entries.len() as u64;
        let page = entries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn find_for_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        kind: TransactionType,
    ) -> Result<Option<LoyaltyTransaction>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .ledger
            .iter()
            .rev()
            .find(|entry| {
                entry.user_id == user_id
                    && entry.order_id == Some(order_id)
                    && entry.transaction_type == kind
            })
            .cloned())
    }

    async fn expiring(&self, now: DateTime<Utc>) -> Result<Vec<LoyaltyTransaction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|entry| {
                entry.transaction_type == TransactionType::Earned
                    && entry.expires_at.is_some_and(|at| at <= now)
                    && !state.expired_grants.contains(&entry.id)
            })
            .cloned()
            .collect())
    }

    async fn append(&self, request: LedgerAppend) -> Result<AppendOutcome, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let user_id = request.user_id;
        let kind = request.movement.kind();

        let head = LedgerHead {
            balance: state.balances.get(&user_id).copied().unwrap_or(0),
            seq: state
                .ledger
                .iter()
                .rev()
                .find(|entry| entry.user_id == user_id)
                .map(|entry| entry.seq)
                .unwrap_or(0),
        };
        let prior = match (request.movement.once_per_order(), request.order_id) {
            (true, Some(order_id)) => state
                .ledger
                .iter()
                .find(|entry| {
                    entry.user_id == user_id
                        && entry.order_id == Some(order_id)
                        && entry.transaction_type == kind
                })
                .cloned(),
            _ => None,
        };
        let grants: Vec<LoyaltyTransaction> = state
            .ledger
            .iter()
            .filter(|entry| {
                entry.user_id == user_id
                    && entry.transaction_type == TransactionType::Earned
                    && request.consumes.contains(&entry.id)
                    && !state.expired_grants.contains(&entry.id)
            })
            .cloned()
            .collect();

        let outcome = loyalty_service::decide(&request, head, prior, &grants);
        if let AppendOutcome::Written(entry) = &outcome {
            state.ledger.push(entry.clone());
            state.balances.insert(user_id, entry.balance_after);
            state
                .expired_grants
                .extend(grants.iter().map(|grant| grant.id));
        }
        Ok(outcome)
    }
}

#[async_trait]
impl OrderSink for MemoryStore {
    async fn save_order(
        &self,
        order: &Order,
        usage: Option<&PromoCodeUsage>,
    ) -> Result<Uuid, StoreError> {
        if self.fail_order_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("order writes disabled".into()));
        }

        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.id) {
            return Ok(order.id);
        }
        if let Some(usage) = usage {
            state.admit_usage(usage)?;
        }
        state.orders.insert(order.id, order.clone());
        Ok(order.id)
    }

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn has_orders(&self, user_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .any(|order| order.user_id == Some(user_id)))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: (OrderStatus, PaymentStatus),
        to: (OrderStatus, PaymentStatus),
    ) -> Result<Order, StoreError> {
        let mut state = self.state.lock().await;
        let order = state.orders.get_mut(&id).ok_or(StoreError::NotFound)?;
        if (order.status, order.payment_status) != from {
            return Err(StoreError::StateConflict);
        }
        (order.status, order.payment_status) = to;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }
}
