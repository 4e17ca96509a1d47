use std::sync::Arc;

use crate::{
    config::CheckoutSettings,
    db::{DbPool, OrmConn},
    store::{CartStore, CatalogAdapter, LoyaltyStore, MemoryStore, OrderSink, PgStore, PromoStore},
};

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn CatalogAdapter>,
    pub carts: Arc<dyn CartStore>,
    pub promos: Arc<dyn PromoStore>,
    pub loyalty: Arc<dyn LoyaltyStore>,
    pub orders: Arc<dyn OrderSink>,
    pub settings: CheckoutSettings,
    /// Audit logging is skipped when no pool is configured.
    pub pool: Option<DbPool>,
}

impl AppState {
    pub fn postgres(orm: OrmConn, pool: DbPool, settings: CheckoutSettings) -> Self {
        let store = Arc::new(PgStore::new(orm));
        Self {
            catalog: store.clone(),
            carts: store.clone(),
            promos: store.clone(),
            loyalty: store.clone(),
            orders: store,
            settings,
            pool: Some(pool),
        }
    }

    pub fn in_memory(store: Arc<MemoryStore>, settings: CheckoutSettings) -> Self {
        Self {
            catalog: store.clone(),
            carts: store.clone(),
            promos: store.clone(),
            loyalty: store.clone(),
            orders: store,
            settings,
            pool: None,
        }
    }
}
