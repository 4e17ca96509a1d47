use std::sync::Arc;

use axum::extract::State;
use food_order_core::{
    config::CheckoutSettings, routes::health::health_check, state::AppState, store::MemoryStore,
};

#[tokio::test]
async fn health_check_returns_ok() {
    let state = AppState::in_memory(Arc::new(MemoryStore::new()), CheckoutSettings::default());
    let response = health_check(State(state)).await;
    assert_eq!(response.0.message, "Health check");

    let data = response.0.data.expect("health data");
    assert_eq!(data.status, "ok");
    assert_eq!(data.storage, "memory");
}
