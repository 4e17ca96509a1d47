use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use food_order_core::{
    config::CheckoutSettings,
    dto::{
        cart::{AddToCartRequest, ApplyPromoRequest, UpdateMode},
        orders::{CheckoutRequest, PaymentConfirmation, PaymentOutcome},
    },
    error::AppError,
    middleware::auth::AuthUser,
    models::{
        CatalogItem, DeliveryMethod, DiscountType, LoyaltyTransaction, OrderStatus, PaymentMethod,
        PaymentStatus, PromoCode, TransactionType,
    },
    services::{
        cart_service, checkout_service,
        loyalty_service::{self, Movement},
        promo_service::{self, Discount, PromoRejection},
    },
    state::AppState,
    store::{AppendOutcome, LedgerAppend, LoyaltyStore, MemoryStore, StoreError},
};
use rust_decimal::Decimal;
use uuid::Uuid;

struct Fixture {
    state: AppState,
    store: Arc<MemoryStore>,
    item: CatalogItem,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let item = CatalogItem {
        item_id: Uuid::new_v4(),
        name: "Butter Chicken".into(),
        unit_price: Decimal::from(100),
        is_available: true,
        restaurant_id: Uuid::new_v4(),
        restaurant_active: true,
    };
    store.put_item(item.clone()).await;
    let state = AppState::in_memory(store.clone(), CheckoutSettings::default());
    Fixture { state, store, item }
}

fn save20() -> PromoCode {
    PromoCode {
        id: Uuid::new_v4(),
        code: "SAVE20".into(),
        discount_type: DiscountType::Percentage,
        discount_value: Decimal::from(20),
        minimum_order_amount: Decimal::ZERO,
        max_discount_amount: Some(Decimal::from(30)),
        usage_limit: None,
        usage_limit_per_user: None,
        start_date: Utc::now() - Duration::days(1),
        end_date: Utc::now() + Duration::days(30),
        restaurant_id: None,
        first_time_only: false,
        is_active: true,
        times_used: 0,
    }
}

/// The user's whole ledger, oldest first.
async fn ledger(state: &AppState, user_id: Uuid) -> Result<Vec<LoyaltyTransaction>, AppError> {
    let (mut entries, _) = loyalty_service::history(state, user_id, 0, 100).await?;
    entries.reverse();
    Ok(entries)
}

fn checkout_request(payment_method: PaymentMethod, points: i64) -> CheckoutRequest {
    CheckoutRequest {
        delivery_method: DeliveryMethod::Delivery,
        payment_method,
        points_to_redeem: points,
        cart_version: None,
    }
}

async fn add(fx: &Fixture, session_id: Uuid, quantity: i64, version: i64) -> Result<i64, AppError> {
    let cart = cart_service::add_item(
        &fx.state,
        session_id,
        None,
        AddToCartRequest {
            item_id: fx.item.item_id,
            quantity,
            mode: UpdateMode::Increment,
            version,
        },
    )
    .await?;
    Ok(cart.version)
}

async fn apply(fx: &Fixture, session_id: Uuid, user_id: Uuid, version: i64) -> Result<i64, AppError> {
    let (cart, _) = promo_service::apply_to_cart(
        &fx.state,
        session_id,
        Some(user_id),
        ApplyPromoRequest {
            code: " save20 ".into(),
            version,
        },
    )
    .await?;
    Ok(cart.version)
}

#[tokio::test]
async fn promo_and_delivery_charge_make_up_the_total() -> anyhow::Result<()> {
    let fx = fixture().await;
    fx.store.put_promo(save20()).await;
    let (session, user) = (Uuid::new_v4(), Uuid::new_v4());

    let version = add(&fx, session, 2, 0).await?;
    apply(&fx, session, user, version).await?;

    let (receipt, notices) = checkout_service::checkout(
        &fx.state,
        session,
        Some(user),
        checkout_request(PaymentMethod::Online, 0),
    )
    .await?;

    let order = receipt.order;
    assert_eq!(order.subtotal, Decimal::from(200));
    assert_eq!(order.discount_amount, Decimal::from(30));
    assert_eq!(order.delivery_charge, Decimal::from(40));
    assert_eq!(order.final_total, Decimal::from(210));
    assert!(notices.is_empty());

    let cart = cart_service::get_cart(&fx.state, session).await?;
    assert!(cart.is_empty());
    assert!(cart.applied_promo_code_id.is_none());
    Ok(())
}

#[tokio::test]
async fn redeemed_points_reduce_total_and_balance() -> anyhow::Result<()> {
    let fx = fixture().await;
    fx.store.put_promo(save20()).await;
    let (session, user) = (Uuid::new_v4(), Uuid::new_v4());
    loyalty_service::adjust(&fx.state, user, 500, "opening balance").await?;

    let version = add(&fx, session, 2, 0).await?;
    apply(&fx, session, user, version).await?;

    let (receipt, _) = checkout_service::checkout(
        &fx.state,
        session,
        Some(user),
        checkout_request(PaymentMethod::Online, 50),
    )
    .await?;

    assert_eq!(receipt.order.points_used, 50);
    assert_eq!(receipt.order.final_total, Decimal::from(160));
    assert_eq!(loyalty_service::balance(&fx.state, user).await?, 450);
    Ok(())
}

#[tokio::test]
async fn over_asking_points_is_clamped_with_a_notice() -> anyhow::Result<()> {
    let fx = fixture().await;
    let (session, user) = (Uuid::new_v4(), Uuid::new_v4());
    loyalty_service::adjust(&fx.state, user, 500, "opening balance").await?;

    add(&fx, session, 2, 0).await?;
    let (receipt, notices) = checkout_service::checkout(
        &fx.state,
        session,
        Some(user),
        checkout_request(PaymentMethod::Online, 400),
    )
    .await?;

    // Half of a 200 subtotal.
    assert_eq!(receipt.order.points_used, 100);
    assert_eq!(notices.len(), 1);
    assert_eq!(loyalty_service::balance(&fx.state, user).await?, 400);
    Ok(())
}

#[tokio::test]
async fn expired_check_wins_over_usage_limit() -> anyhow::Result<()> {
    let fx = fixture().await;
    fx.store
        .put_promo(PromoCode {
            usage_limit: Some(5),
            times_used: 5,
            start_date: Utc::now() - Duration::days(30),
            end_date: Utc::now() - Duration::days(1),
            ..save20()
        })
        .await;

    let result =
        promo_service::validate_code(&fx.state, Uuid::new_v4(), "SAVE20", Decimal::from(200))
            .await?;
    assert!(!result.valid);
    assert_eq!(result.reason, Some(PromoRejection::Expired));
    Ok(())
}

#[tokio::test]
async fn second_writer_at_same_version_is_stale() -> anyhow::Result<()> {
    let fx = fixture().await;
    let session = Uuid::new_v4();
    let mut version = 0;
    for _ in 0..5 {
        version = add(&fx, session, 1, version).await?;
    }
    assert_eq!(version, 5);

    assert_eq!(add(&fx, session, 1, 5).await?, 6);
    let err = add(&fx, session, 1, 5).await.unwrap_err();
    assert!(matches!(err, AppError::StaleCart { current_version: 6, .. }));

    let cart = cart_service::get_cart(&fx.state, session).await?;
    assert_eq!(cart.version, 6);
    assert_eq!(cart.lines[&fx.item.item_id].quantity, 6);
    Ok(())
}

#[tokio::test]
async fn expiry_only_takes_what_is_left_of_a_grant() -> anyhow::Result<()> {
    let fx = fixture().await;
    let user = Uuid::new_v4();

    let earned = loyalty_service::earn(&fx.state, user, Uuid::new_v4(), Decimal::from(1000)).await?;
    assert_eq!(earned.points, 100);
    loyalty_service::redeem(&fx.state, user, 30, Uuid::new_v4(), Decimal::from(200)).await?;

    let later = Utc::now() + Duration::days(400);
    let report = loyalty_service::expire(&fx.state, later).await?;
    assert_eq!(report.users, 1);
    assert_eq!(report.entries[0].points, -70);
    assert_eq!(report.entries[0].transaction_type, TransactionType::Expired);
    assert_eq!(loyalty_service::balance(&fx.state, user).await?, 0);

    let rerun = loyalty_service::expire(&fx.state, later).await?;
    assert_eq!(rerun.users, 0);
    assert_eq!(ledger(&fx.state, user).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn earning_twice_for_one_order_credits_once() -> anyhow::Result<()> {
    let fx = fixture().await;
    let (user, order) = (Uuid::new_v4(), Uuid::new_v4());

    loyalty_service::earn(&fx.state, user, order, Decimal::from(250)).await?;
    let again = loyalty_service::earn(&fx.state, user, order, Decimal::from(250)).await;

    assert!(matches!(again, Err(AppError::DuplicateUsage { .. })));
    assert_eq!(loyalty_service::balance(&fx.state, user).await?, 25);
    Ok(())
}

#[tokio::test]
async fn failed_order_write_gives_points_back() -> anyhow::Result<()> {
    let fx = fixture().await;
    let (session, user) = (Uuid::new_v4(), Uuid::new_v4());
    loyalty_service::adjust(&fx.state, user, 200, "opening balance").await?;
    add(&fx, session, 2, 0).await?;

    fx.store.fail_order_writes(true);
    let result = checkout_service::checkout(
        &fx.state,
        session,
        Some(user),
        checkout_request(PaymentMethod::Cash, 50),
    )
    .await;
    assert!(matches!(result, Err(AppError::Persistence(_))));

    assert_eq!(loyalty_service::balance(&fx.state, user).await?, 200);
    let kinds: Vec<TransactionType> = ledger(&fx.state, user)
        .await?
        .into_iter()
        .map(|entry| entry.transaction_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            TransactionType::Manual,
            TransactionType::Redeemed,
            TransactionType::Refunded
        ]
    );
    assert_eq!(fx.store.order_count().await, 0);
    assert!(!cart_service::get_cart(&fx.state, session).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn concurrent_redemptions_never_overdraw() -> anyhow::Result<()> {
    let fx = fixture().await;
    let user = Uuid::new_v4();
    loyalty_service::adjust(&fx.state, user, 100, "opening balance").await?;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let state = fx.state.clone();
        handles.push(tokio::spawn(async move {
            loyalty_service::redeem(&state, user, 40, Uuid::new_v4(), Decimal::from(1000)).await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => succeeded += 1,
            Err(AppError::InsufficientPoints { .. }) => {}
            Err(err) => return Err(err.into()),
        }
    }

    assert_eq!(succeeded, 2);
    assert_eq!(loyalty_service::balance(&fx.state, user).await?, 20);
    Ok(())
}

#[tokio::test]
async fn per_user_limit_blocks_a_second_use() -> anyhow::Result<()> {
    let fx = fixture().await;
    fx.store
        .put_promo(PromoCode {
            usage_limit_per_user: Some(1),
            ..save20()
        })
        .await;
    let user = Uuid::new_v4();

    let first = Uuid::new_v4();
    let version = add(&fx, first, 2, 0).await?;
    apply(&fx, first, user, version).await?;
    checkout_service::checkout(
        &fx.state,
        first,
        Some(user),
        checkout_request(PaymentMethod::Online, 0),
    )
    .await?;

    let second = Uuid::new_v4();
    let version = add(&fx, second, 1, 0).await?;
    let err = apply(&fx, second, user, version).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::PromoInvalid(PromoRejection::PerUserLimitReached)
    ));
    assert_eq!(fx.store.usages().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn recording_usage_twice_for_one_order_is_a_no_op() -> anyhow::Result<()> {
    let fx = fixture().await;
    let promo = save20();
    fx.store.put_promo(promo.clone()).await;
    let (user, order) = (Uuid::new_v4(), Uuid::new_v4());
    let discount = Discount {
        amount: Decimal::from(30),
        free_delivery: false,
    };

    promo_service::record_usage(&fx.state, &promo, user, order, discount).await?;
    let again = promo_service::record_usage(&fx.state, &promo, user, order, discount).await;

    assert!(matches!(again, Err(AppError::DuplicateUsage { .. })));
    assert_eq!(fx.store.usages().await.len(), 1);
    let stored = promo_service::find_by_code(&fx.state, "SAVE20").await?;
    assert_eq!(stored.times_used, 1);
    Ok(())
}

#[tokio::test]
async fn unavailable_items_are_dropped_and_reported() -> anyhow::Result<()> {
    let fx = fixture().await;
    let session = Uuid::new_v4();
    add(&fx, session, 1, 0).await?;

    fx.store
        .put_item(CatalogItem {
            is_available: false,
            ..fx.item.clone()
        })
        .await;

    let err = checkout_service::checkout(
        &fx.state,
        session,
        None,
        checkout_request(PaymentMethod::Cash, 0),
    )
    .await
    .unwrap_err();

    match err {
        AppError::ItemUnavailable { items } => assert_eq!(items, vec!["Butter Chicken"]),
        other => panic!("unexpected error: {other:?}"),
    }
    let cart = cart_service::get_cart(&fx.state, session).await?;
    assert!(cart.is_empty());
    assert_eq!(cart.version, 2);
    Ok(())
}

#[tokio::test]
async fn guest_checkout_places_order_without_points() -> anyhow::Result<()> {
    let fx = fixture().await;
    let session = Uuid::new_v4();
    add(&fx, session, 3, 0).await?;

    let (receipt, _) = checkout_service::checkout(
        &fx.state,
        session,
        None,
        CheckoutRequest {
            delivery_method: DeliveryMethod::Takeaway,
            ..checkout_request(PaymentMethod::Cash, 0)
        },
    )
    .await?;

    assert_eq!(receipt.order.user_id, None);
    assert_eq!(receipt.order.delivery_charge, Decimal::ZERO);
    assert_eq!(receipt.order.final_total, Decimal::from(300));
    assert_eq!(receipt.points_earned, None);

    let err = checkout_service::checkout(
        &fx.state,
        Uuid::new_v4(),
        None,
        checkout_request(PaymentMethod::Cash, 10),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn captured_payment_earns_points_once() -> anyhow::Result<()> {
    let fx = fixture().await;
    let (session, user_id) = (Uuid::new_v4(), Uuid::new_v4());
    let customer = AuthUser {
        user_id,
        role: "customer".into(),
    };
    add(&fx, session, 2, 0).await?;

    let (receipt, _) = checkout_service::checkout(
        &fx.state,
        session,
        Some(user_id),
        checkout_request(PaymentMethod::Online, 0),
    )
    .await?;
    assert_eq!(receipt.points_earned, None);
    let order_id = receipt.order.id;

    let order = checkout_service::start_payment(&fx.state, Some(&customer), order_id).await?;
    assert_eq!(order.payment_status, PaymentStatus::Processing);

    for _ in 0..2 {
        let order = checkout_service::confirm_payment(
            &fx.state,
            PaymentConfirmation {
                order_id,
                status: PaymentOutcome::Captured,
            },
        )
        .await?;
        assert_eq!(order.payment_status, PaymentStatus::Completed);
    }

    // 240 charged, one point per 10.
    assert_eq!(loyalty_service::balance(&fx.state, user_id).await?, 24);
    Ok(())
}

#[tokio::test]
async fn failed_payment_cancels_and_refunds() -> anyhow::Result<()> {
    let fx = fixture().await;
    let (session, user) = (Uuid::new_v4(), Uuid::new_v4());
    loyalty_service::adjust(&fx.state, user, 80, "opening balance").await?;
    add(&fx, session, 2, 0).await?;

    let (receipt, _) = checkout_service::checkout(
        &fx.state,
        session,
        Some(user),
        checkout_request(PaymentMethod::Online, 80),
    )
    .await?;
    assert_eq!(loyalty_service::balance(&fx.state, user).await?, 0);

    let order = checkout_service::confirm_payment(
        &fx.state,
        PaymentConfirmation {
            order_id: receipt.order.id,
            status: PaymentOutcome::Failed,
        },
    )
    .await?;

    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.payment_status, PaymentStatus::Failed);
    assert_eq!(loyalty_service::balance(&fx.state, user).await?, 80);
    Ok(())
}

#[tokio::test]
async fn only_staff_move_orders_along() -> anyhow::Result<()> {
    let fx = fixture().await;
    let session = Uuid::new_v4();
    add(&fx, session, 1, 0).await?;
    let (receipt, _) = checkout_service::checkout(
        &fx.state,
        session,
        None,
        checkout_request(PaymentMethod::Cash, 0),
    )
    .await?;
    let order_id = receipt.order.id;

    let customer = AuthUser {
        user_id: Uuid::new_v4(),
        role: "customer".into(),
    };
    let err = checkout_service::advance_status(&fx.state, &customer, order_id, OrderStatus::Accepted)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden));

    let staff = AuthUser {
        user_id: Uuid::new_v4(),
        role: "restaurant".into(),
    };
    let order =
        checkout_service::advance_status(&fx.state, &staff, order_id, OrderStatus::Accepted)
            .await?;
    assert_eq!(order.status, OrderStatus::Accepted);

    // Serving is a dine-in step.
    checkout_service::advance_status(&fx.state, &staff, order_id, OrderStatus::Preparing).await?;
    let err = checkout_service::advance_status(&fx.state, &staff, order_id, OrderStatus::Serving)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    Ok(())
}

/// Ledger whose first `failures` refund writes error out.
struct FlakyRefunds {
    inner: Arc<MemoryStore>,
    failures: AtomicUsize,
}

#[async_trait]
impl LoyaltyStore for FlakyRefunds {
    async fn balance(&self, user_id: Uuid) -> Result<i64, StoreError> {
        self.inner.balance(user_id).await
    }

    async fn history(
        &self,
        user_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<LoyaltyTransaction>, u64), StoreError> {
        self.inner.history(user_id, offset, limit).await
    }

    async fn find_for_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        kind: TransactionType,
    ) -> Result<Option<LoyaltyTransaction>, StoreError> {
        self.inner.find_for_order(user_id, order_id, kind).await
    }

    async fn expiring(&self, now: DateTime<Utc>) -> Result<Vec<LoyaltyTransaction>, StoreError> {
        self.inner.expiring(now).await
    }

    async fn append(&self, request: LedgerAppend) -> Result<AppendOutcome, StoreError> {
        let failing = matches!(request.movement, Movement::Refund { .. })
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
        if failing {
            return Err(StoreError::Unavailable("ledger offline".into()));
        }
        self.inner.append(request).await
    }
}

fn with_flaky_refunds(fx: &Fixture, failures: usize) -> AppState {
    AppState {
        loyalty: Arc::new(FlakyRefunds {
            inner: fx.store.clone(),
            failures: AtomicUsize::new(failures),
        }),
        ..fx.state.clone()
    }
}

#[tokio::test]
async fn redelivered_payment_failure_retries_the_refund() -> anyhow::Result<()> {
    let fx = fixture().await;
    let state = with_flaky_refunds(&fx, 1);
    let (session, user) = (Uuid::new_v4(), Uuid::new_v4());
    loyalty_service::adjust(&state, user, 80, "opening balance").await?;
    add(&fx, session, 2, 0).await?;

    let (receipt, _) = checkout_service::checkout(
        &state,
        session,
        Some(user),
        checkout_request(PaymentMethod::Online, 80),
    )
    .await?;
    assert_eq!(loyalty_service::balance(&state, user).await?, 0);

    let event = || PaymentConfirmation {
        order_id: receipt.order.id,
        status: PaymentOutcome::Failed,
    };
    let first = checkout_service::confirm_payment(&state, event()).await;
    assert!(matches!(first, Err(AppError::Persistence(_))));
    assert_eq!(loyalty_service::balance(&state, user).await?, 0);

    let order = checkout_service::confirm_payment(&state, event()).await?;
    assert_eq!(order.payment_status, PaymentStatus::Failed);
    assert_eq!(loyalty_service::balance(&state, user).await?, 80);

    // Further redeliveries do not credit again.
    checkout_service::confirm_payment(&state, event()).await?;
    assert_eq!(loyalty_service::balance(&state, user).await?, 80);
    Ok(())
}

#[tokio::test]
async fn repeated_cancel_finishes_an_interrupted_refund() -> anyhow::Result<()> {
    let fx = fixture().await;
    let state = with_flaky_refunds(&fx, 1);
    let (session, user) = (Uuid::new_v4(), Uuid::new_v4());
    loyalty_service::adjust(&state, user, 80, "opening balance").await?;
    add(&fx, session, 2, 0).await?;

    let (receipt, _) = checkout_service::checkout(
        &state,
        session,
        Some(user),
        checkout_request(PaymentMethod::Cash, 80),
    )
    .await?;
    let staff = AuthUser {
        user_id: Uuid::new_v4(),
        role: "restaurant".into(),
    };

    let first =
        checkout_service::advance_status(&state, &staff, receipt.order.id, OrderStatus::Cancelled)
            .await;
    assert!(matches!(first, Err(AppError::Persistence(_))));

    let order =
        checkout_service::advance_status(&state, &staff, receipt.order.id, OrderStatus::Cancelled)
            .await?;
    assert_eq!(order.status, OrderStatus::Cancelled);
    // Cash orders earn on placement; only the redemption comes back.
    let earned = receipt.points_earned.unwrap_or(0);
    assert_eq!(loyalty_service::balance(&state, user).await?, 80 + earned);
    Ok(())
}

async fn add_line(
    fx: &Fixture,
    session_id: Uuid,
    item: &CatalogItem,
    version: i64,
) -> Result<i64, AppError> {
    let cart = cart_service::add_item(
        &fx.state,
        session_id,
        None,
        AddToCartRequest {
            item_id: item.item_id,
            quantity: 1,
            mode: UpdateMode::Increment,
            version,
        },
    )
    .await?;
    Ok(cart.version)
}

async fn apply_code(
    fx: &Fixture,
    session_id: Uuid,
    user_id: Uuid,
    code: &str,
    version: i64,
) -> Result<i64, AppError> {
    let (cart, _) = promo_service::apply_to_cart(
        &fx.state,
        session_id,
        Some(user_id),
        ApplyPromoRequest {
            code: code.into(),
            version,
        },
    )
    .await?;
    Ok(cart.version)
}

async fn other_item(fx: &Fixture, restaurant_id: Uuid) -> CatalogItem {
    let item = CatalogItem {
        item_id: Uuid::new_v4(),
        name: "Garlic Naan".into(),
        unit_price: Decimal::from(100),
        is_available: true,
        restaurant_id,
        restaurant_active: true,
    };
    fx.store.put_item(item.clone()).await;
    item
}

#[tokio::test]
async fn scoped_code_rejects_carts_with_other_restaurants() -> anyhow::Result<()> {
    let fx = fixture().await;
    fx.store
        .put_promo(PromoCode {
            code: "HOUSE10".into(),
            restaurant_id: Some(fx.item.restaurant_id),
            ..save20()
        })
        .await;
    let elsewhere = other_item(&fx, Uuid::new_v4()).await;
    let user = Uuid::new_v4();

    // Mixed cart: refused at apply time.
    let mixed = Uuid::new_v4();
    let version = add(&fx, mixed, 1, 0).await?;
    let version = add_line(&fx, mixed, &elsewhere, version).await?;
    let err = apply_code(&fx, mixed, user, "house10", version)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::PromoInvalid(PromoRejection::NotValidForCart)
    ));

    // In-scope cart accepts it, then an out-of-scope line blocks checkout.
    let session = Uuid::new_v4();
    let version = add(&fx, session, 2, 0).await?;
    let version = apply_code(&fx, session, user, "house10", version).await?;
    add_line(&fx, session, &elsewhere, version).await?;
    let result = checkout_service::checkout(
        &fx.state,
        session,
        Some(user),
        checkout_request(PaymentMethod::Cash, 0),
    )
    .await;
    assert!(matches!(
        result,
        Err(AppError::PromoInvalid(PromoRejection::NotValidForCart))
    ));
    assert_eq!(fx.store.order_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn minimum_order_is_rechecked_at_checkout() -> anyhow::Result<()> {
    let fx = fixture().await;
    fx.store
        .put_promo(PromoCode {
            minimum_order_amount: Decimal::from(150),
            ..save20()
        })
        .await;
    let side = other_item(&fx, fx.item.restaurant_id).await;
    let (session, user) = (Uuid::new_v4(), Uuid::new_v4());

    let version = add(&fx, session, 1, 0).await?;
    let version = add_line(&fx, session, &side, version).await?;
    let version = apply(&fx, session, user, version).await?;
    cart_service::remove_item(&fx.state, session, Some(user), side.item_id, version).await?;

    let result = checkout_service::checkout(
        &fx.state,
        session,
        Some(user),
        checkout_request(PaymentMethod::Cash, 0),
    )
    .await;
    assert!(matches!(
        result,
        Err(AppError::PromoInvalid(PromoRejection::MinimumOrderNotMet))
    ));
    assert!(fx.store.usages().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn first_time_code_is_refused_after_a_placed_order() -> anyhow::Result<()> {
    let fx = fixture().await;
    fx.store
        .put_promo(PromoCode {
            code: "WELCOME50".into(),
            discount_type: DiscountType::Fixed,
            discount_value: Decimal::from(50),
            max_discount_amount: None,
            first_time_only: true,
            ..save20()
        })
        .await;
    let (returning, newcomer) = (Uuid::new_v4(), Uuid::new_v4());

    let first = Uuid::new_v4();
    add(&fx, first, 1, 0).await?;
    checkout_service::checkout(
        &fx.state,
        first,
        Some(returning),
        checkout_request(PaymentMethod::Cash, 0),
    )
    .await?;

    let session = Uuid::new_v4();
    let version = add(&fx, session, 2, 0).await?;
    let err = apply_code(&fx, session, returning, "welcome50", version)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::PromoInvalid(PromoRejection::FirstTimeOnly)
    ));

    let version = apply_code(&fx, session, newcomer, "welcome50", version).await?;
    assert_eq!(version, 2);
    Ok(())
}

#[tokio::test]
async fn history_pages_newest_first() -> anyhow::Result<()> {
    let fx = fixture().await;
    let user = Uuid::new_v4();
    for points in [10, 20, 30, 40, 50] {
        loyalty_service::adjust(&fx.state, user, points, "top up").await?;
    }

    let (page, total) = loyalty_service::history(&fx.state, user, 1, 2).await?;
    assert_eq!(total, 5);
    assert_eq!(page.iter().map(|e| e.points).collect::<Vec<_>>(), vec![40, 30]);
    assert_eq!(page.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 3]);
    Ok(())
}

#[tokio::test]
async fn duplicate_promo_code_is_a_conflict() -> anyhow::Result<()> {
    let fx = fixture().await;
    fx.state.promos.insert(&save20()).await?;

    // A second row with the same code, bypassing the service pre-check.
    let err = fx.state.promos.insert(&save20()).await.unwrap_err();
    assert!(matches!(AppError::from(err), AppError::Conflict(_)));
    Ok(())
}
