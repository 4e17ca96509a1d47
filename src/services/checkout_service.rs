use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    audit::audit_or_warn,
    config::CheckoutSettings,
    dto::orders::{CheckoutReceipt, CheckoutRequest, PaymentConfirmation, PaymentOutcome},
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{
        Cart, DeliveryMethod, Order, OrderLine, OrderStatus, PaymentMethod, PaymentStatus,
    },
    services::{
        cart_service::{load_for_update, store_cart},
        loyalty_service::{self, Redemption},
        promo_service::{self, Discount, PromoRejection},
    },
    state::AppState,
    store::StoreError,
};

/// Money side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub delivery_charge: Decimal,
    pub free_delivery_applied: bool,
    pub points_discount: Decimal,
    pub final_total: Decimal,
}

impl Totals {
    pub fn compute(
        settings: &CheckoutSettings,
        subtotal: Decimal,
        discount: Discount,
        method: DeliveryMethod,
        points_discount: Decimal,
    ) -> Self {
        let delivery_charge = delivery_charge(settings, method, discount.free_delivery);
        let final_total =
            (subtotal - discount.amount + delivery_charge - points_discount).max(Decimal::ZERO);
        Self {
            subtotal,
            discount_amount: discount.amount,
            delivery_charge,
            free_delivery_applied: discount.free_delivery,
            points_discount,
            final_total,
        }
    }
}

pub fn delivery_charge(
    settings: &CheckoutSettings,
    method: DeliveryMethod,
    free_delivery: bool,
) -> Decimal {
    match method {
        DeliveryMethod::Takeaway | DeliveryMethod::DineIn => Decimal::ZERO,
        DeliveryMethod::Delivery if free_delivery => Decimal::ZERO,
        DeliveryMethod::Delivery => settings.delivery_charge,
    }
}

/// Lines the catalog no longer sells, as `(item_id, name)`.
async fn unavailable_lines(state: &AppState, cart: &Cart) -> AppResult<Vec<(Uuid, String)>> {
    let mut gone = Vec::new();
    for line in cart.lines.values() {
        let orderable = state
            .catalog
            .lookup(line.item_id)
            .await?
            .is_some_and(|item| item.is_orderable());
        if !orderable {
            gone.push((line.item_id, line.name.clone()));
        }
    }
    Ok(gone)
}

/// Redemption problems are reported as notices and never block the order.
async fn redeem_points(
    state: &AppState,
    user_id: Uuid,
    requested: i64,
    order_id: Uuid,
    subtotal: Decimal,
    notices: &mut Vec<String>,
) -> Option<Redemption> {
    let balance = match loyalty_service::balance(state, user_id).await {
        Ok(balance) => balance,
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "could not read points balance");
            notices.push("Points could not be applied to this order".into());
            return None;
        }
    };

    let points = loyalty_service::redeem_cap(&state.settings.loyalty, balance, subtotal)
        .min(requested);
    if points < requested {
        notices.push(format!(
            "Only {points} of the {requested} requested points can be used on this order"
        ));
    }
    if points <= 0 {
        return None;
    }

    match loyalty_service::redeem(state, user_id, points, order_id, subtotal).await {
        Ok(redemption) => Some(redemption),
        Err(AppError::InsufficientPoints { requested, available }) => {
            tracing::info!(
                user_id = %user_id,
                requested,
                available,
                "points balance changed during checkout, redeeming none"
            );
            notices.push(format!(
                "Your points balance changed to {available}; no points were redeemed"
            ));
            None
        }
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "points redemption failed");
            notices.push("Points could not be applied to this order".into());
            None
        }
    }
}

/// Clears the session's cart once the order is safely stored. Changes made
/// in another tab after the checkout claim are discarded too.
async fn clear_after_checkout(state: &AppState, mut cart: Cart) {
    for _ in 0..3 {
        let expected = cart.version;
        cart.clear();
        match state.carts.save(&cart, expected).await {
            Ok(()) => return,
            Err(StoreError::VersionConflict { .. }) => match state.carts.load(cart.session_id).await
            {
                Ok(latest) => cart = latest,
                Err(err) => {
                    tracing::warn!(error = %err, "could not reload cart after checkout");
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "could not clear cart after checkout");
                return;
            }
        }
    }
    tracing::warn!(session_id = %cart.session_id, "cart kept changing, left uncleared");
}

/// Gives back points redeemed on a cancelled or unpaid order. Safe to call
/// again after a failed attempt: the ledger writes the refund once per order.
async fn refund_for(state: &AppState, order: &Order, reason: &str) -> AppResult<()> {
    if let Some(user_id) = order.user_id {
        loyalty_service::refund_redemption(state, user_id, order.id, reason).await?;
    }
    Ok(())
}

async fn earn_for(state: &AppState, order: &Order) -> Option<i64> {
    let user_id = order.user_id?;
    match loyalty_service::earn(state, user_id, order.id, order.final_total).await {
        Ok(entry) => Some(entry.points),
        Err(AppError::DuplicateUsage { .. }) => None,
        Err(err) => {
            tracing::warn!(order_id = %order.id, error = %err, "earning points failed");
            None
        }
    }
}

pub async fn checkout(
    state: &AppState,
    session_id: Uuid,
    user_id: Option<Uuid>,
    payload: CheckoutRequest,
) -> AppResult<(CheckoutReceipt, Vec<String>)> {
    if payload.points_to_redeem < 0 {
        return Err(AppError::Validation("points_to_redeem must not be negative".into()));
    }
    if user_id.is_none() && payload.points_to_redeem > 0 {
        return Err(AppError::Validation("sign in to redeem points".into()));
    }

    let mut cart = match payload.cart_version {
        Some(version) => load_for_update(state, session_id, version, &[]).await?,
        None => state.carts.load(session_id).await?,
    };
    if cart.is_empty() {
        return Err(AppError::Validation("cart is empty".into()));
    }

    let gone = unavailable_lines(state, &cart).await?;
    if !gone.is_empty() {
        let (ids, names): (Vec<Uuid>, Vec<String>) = gone.into_iter().unzip();
        let expected = cart.version;
        cart.drop_lines(&ids);
        store_cart(state, &cart, expected, &names).await?;
        tracing::info!(session_id = %session_id, items = ?names, "checkout blocked by unavailable items");
        return Err(AppError::ItemUnavailable { items: names });
    }

    let subtotal = cart.subtotal();

    let (promo, discount) = match cart.applied_promo_code_id {
        Some(promo_id) => {
            let user_id = user_id
                .ok_or_else(|| AppError::Validation("sign in to use promo codes".into()))?;
            let promo = state
                .promos
                .find_by_id(promo_id)
                .await?
                .ok_or(AppError::PromoInvalid(PromoRejection::NotFound))?;
            let discount = promo_service::quote(state, &promo, user_id, &cart).await?;
            (Some(promo), discount)
        }
        None => (None, Discount::none()),
    };

    // Claim the snapshot so a second tab submitting it gets a stale-cart error.
    let expected = cart.version;
    cart.claim_for_checkout();
    store_cart(state, &cart, expected, &[]).await?;

    let order_id = Uuid::new_v4();
    let mut notices = Vec::new();
    let redemption = match user_id {
        Some(user_id) if payload.points_to_redeem > 0 => {
            redeem_points(
                state,
                user_id,
                payload.points_to_redeem,
                order_id,
                subtotal,
                &mut notices,
            )
            .await
        }
        _ => None,
    };
    let (points_used, points_discount) = redemption
        .as_ref()
        .map(|r| (r.points, r.discount))
        .unwrap_or((0, Decimal::ZERO));

    let totals = Totals::compute(
        &state.settings,
        subtotal,
        discount,
        payload.delivery_method,
        points_discount,
    );

    let now = Utc::now();
    let order = Order {
        id: order_id,
        user_id,
        lines: cart
            .lines
            .values()
            .map(|line| OrderLine {
                item_id: line.item_id,
                name: line.name.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                line_subtotal: line.line_subtotal(),
            })
            .collect(),
        subtotal: totals.subtotal,
        discount_amount: totals.discount_amount,
        delivery_charge: totals.delivery_charge,
        free_delivery_applied: totals.free_delivery_applied,
        points_used,
        points_discount: totals.points_discount,
        final_total: totals.final_total,
        promo_code_id: promo.as_ref().map(|p| p.id),
        delivery_method: payload.delivery_method,
        payment_method: payload.payment_method,
        status: OrderStatus::Pending,
        payment_status: PaymentStatus::Pending,
        created_at: now,
        updated_at: now,
    };

    let usage = match (&promo, user_id) {
        (Some(promo), Some(user_id)) => {
            Some(promo_service::usage_for(promo, user_id, order_id, discount))
        }
        _ => None,
    };

    if let Err(err) = state.orders.save_order(&order, usage.as_ref()).await {
        tracing::error!(order_id = %order_id, error = %err, "order persistence failed");
        if let (Some(user_id), Some(_)) = (user_id, &redemption) {
            if let Err(refund_err) =
                loyalty_service::refund_redemption(state, user_id, order_id, "order not saved")
                    .await
            {
                tracing::error!(
                    order_id = %order_id,
                    error = %refund_err,
                    "could not compensate points redemption"
                );
            }
        }
        return Err(AppError::from(err));
    }

    tracing::info!(
        order_id = %order.id,
        user_id = ?user_id,
        subtotal = %order.subtotal,
        discount = %order.discount_amount,
        points_used = order.points_used,
        final_total = %order.final_total,
        "order placed"
    );

    let points_earned = match order.payment_method {
        PaymentMethod::Cash => earn_for(state, &order).await,
        PaymentMethod::Online => None,
    };

    clear_after_checkout(state, cart).await;

    audit_or_warn(
        state,
        user_id,
        "checkout",
        "orders",
        serde_json::json!({ "order_id": order.id, "final_total": order.final_total }),
    )
    .await;

    Ok((
        CheckoutReceipt {
            order,
            points_earned,
        },
        notices,
    ))
}

pub async fn get_order(state: &AppState, user: Option<&AuthUser>, id: Uuid) -> AppResult<Order> {
    let order = state.orders.find_order(id).await?.ok_or(AppError::NotFound)?;
    let visible = match user {
        Some(user) => user.is_staff() || order.user_id == Some(user.user_id),
        // Guests can only see guest orders, by id.
        None => order.user_id.is_none(),
    };
    if !visible {
        return Err(AppError::NotFound);
    }
    Ok(order)
}

/// Online payment handed to the gateway.
pub async fn start_payment(state: &AppState, user: Option<&AuthUser>, id: Uuid) -> AppResult<Order> {
    let order = get_order(state, user, id).await?;
    if order.payment_method != PaymentMethod::Online {
        return Err(AppError::Validation("order is not paid online".into()));
    }
    if !order.payment_status.can_transition_to(PaymentStatus::Processing) {
        return Err(AppError::Conflict(format!(
            "payment is already {}",
            order.payment_status
        )));
    }
    Ok(state
        .orders
        .transition(
            id,
            (order.status, order.payment_status),
            (order.status, PaymentStatus::Processing),
        )
        .await?)
}

/// Applies a payment gateway result. Redelivered events are no-ops.
pub async fn confirm_payment(state: &AppState, event: PaymentConfirmation) -> AppResult<Order> {
    let order = state
        .orders
        .find_order(event.order_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let order = match event.status {
        PaymentOutcome::Captured => {
            let order = match order.payment_status {
                PaymentStatus::Completed => order,
                PaymentStatus::Failed => {
                    return Err(AppError::Conflict(
                        "payment already failed, place a new order".into(),
                    ));
                }
                PaymentStatus::Pending | PaymentStatus::Processing => {
                    state
                        .orders
                        .transition(
                            order.id,
                            (order.status, order.payment_status),
                            (order.status, PaymentStatus::Completed),
                        )
                        .await?
                }
            };
            // Also covers a redelivery after a crash between the two steps.
            earn_for(state, &order).await;
            order
        }
        PaymentOutcome::Failed => match order.payment_status {
            PaymentStatus::Failed => {
                // The refund may not have landed on the first delivery.
                refund_for(state, &order, "payment failed").await?;
                order
            }
            PaymentStatus::Completed => {
                return Err(AppError::Conflict("payment already captured".into()));
            }
            PaymentStatus::Pending | PaymentStatus::Processing => {
                let status = if order.status.can_transition_to(OrderStatus::Cancelled, order.delivery_method) {
                    OrderStatus::Cancelled
                } else {
                    order.status
                };
                let order = state
                    .orders
                    .transition(
                        order.id,
                        (order.status, order.payment_status),
                        (status, PaymentStatus::Failed),
                    )
                    .await?;
                refund_for(state, &order, "payment failed").await?;
                order
            }
        },
    };

    tracing::info!(
        order_id = %order.id,
        payment_status = %order.payment_status,
        "payment confirmation applied"
    );
    audit_or_warn(
        state,
        order.user_id,
        "payment_confirmed",
        "orders",
        serde_json::json!({ "order_id": order.id, "payment_status": order.payment_status }),
    )
    .await;

    Ok(order)
}

/// Restaurant-side status changes along the order state machine.
pub async fn advance_status(
    state: &AppState,
    actor: &AuthUser,
    id: Uuid,
    next: OrderStatus,
) -> AppResult<Order> {
    if !actor.is_staff() {
        return Err(AppError::Forbidden);
    }
    let order = state.orders.find_order(id).await?.ok_or(AppError::NotFound)?;
    if order.status == OrderStatus::Cancelled && next == OrderStatus::Cancelled {
        // Repeated cancel: finish a refund an earlier attempt could not write.
        refund_for(state, &order, "order cancelled").await?;
        return Ok(order);
    }
    if !order.status.can_transition_to(next, order.delivery_method) {
        return Err(AppError::Validation(format!(
            "cannot move a {} order from {} to {}",
            order.delivery_method, order.status, next
        )));
    }

    let order = state
        .orders
        .transition(
            id,
            (order.status, order.payment_status),
            (next, order.payment_status),
        )
        .await?;

    if next == OrderStatus::Cancelled {
        refund_for(state, &order, "order cancelled").await?;
    }

    tracing::info!(order_id = %order.id, status = %order.status, "order status updated");
    audit_or_warn(
        state,
        Some(actor.user_id),
        "order_status",
        "orders",
        serde_json::json!({ "order_id": order.id, "status": order.status }),
    )
    .await;

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discount(amount: i64, free_delivery: bool) -> Discount {
        Discount {
            amount: Decimal::from(amount),
            free_delivery,
        }
    }

    #[test]
    fn delivery_orders_pay_the_default_charge() {
        let settings = CheckoutSettings::default();
        let totals = Totals::compute(
            &settings,
            Decimal::from(200),
            discount(30, false),
            DeliveryMethod::Delivery,
            Decimal::ZERO,
        );
        assert_eq!(totals.delivery_charge, Decimal::from(40));
        assert_eq!(totals.final_total, Decimal::from(210));
    }

    #[test]
    fn pickup_and_free_delivery_skip_the_charge() {
        let settings = CheckoutSettings::default();
        for (method, free) in [
            (DeliveryMethod::Takeaway, false),
            (DeliveryMethod::DineIn, false),
            (DeliveryMethod::Delivery, true),
        ] {
            let totals = Totals::compute(
                &settings,
                Decimal::from(100),
                discount(0, free),
                method,
                Decimal::ZERO,
            );
            assert_eq!(totals.delivery_charge, Decimal::ZERO);
            assert_eq!(totals.final_total, Decimal::from(100));
        }
    }

    #[test]
    fn final_total_never_goes_negative() {
        let settings = CheckoutSettings::default();
        let totals = Totals::compute(
            &settings,
            Decimal::from(100),
            discount(100, false),
            DeliveryMethod::Takeaway,
            Decimal::from(50),
        );
        assert_eq!(totals.final_total, Decimal::ZERO);
    }
}
