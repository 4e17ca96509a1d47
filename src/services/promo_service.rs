use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dto::{
        cart::ApplyPromoRequest,
        promo::{CreatePromoRequest, PromoValidation},
    },
    error::{AppError, AppResult},
    models::{Cart, DiscountType, PromoCode, PromoCodeUsage},
    services::cart_service::{load_for_update, store_cart},
    state::AppState,
    store::UsageOutcome,
};

/// First blocking reason a promo code cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PromoRejection {
    NotFound,
    NotActive,
    NotYetActive,
    Expired,
    UsageLimitReached,
    MinimumOrderNotMet,
    FirstTimeOnly,
    PerUserLimitReached,
    NotValidForCart,
}

impl PromoRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            PromoRejection::NotFound => "not found",
            PromoRejection::NotActive => "not active",
            PromoRejection::NotYetActive => "not yet active",
            PromoRejection::Expired => "expired",
            PromoRejection::UsageLimitReached => "usage limit reached",
            PromoRejection::MinimumOrderNotMet => "minimum order amount not met",
            PromoRejection::FirstTimeOnly => "first-time customers only",
            PromoRejection::PerUserLimitReached => "per-user limit reached",
            PromoRejection::NotValidForCart => "not valid for items in cart",
        }
    }
}

impl std::fmt::Display for PromoRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

/// Facts about the order and customer a promo code is judged against.
#[derive(Debug, Clone)]
pub struct Eligibility {
    pub now: DateTime<Utc>,
    pub order_amount: Decimal,
    pub has_prior_orders: bool,
    pub user_usage_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct Discount {
    pub amount: Decimal,
    pub free_delivery: bool,
}

impl Discount {
    pub fn none() -> Self {
        Self {
            amount: Decimal::ZERO,
            free_delivery: false,
        }
    }
}

type Check = fn(&PromoCode, &Eligibility) -> Result<(), PromoRejection>;

/// Evaluated in order; callers only ever see the first failure.
const CHECKS: [Check; 6] = [
    check_active,
    check_window,
    check_global_limit,
    check_minimum_order,
    check_first_time,
    check_per_user_limit,
];

fn check_active(promo: &PromoCode, _: &Eligibility) -> Result<(), PromoRejection> {
    if promo.is_active {
        Ok(())
    } else {
        Err(PromoRejection::NotActive)
    }
}

fn check_window(promo: &PromoCode, ctx: &Eligibility) -> Result<(), PromoRejection> {
    if ctx.now < promo.start_date {
        Err(PromoRejection::NotYetActive)
    } else if ctx.now > promo.end_date {
        Err(PromoRejection::Expired)
    } else {
        Ok(())
    }
}

fn check_global_limit(promo: &PromoCode, _: &Eligibility) -> Result<(), PromoRejection> {
    match promo.usage_limit {
        Some(limit) if promo.times_used >= limit => Err(PromoRejection::UsageLimitReached),
        _ => Ok(()),
    }
}

fn check_minimum_order(promo: &PromoCode, ctx: &Eligibility) -> Result<(), PromoRejection> {
    if ctx.order_amount < promo.minimum_order_amount {
        Err(PromoRejection::MinimumOrderNotMet)
    } else {
        Ok(())
    }
}

fn check_first_time(promo: &PromoCode, ctx: &Eligibility) -> Result<(), PromoRejection> {
    if promo.first_time_only && ctx.has_prior_orders {
        Err(PromoRejection::FirstTimeOnly)
    } else {
        Ok(())
    }
}

fn check_per_user_limit(promo: &PromoCode, ctx: &Eligibility) -> Result<(), PromoRejection> {
    match promo.usage_limit_per_user {
        Some(limit) if ctx.user_usage_count >= i64::from(limit) => {
            Err(PromoRejection::PerUserLimitReached)
        }
        _ => Ok(()),
    }
}

/// Limits that must still hold when a usage row is written.
pub fn check_usage_limits(promo: &PromoCode, user_usage_count: i64) -> Result<(), PromoRejection> {
    let ctx = Eligibility {
        now: Utc::now(),
        order_amount: Decimal::ZERO,
        has_prior_orders: false,
        user_usage_count,
    };
    check_global_limit(promo, &ctx)?;
    check_per_user_limit(promo, &ctx)
}

impl PromoCode {
    /// Codes are stored trimmed and upper-case.
    pub fn normalize_code(raw: &str) -> String {
        raw.trim().to_uppercase()
    }

    pub fn evaluate(&self, ctx: &Eligibility) -> Result<(), PromoRejection> {
        CHECKS.iter().try_for_each(|check| check(self, ctx))
    }

    pub fn calculate_discount(&self, order_amount: Decimal) -> Discount {
        let order_amount = order_amount.max(Decimal::ZERO);
        match self.discount_type {
            DiscountType::Percentage => {
                let mut amount =
                    (order_amount * self.discount_value / Decimal::ONE_HUNDRED).round_dp(2);
                if let Some(cap) = self.max_discount_amount {
                    amount = amount.min(cap);
                }
                Discount {
                    amount: amount.max(Decimal::ZERO),
                    free_delivery: false,
                }
            }
            DiscountType::Fixed => Discount {
                amount: self.discount_value.min(order_amount).max(Decimal::ZERO),
                free_delivery: false,
            },
            DiscountType::FreeDelivery => Discount {
                amount: Decimal::ZERO,
                free_delivery: true,
            },
        }
    }

    /// A scoped code only covers carts whose every line belongs to its restaurant.
    pub fn covers(&self, cart: &Cart) -> bool {
        match self.restaurant_id {
            Some(scope) => cart.restaurants().all(|restaurant| restaurant == scope),
            None => true,
        }
    }

    pub fn validate_definition(&self) -> Result<(), String> {
        if self.code.is_empty() || self.code != Self::normalize_code(&self.code) {
            return Err(format!("code '{}' must be trimmed upper-case", self.code));
        }
        if self.start_date >= self.end_date {
            return Err("start_date must be before end_date".into());
        }
        match self.discount_type {
            DiscountType::Percentage => {
                if self.discount_value < Decimal::ZERO
                    || self.discount_value > Decimal::ONE_HUNDRED
                {
                    return Err("percentage discount must be between 0 and 100".into());
                }
            }
            DiscountType::Fixed => {
                if self.discount_value <= Decimal::ZERO {
                    return Err("fixed discount must be greater than 0".into());
                }
                if self.max_discount_amount.is_some() {
                    return Err("max_discount_amount only applies to percentage codes".into());
                }
            }
            DiscountType::FreeDelivery => {
                if !self.discount_value.is_zero() {
                    return Err("free delivery codes carry no discount value".into());
                }
                if self.max_discount_amount.is_some() {
                    return Err("max_discount_amount only applies to percentage codes".into());
                }
            }
        }
        Ok(())
    }
}

pub async fn create(state: &AppState, payload: CreatePromoRequest) -> AppResult<PromoCode> {
    let promo = PromoCode::from(payload);
    promo.validate_definition().map_err(AppError::Validation)?;
    if state.promos.find_by_code(&promo.code).await?.is_some() {
        return Err(AppError::Conflict(format!("promo code {} already exists", promo.code)));
    }
    state.promos.insert(&promo).await?;
    tracing::info!(promo_code = %promo.code, discount_type = %promo.discount_type, "promo code created");
    Ok(promo)
}

pub async fn find_by_code(state: &AppState, raw_code: &str) -> AppResult<PromoCode> {
    let code = PromoCode::normalize_code(raw_code);
    if code.is_empty() {
        return Err(AppError::Validation("promo code must not be empty".into()));
    }
    state
        .promos
        .find_by_code(&code)
        .await?
        .ok_or(AppError::PromoInvalid(PromoRejection::NotFound))
}

/// Gathers what the ordered checks need, skipping lookups the code does not use.
pub async fn eligibility(
    state: &AppState,
    promo: &PromoCode,
    user_id: Uuid,
    order_amount: Decimal,
) -> AppResult<Eligibility> {
    let has_prior_orders = if promo.first_time_only {
        state.orders.has_orders(user_id).await?
    } else {
        false
    };
    let user_usage_count = if promo.usage_limit_per_user.is_some() {
        state.promos.usage_count(promo.id, user_id).await?
    } else {
        0
    };
    Ok(Eligibility {
        now: Utc::now(),
        order_amount,
        has_prior_orders,
        user_usage_count,
    })
}

pub async fn is_valid(
    state: &AppState,
    promo: &PromoCode,
    user_id: Uuid,
    order_amount: Decimal,
) -> AppResult<Result<(), PromoRejection>> {
    let ctx = eligibility(state, promo, user_id, order_amount).await?;
    Ok(promo.evaluate(&ctx))
}

/// Scope, eligibility and discount for a cart as it stands now.
pub async fn quote(
    state: &AppState,
    promo: &PromoCode,
    user_id: Uuid,
    cart: &Cart,
) -> AppResult<Discount> {
    if !promo.covers(cart) {
        return Err(AppError::PromoInvalid(PromoRejection::NotValidForCart));
    }
    let subtotal = cart.subtotal();
    is_valid(state, promo, user_id, subtotal)
        .await?
        .map_err(AppError::PromoInvalid)?;
    Ok(promo.calculate_discount(subtotal))
}

pub async fn validate_code(
    state: &AppState,
    user_id: Uuid,
    raw_code: &str,
    order_amount: Decimal,
) -> AppResult<PromoValidation> {
    let promo = match find_by_code(state, raw_code).await {
        Ok(promo) => promo,
        Err(AppError::PromoInvalid(reason)) => {
            return Ok(PromoValidation::rejected(raw_code, reason));
        }
        Err(err) => return Err(err),
    };

    Ok(match is_valid(state, &promo, user_id, order_amount).await? {
        Ok(()) => PromoValidation::accepted(&promo, promo.calculate_discount(order_amount)),
        Err(reason) => PromoValidation::rejected(&promo.code, reason),
    })
}

/// Attaches a code to the session's cart. Usage is only recorded at checkout.
pub async fn apply_to_cart(
    state: &AppState,
    session_id: Uuid,
    user_id: Option<Uuid>,
    payload: ApplyPromoRequest,
) -> AppResult<(Cart, Discount)> {
    let user_id = user_id
        .ok_or_else(|| AppError::Validation("sign in to use promo codes".into()))?;

    let mut cart = load_for_update(state, session_id, payload.version, &[]).await?;
    if cart.is_empty() {
        return Err(AppError::Validation("cart is empty".into()));
    }
    let expected = cart.version;

    let promo = find_by_code(state, &payload.code).await?;
    let discount = quote(state, &promo, user_id, &cart).await?;

    cart.attach_promo(promo.id);
    store_cart(state, &cart, expected, &[]).await?;

    tracing::info!(
        session_id = %session_id,
        promo_code = %promo.code,
        discount = %discount.amount,
        free_delivery = discount.free_delivery,
        "promo code applied"
    );
    Ok((cart, discount))
}

pub async fn detach_from_cart(
    state: &AppState,
    session_id: Uuid,
    client_version: i64,
) -> AppResult<Cart> {
    let mut cart = load_for_update(state, session_id, client_version, &[]).await?;
    let expected = cart.version;
    cart.detach_promo();
    store_cart(state, &cart, expected, &[]).await?;
    Ok(cart)
}

pub fn usage_for(
    promo: &PromoCode,
    user_id: Uuid,
    order_id: Uuid,
    discount: Discount,
) -> PromoCodeUsage {
    PromoCodeUsage {
        id: Uuid::new_v4(),
        promo_code_id: promo.id,
        user_id,
        order_id,
        discount_amount: discount.amount,
        free_delivery_applied: discount.free_delivery,
        used_at: Utc::now(),
    }
}

/// Records one use of `promo` for an order. A repeat for the same
/// `(user, order)` is reported as [`AppError::DuplicateUsage`], which callers
/// treat as success.
pub async fn record_usage(
    state: &AppState,
    promo: &PromoCode,
    user_id: Uuid,
    order_id: Uuid,
    discount: Discount,
) -> AppResult<PromoCodeUsage> {
    let usage = usage_for(promo, user_id, order_id, discount);
    match state.promos.record_usage(&usage).await? {
        UsageOutcome::Recorded => {
            tracing::info!(
                promo_code = %promo.code,
                user_id = %user_id,
                order_id = %order_id,
                "promo usage recorded"
            );
            Ok(usage)
        }
        UsageOutcome::Duplicate => Err(AppError::DuplicateUsage { order_id }),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn promo(discount_type: DiscountType, value: i64) -> PromoCode {
        let now = Utc::now();
        PromoCode {
            id: Uuid::new_v4(),
            code: "SAVE20".into(),
            discount_type,
            discount_value: Decimal::from(value),
            minimum_order_amount: Decimal::ZERO,
            max_discount_amount: None,
            usage_limit: None,
            usage_limit_per_user: None,
            start_date: now - Duration::days(1),
            end_date: now + Duration::days(30),
            restaurant_id: None,
            first_time_only: false,
            is_active: true,
            times_used: 0,
        }
    }

    fn ctx(order_amount: i64) -> Eligibility {
        Eligibility {
            now: Utc::now(),
            order_amount: Decimal::from(order_amount),
            has_prior_orders: false,
            user_usage_count: 0,
        }
    }

    #[test]
    fn expired_is_reported_before_usage_limit() {
        let mut code = promo(DiscountType::Percentage, 20);
        code.end_date = Utc::now() - Duration::hours(1);
        code.start_date = code.end_date - Duration::days(10);
        code.usage_limit = Some(5);
        code.times_used = 5;

        assert_eq!(code.evaluate(&ctx(200)), Err(PromoRejection::Expired));
    }

    #[test]
    fn inactive_beats_every_other_reason() {
        let mut code = promo(DiscountType::Fixed, 10);
        code.is_active = false;
        code.start_date = Utc::now() + Duration::days(1);
        code.end_date = code.start_date + Duration::days(1);
        code.minimum_order_amount = Decimal::from(1000);

        assert_eq!(code.evaluate(&ctx(10)), Err(PromoRejection::NotActive));
    }

    #[test]
    fn checks_run_in_documented_order() {
        let mut code = promo(DiscountType::Fixed, 10);
        code.start_date = Utc::now() + Duration::days(1);
        code.end_date = code.start_date + Duration::days(1);
        assert_eq!(code.evaluate(&ctx(10)), Err(PromoRejection::NotYetActive));

        let mut code = promo(DiscountType::Fixed, 10);
        code.usage_limit = Some(1);
        code.times_used = 1;
        code.minimum_order_amount = Decimal::from(500);
        assert_eq!(code.evaluate(&ctx(10)), Err(PromoRejection::UsageLimitReached));

        let mut code = promo(DiscountType::Fixed, 10);
        code.minimum_order_amount = Decimal::from(500);
        code.first_time_only = true;
        let repeat_customer = Eligibility {
            has_prior_orders: true,
            ..ctx(10)
        };
        assert_eq!(
            code.evaluate(&repeat_customer),
            Err(PromoRejection::MinimumOrderNotMet)
        );

        let mut code = promo(DiscountType::Fixed, 10);
        code.first_time_only = true;
        code.usage_limit_per_user = Some(1);
        let exhausted = Eligibility {
            has_prior_orders: true,
            user_usage_count: 1,
            ..ctx(10)
        };
        assert_eq!(code.evaluate(&exhausted), Err(PromoRejection::FirstTimeOnly));

        code.first_time_only = false;
        assert_eq!(
            code.evaluate(&exhausted),
            Err(PromoRejection::PerUserLimitReached)
        );
        assert_eq!(code.evaluate(&ctx(10)), Ok(()));
    }

    #[test]
    fn percentage_discount_is_capped() {
        let mut code = promo(DiscountType::Percentage, 20);
        code.max_discount_amount = Some(Decimal::from(30));

        let discount = code.calculate_discount(Decimal::from(200));
        assert_eq!(discount.amount, Decimal::from(30));
        assert!(!discount.free_delivery);

        let small = code.calculate_discount(Decimal::from(100));
        assert_eq!(small.amount, Decimal::from(20));
    }

    #[test]
    fn percentage_discount_rounds_to_cents() {
        let code = promo(DiscountType::Percentage, 15);
        let discount = code.calculate_discount(Decimal::new(3333, 2));
        assert_eq!(discount.amount, Decimal::new(500, 2));
    }

    #[test]
    fn fixed_discount_never_exceeds_order() {
        let code = promo(DiscountType::Fixed, 150);
        assert_eq!(
            code.calculate_discount(Decimal::from(90)).amount,
            Decimal::from(90)
        );
        assert_eq!(
            code.calculate_discount(Decimal::from(400)).amount,
            Decimal::from(150)
        );
    }

    #[test]
    fn free_delivery_discounts_nothing_but_waives_delivery() {
        let code = promo(DiscountType::FreeDelivery, 0);
        let discount = code.calculate_discount(Decimal::from(400));
        assert_eq!(discount.amount, Decimal::ZERO);
        assert!(discount.free_delivery);
    }

    #[test]
    fn codes_normalize_to_trimmed_upper_case() {
        assert_eq!(PromoCode::normalize_code("  save20 \n"), "SAVE20");
    }

    #[test]
    fn definition_invariants_are_enforced() {
        assert!(promo(DiscountType::Percentage, 20).validate_definition().is_ok());
        assert!(promo(DiscountType::Percentage, 120).validate_definition().is_err());
        assert!(promo(DiscountType::Fixed, 0).validate_definition().is_err());
        assert!(promo(DiscountType::FreeDelivery, 5).validate_definition().is_err());

        let mut backwards = promo(DiscountType::Fixed, 10);
        backwards.end_date = backwards.start_date;
        assert!(backwards.validate_definition().is_err());

        let mut lower = promo(DiscountType::Fixed, 10);
        lower.code = "save".into();
        assert!(lower.validate_definition().is_err());
    }

    #[test]
    fn usage_limits_recheck_counts() {
        let mut code = promo(DiscountType::Fixed, 10);
        code.usage_limit_per_user = Some(2);
        assert_eq!(check_usage_limits(&code, 1), Ok(()));
        assert_eq!(
            check_usage_limits(&code, 2),
            Err(PromoRejection::PerUserLimitReached)
        );
    }
}
