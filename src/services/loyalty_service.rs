//! Loyalty points ledger.
//!
//! The ledger is append-only. Stores serialize writers per user and call
//! [`decide`] with the balance they read under that lock, so every entry's
//! `balance_after` is the previous one plus its `points`.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    config::LoyaltySettings,
    error::{AppError, AppResult},
    models::{LoyaltyTransaction, TransactionType},
    state::AppState,
    store::{AppendOutcome, LedgerAppend},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Movement {
    Earn {
        points: i64,
        expires_at: DateTime<Utc>,
    },
    Redeem {
        points: i64,
    },
    /// Offsets the grants listed in [`LedgerAppend::consumes`].
    Expire,
    Refund {
        points: i64,
    },
    /// Signed staff adjustment.
    Manual {
        points: i64,
    },
}

impl Movement {
    pub fn kind(&self) -> TransactionType {
        match self {
            Movement::Earn { .. } => TransactionType::Earned,
            Movement::Redeem { .. } => TransactionType::Redeemed,
            Movement::Expire => TransactionType::Expired,
            Movement::Refund { .. } => TransactionType::Refunded,
            Movement::Manual { .. } => TransactionType::Manual,
        }
    }

    /// Movements written at most once per order.
    pub fn once_per_order(&self) -> bool {
        matches!(
            self,
            Movement::Earn { .. } | Movement::Redeem { .. } | Movement::Refund { .. }
        )
    }
}

/// Tail of a user's ledger as read under that user's lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerHead {
    pub balance: i64,
    /// `seq` of the newest entry, 0 for an empty ledger.
    pub seq: i64,
}

/// What to append, given the state read under the user's lock.
///
/// `prior` is an existing entry of the same kind for the same order and
/// `grants` are the still-unexpired earned entries an expiry offsets.
pub fn decide(
    request: &LedgerAppend,
    head: LedgerHead,
    prior: Option<LoyaltyTransaction>,
    grants: &[LoyaltyTransaction],
) -> AppendOutcome {
    if let Some(prior) = prior {
        return AppendOutcome::Duplicate(prior);
    }
    let balance = head.balance;

    let points = match &request.movement {
        Movement::Earn { points, .. } | Movement::Refund { points } => *points,
        Movement::Redeem { points } => {
            if balance < *points {
                return AppendOutcome::Shortfall { available: balance };
            }
            -points
        }
        Movement::Manual { points } => {
            if balance + points < 0 {
                return AppendOutcome::Shortfall { available: balance };
            }
            *points
        }
        Movement::Expire => {
            if grants.is_empty() {
                return AppendOutcome::Skipped;
            }
            // Points already spent are gone; only what is left can expire.
            let due: i64 = grants.iter().map(|grant| grant.points).sum();
            -due.min(balance).max(0)
        }
    };

    let expires_at = match &request.movement {
        Movement::Earn { expires_at, .. } => Some(*expires_at),
        _ => None,
    };

    AppendOutcome::Written(LoyaltyTransaction {
        id: Uuid::new_v4(),
        user_id: request.user_id,
        seq: head.seq + 1,
        transaction_type: request.movement.kind(),
        points,
        balance_after: balance + points,
        order_id: request.order_id,
        description: request.description.clone(),
        expires_at,
        created_at: request.at,
    })
}

/// Most points one order may redeem, before looking at the balance.
pub fn order_cap(settings: &LoyaltySettings, subtotal: Decimal) -> i64 {
    let share = (subtotal.max(Decimal::ZERO) * Decimal::from(settings.max_order_share_percent)
        / Decimal::ONE_HUNDRED)
        .floor()
        .to_i64()
        .unwrap_or(i64::MAX);
    share.min(settings.max_points_per_order).max(0)
}

pub fn redeem_cap(settings: &LoyaltySettings, balance: i64, subtotal: Decimal) -> i64 {
    order_cap(settings, subtotal).min(balance.max(0))
}

pub fn points_for(settings: &LoyaltySettings, amount_charged: Decimal) -> i64 {
    let earned = (amount_charged.max(Decimal::ZERO) / Decimal::from(settings.earn_divisor))
        .floor()
        .to_i64()
        .unwrap_or(0);
    earned.max(settings.min_earn)
}

/// One point is worth one currency unit.
pub fn points_value(points: i64) -> Decimal {
    Decimal::from(points)
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Redemption {
    pub points: i64,
    pub discount: Decimal,
    pub transaction: LoyaltyTransaction,
}

pub async fn balance(state: &AppState, user_id: Uuid) -> AppResult<i64> {
    Ok(state.loyalty.balance(user_id).await?)
}

/// A page of ledger entries, newest first, and the user's total entry count.
pub async fn history(
    state: &AppState,
    user_id: Uuid,
    offset: i64,
    limit: i64,
) -> AppResult<(Vec<LoyaltyTransaction>, i64)> {
    let (entries, total) = state
        .loyalty
        .history(user_id, offset.max(0) as u64, limit.max(0) as u64)
        .await?;
    Ok((entries, total as i64))
}

/// Debits points for an order. The balance is re-verified under the user's
/// lock; a shortfall comes back as [`AppError::InsufficientPoints`] with
/// nothing written.
pub async fn redeem(
    state: &AppState,
    user_id: Uuid,
    points: i64,
    order_id: Uuid,
    subtotal: Decimal,
) -> AppResult<Redemption> {
    if points <= 0 {
        return Err(AppError::Validation("points must be greater than 0".into()));
    }
    let cap = order_cap(&state.settings.loyalty, subtotal);
    if points > cap {
        return Err(AppError::Validation(format!(
            "at most {cap} points can be redeemed on this order"
        )));
    }

    let request = LedgerAppend {
        user_id,
        movement: Movement::Redeem { points },
        order_id: Some(order_id),
        description: format!("Redeemed on order {order_id}"),
        consumes: Vec::new(),
        at: Utc::now(),
    };

    match state.loyalty.append(request).await? {
        AppendOutcome::Written(transaction) | AppendOutcome::Duplicate(transaction) => {
            tracing::info!(
                user_id = %user_id,
                order_id = %order_id,
                points,
                balance_after = transaction.balance_after,
                "points redeemed"
            );
            let points = -transaction.points;
            Ok(Redemption {
                points,
                discount: points_value(points),
                transaction,
            })
        }
        AppendOutcome::Shortfall { available } => Err(AppError::InsufficientPoints {
            requested: points,
            available,
        }),
        AppendOutcome::Skipped => Err(AppError::Internal(anyhow::anyhow!(
            "ledger skipped a redemption"
        ))),
    }
}

/// Credits points for a paid order. A second call for the same order is
/// reported as [`AppError::DuplicateUsage`] and credits nothing.
pub async fn earn(
    state: &AppState,
    user_id: Uuid,
    order_id: Uuid,
    amount_charged: Decimal,
) -> AppResult<LoyaltyTransaction> {
    let settings = &state.settings.loyalty;
    let points = points_for(settings, amount_charged);
    let now = Utc::now();
    let request = LedgerAppend {
        user_id,
        movement: Movement::Earn {
            points,
            expires_at: now + Duration::days(settings.expiry_days),
        },
        order_id: Some(order_id),
        description: format!("Earned on order {order_id}"),
        consumes: Vec::new(),
        at: now,
    };

    match state.loyalty.append(request).await? {
        AppendOutcome::Written(transaction) => {
            tracing::info!(
                user_id = %user_id,
                order_id = %order_id,
                points,
                balance_after = transaction.balance_after,
                "points earned"
            );
            Ok(transaction)
        }
        AppendOutcome::Duplicate(_) => {
            tracing::debug!(order_id = %order_id, "points already earned for order");
            Err(AppError::DuplicateUsage { order_id })
        }
        AppendOutcome::Shortfall { .. } | AppendOutcome::Skipped => Err(AppError::Internal(
            anyhow::anyhow!("ledger refused a credit"),
        )),
    }
}

/// Credits back whatever was redeemed on `order_id`. Returns `None` when
/// nothing was redeemed or the refund already happened.
pub async fn refund_redemption(
    state: &AppState,
    user_id: Uuid,
    order_id: Uuid,
    reason: &str,
) -> AppResult<Option<LoyaltyTransaction>> {
    let Some(redeemed) = state
        .loyalty
        .find_for_order(user_id, order_id, TransactionType::Redeemed)
        .await?
    else {
        return Ok(None);
    };

    let request = LedgerAppend {
        user_id,
        movement: Movement::Refund {
            points: -redeemed.points,
        },
        order_id: Some(order_id),
        description: format!("Refunded for order {order_id}: {reason}"),
        consumes: Vec::new(),
        at: Utc::now(),
    };

    match state.loyalty.append(request).await? {
        AppendOutcome::Written(transaction) => {
            tracing::info!(
                user_id = %user_id,
                order_id = %order_id,
                points = transaction.points,
                reason,
                "redeemed points refunded"
            );
            Ok(Some(transaction))
        }
        _ => Ok(None),
    }
}

pub async fn adjust(
    state: &AppState,
    user_id: Uuid,
    points: i64,
    description: &str,
) -> AppResult<LoyaltyTransaction> {
    if points == 0 {
        return Err(AppError::Validation("adjustment must not be zero".into()));
    }
    let request = LedgerAppend {
        user_id,
        movement: Movement::Manual { points },
        order_id: None,
        description: description.to_string(),
        consumes: Vec::new(),
        at: Utc::now(),
    };
    match state.loyalty.append(request).await? {
        AppendOutcome::Written(transaction) => Ok(transaction),
        AppendOutcome::Shortfall { available } => Err(AppError::InsufficientPoints {
            requested: -points,
            available,
        }),
        _ => Err(AppError::Internal(anyhow::anyhow!(
            "ledger refused an adjustment"
        ))),
    }
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct ExpiryReport {
    pub users: usize,
    pub points_expired: i64,
    pub failures: usize,
    pub entries: Vec<LoyaltyTransaction>,
}

/// Expires every earned grant whose `expires_at` has passed, one `expired`
/// entry per user. Safe to run repeatedly.
pub async fn expire(state: &AppState, now: DateTime<Utc>) -> AppResult<ExpiryReport> {
    let mut by_user: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for grant in state.loyalty.expiring(now).await? {
        by_user.entry(grant.user_id).or_default().push(grant.id);
    }

    let mut report = ExpiryReport::default();
    for (user_id, grant_ids) in by_user {
        let request = LedgerAppend {
            user_id,
            movement: Movement::Expire,
            order_id: None,
            description: format!("Expired {} grant(s)", grant_ids.len()),
            consumes: grant_ids,
            at: now,
        };
        match state.loyalty.append(request).await {
            Ok(AppendOutcome::Written(entry)) => {
                report.users += 1;
                report.points_expired += -entry.points;
                report.entries.push(entry);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "points expiry failed");
                report.failures += 1;
            }
        }
    }

    tracing::info!(
        users = report.users,
        points = report.points_expired,
        failures = report.failures,
        "points expiry finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(movement: Movement) -> LedgerAppend {
        LedgerAppend {
            user_id: Uuid::nil(),
            movement,
            order_id: Some(Uuid::nil()),
            description: String::new(),
            consumes: Vec::new(),
            at: Utc::now(),
        }
    }

    fn head(balance: i64) -> LedgerHead {
        LedgerHead { balance, seq: 0 }
    }

    fn written(outcome: AppendOutcome) -> LoyaltyTransaction {
        match outcome {
            AppendOutcome::Written(entry) => entry,
            other => panic!("expected a write, got {other:?}"),
        }
    }

    fn grant(points: i64) -> LoyaltyTransaction {
        written(decide(
            &request(Movement::Earn {
                points,
                expires_at: Utc::now(),
            }),
            head(0),
            None,
            &[],
        ))
    }

    #[test]
    fn balance_after_chains_from_previous_entry() {
        let earned = grant(120);
        assert_eq!(earned.balance_after, 120);

        let redeemed = written(decide(
            &request(Movement::Redeem { points: 45 }),
            LedgerHead {
                balance: earned.balance_after,
                seq: earned.seq,
            },
            None,
            &[],
        ));
        assert_eq!(redeemed.points, -45);
        assert_eq!(redeemed.balance_after, earned.balance_after + redeemed.points);
        assert_eq!(redeemed.seq, earned.seq + 1);
    }

    #[test]
    fn redeem_beyond_balance_is_a_shortfall() {
        assert_eq!(
            decide(&request(Movement::Redeem { points: 80 }), head(50), None, &[]),
            AppendOutcome::Shortfall { available: 50 }
        );
    }

    #[test]
    fn second_write_for_an_order_is_a_duplicate() {
        let first = grant(10);
        let outcome = decide(
            &request(Movement::Earn {
                points: 10,
                expires_at: Utc::now(),
            }),
            head(10),
            Some(first.clone()),
            &[],
        );
        assert_eq!(outcome, AppendOutcome::Duplicate(first));
    }

    #[test]
    fn expiry_only_takes_what_is_left() {
        let earned = grant(100);
        let mut expiry = request(Movement::Expire);
        expiry.consumes = vec![earned.id];

        let entry = written(decide(&expiry, head(70), None, &[earned]));
        assert_eq!(entry.points, -70);
        assert_eq!(entry.balance_after, 0);
        assert_eq!(entry.expires_at, None);
    }

    #[test]
    fn expiry_with_nothing_pending_is_skipped() {
        assert_eq!(
            decide(&request(Movement::Expire), head(70), None, &[]),
            AppendOutcome::Skipped
        );
    }

    #[test]
    fn redeem_cap_is_half_the_order_and_at_most_a_thousand() {
        let settings = LoyaltySettings::default();
        assert_eq!(redeem_cap(&settings, 500, Decimal::from(200)), 100);
        assert_eq!(redeem_cap(&settings, 40, Decimal::from(200)), 40);
        assert_eq!(redeem_cap(&settings, 5000, Decimal::from(9000)), 1000);
        assert_eq!(redeem_cap(&settings, 500, Decimal::new(1999, 2)), 9);
    }

    #[test]
    fn earn_is_a_tenth_with_a_floor_of_ten() {
        let settings = LoyaltySettings::default();
        assert_eq!(points_for(&settings, Decimal::from(210)), 21);
        assert_eq!(points_for(&settings, Decimal::new(9999, 2)), 10);
        assert_eq!(points_for(&settings, Decimal::from(1239)), 123);
    }
}
