//! Postgres store built on sea-orm.
//!
//! Cross-row invariants are enforced with row locks inside a transaction:
//! the promo row guards usage limits and the user row guards the ledger.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, LockType, OnConflict, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityName, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
    prelude::DateTimeWithTimeZone,
};
use uuid::Uuid;

use crate::{
    entity::{
        cart_lines::{self, Column as CartLineCol, Entity as CartLines},
        carts::{self, Column as CartCol, Entity as Carts},
        loyalty_expirations::{self, Column as ExpirationCol, Entity as LoyaltyExpirations},
        loyalty_transactions::{self, Column as LedgerCol, Entity as LoyaltyTransactions},
        menu_items::Entity as MenuItems,
        order_items::{self, Column as OrderItemCol, Entity as OrderItems},
        orders::{self, Column as OrderCol, Entity as Orders},
        promo_code_usages::{self, Column as UsageCol, Entity as PromoCodeUsages},
        promo_codes::{self, Column as PromoCol, Entity as PromoCodes},
        restaurants::Entity as Restaurants,
        users::{self, Column as UserCol, Entity as Users},
    },
    models::{
        Cart, CartLine, CatalogItem, LoyaltyTransaction, Order, OrderLine, OrderStatus,
        PaymentStatus, PromoCode, PromoCodeUsage, TransactionType,
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

#[derive(Debug, Clone)]
pub struct PgStore {
    orm: DatabaseConnection,
}

impl PgStore {
    pub fn new(orm: DatabaseConnection) -> Self {
        Self { orm }
    }

    pub fn conn(&self) -> &DatabaseConnection {
        &self.orm
    }
}

fn parse<T: FromStr<Err = String>>(raw: &str) -> Result<T, StoreError> {
    raw.parse().map_err(StoreError::Corrupt)
}

fn utc(at: DateTimeWithTimeZone) -> DateTime<Utc> {
    at.with_timezone(&Utc)
}

fn quantity_to_db(quantity: u32) -> Result<i32, StoreError> {
    i32::try_from(quantity).map_err(|_| StoreError::Corrupt(format!("quantity {quantity}")))
}

fn quantity_from_db(quantity: i32) -> Result<u32, StoreError> {
    u32::try_from(quantity).map_err(|_| StoreError::Corrupt(format!("quantity {quantity}")))
}

fn promo_from_entity(row: promo_codes::Model) -> Result<PromoCode, StoreError> {
    Ok(PromoCode {
        id: row.id,
        code: row.code,
        discount_type: parse(&row.discount_type)?,
        discount_value: row.discount_value,
        minimum_order_amount: row.minimum_order_amount,
        max_discount_amount: row.max_discount_amount,
        usage_limit: row.usage_limit,
        usage_limit_per_user: row.usage_limit_per_user,
        start_date: utc(row.start_date),
        end_date: utc(row.end_date),
        restaurant_id: row.restaurant_id,
        first_time_only: row.first_time_only,
        is_active: row.is_active,
        times_used: row.times_used,
    })
}

fn transaction_from_entity(row: loyalty_transactions::Model) -> Result<LoyaltyTransaction, StoreError> {
    Ok(LoyaltyTransaction {
        id: row.id,
        user_id: row.user_id,
        seq: row.seq,
        transaction_type: parse(&row.transaction_type)?,
        points: row.points,
        balance_after: row.balance_after,
        order_id: row.order_id,
        description: row.description,
        expires_at: row.expires_at.map(utc),
        created_at: utc(row.created_at),
    })
}

fn order_from_entity(row: orders::Model, items: Vec<order_items::Model>) -> Result<Order, StoreError> {
    let lines = items
        .into_iter()
        .map(|item| {
            Ok(OrderLine {
                item_id: item.item_id,
                name: item.name,
                quantity: quantity_from_db(item.quantity)?,
                unit_price: item.unit_price,
                line_subtotal: item.line_subtotal,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    Ok(Order {
        id: row.id,
        user_id: row.user_id,
        lines,
        subtotal: row.subtotal,
        discount_amount: row.discount_amount,
        delivery_charge: row.delivery_charge,
        free_delivery_applied: row.free_delivery_applied,
        points_used: row.points_used,
        points_discount: row.points_discount,
        final_total: row.final_total,
        promo_code_id: row.promo_code_id,
        delivery_method: parse(&row.delivery_method)?,
        payment_method: parse(&row.payment_method)?,
        status: parse(&row.status)?,
        payment_status: parse(&row.payment_status)?,
        created_at: utc(row.created_at),
        updated_at: utc(row.updated_at),
    })
}

/// Accounts live in the auth service. Make sure a local row exists to hang
/// the balance and the ledger lock on.
async fn ensure_user(txn: &DatabaseTransaction, user_id: Uuid) -> Result<(), StoreError> {
    Users::insert(users::ActiveModel {
        id: Set(user_id),
        email: Set(None),
        role: Set("customer".into()),
        loyalty_points: Set(0),
        created_at: Set(Utc::now().fixed_offset()),
    })
    .on_conflict(OnConflict::column(UserCol::Id).do_nothing().to_owned())
    .exec_without_returning(txn)
    .await?;
    Ok(())
}

async fn admit_usage(
    txn: &DatabaseTransaction,
    usage: &PromoCodeUsage,
) -> Result<UsageOutcome, StoreError> {
    let promo = PromoCodes::find_by_id(usage.promo_code_id)
        .lock(LockType::Update)
        .one(txn)
        .await?
        .ok_or(StoreError::NotFound)?;

    let duplicate = PromoCodeUsages::find()
        .filter(UsageCol::UserId.eq(usage.user_id))
        .filter(UsageCol::OrderId.eq(usage.order_id))
        .one(txn)
        .await?;
    if duplicate.is_some() {
        return Ok(UsageOutcome::Duplicate);
    }

    let user_count = PromoCodeUsages::find()
        .filter(UsageCol::PromoCodeId.eq(usage.promo_code_id))
        .filter(UsageCol::UserId.eq(usage.user_id))
        .count(txn)
        .await? as i64;
    promo_service::check_usage_limits(&promo_from_entity(promo)?, user_count)
        .map_err(StoreError::PromoExhausted)?;

    promo_code_usages::ActiveModel {
        id: Set(usage.id),
        promo_code_id: Set(usage.promo_code_id),
        user_id: Set(usage.user_id),
        order_id: Set(usage.order_id),
        discount_amount: Set(usage.discount_amount),
        free_delivery_applied: Set(usage.free_delivery_applied),
        used_at: Set(usage.used_at.fixed_offset()),
    }
    .insert(txn)
    .await?;

    PromoCodes::update_many()
        .col_expr(PromoCol::TimesUsed, Expr::col(PromoCol::TimesUsed).add(1))
        .filter(PromoCol::Id.eq(usage.promo_code_id))
        .exec(txn)
        .await?;

    Ok(UsageOutcome::Recorded)
}

async fn stored_cart_version(txn: &DatabaseTransaction, session_id: Uuid) -> Result<i64, StoreError> {
    Ok(Carts::find_by_id(session_id)
        .one(txn)
        .await?
        .map(|row| row.version)
        .unwrap_or(0))
}

#[async_trait]
impl CatalogAdapter for PgStore {
    async fn lookup(&self, item_id: Uuid) -> Result<Option<CatalogItem>, StoreError> {
        let found = MenuItems::find_by_id(item_id)
            .find_also_related(Restaurants)
            .one(&self.orm)
            .await?;

        Ok(found.map(|(item, restaurant)| CatalogItem {
            item_id: item.id,
            name: item.name,
            unit_price: item.price,
            is_available: item.is_available,
            restaurant_id: item.restaurant_id,
            restaurant_active: restaurant.is_some_and(|r| r.is_active),
        }))
    }
}

#[async_trait]
impl CartStore for PgStore {
    async fn load(&self, session_id: Uuid) -> Result<Cart, StoreError> {
        let Some(row) = Carts::find_by_id(session_id).one(&self.orm).await? else {
            return Ok(Cart::new(session_id));
        };

        let mut lines = BTreeMap::new();
        for line in CartLines::find()
            .filter(CartLineCol::SessionId.eq(session_id))
            .all(&self.orm)
            .await?
        {
            lines.insert(
                line.item_id,
                CartLine {
                    item_id: line.item_id,
                    name: line.name,
                    restaurant_id: line.restaurant_id,
                    quantity: quantity_from_db(line.quantity)?,
                    unit_price: line.unit_price,
                },
            );
        }

        Ok(Cart {
            session_id,
            lines,
            applied_promo_code_id: row.applied_promo_code_id,
            version: row.version,
        })
    }

    async fn save(&self, cart: &Cart, expected_version: i64) -> Result<(), StoreError> {
        let txn = self.orm.begin().await?;
        let now = Utc::now().fixed_offset();

        let written = if expected_version == 0 {
            Carts::insert(carts::ActiveModel {
                session_id: Set(cart.session_id),
                applied_promo_code_id: Set(cart.applied_promo_code_id),
                version: Set(cart.version),
                updated_at: Set(now),
            })
            .on_conflict(OnConflict::column(CartCol::SessionId).do_nothing().to_owned())
            .exec_without_returning(&txn)
            .await?
        } else {
            Carts::update_many()
                .col_expr(CartCol::Version, Expr::value(cart.version))
                .col_expr(
                    CartCol::AppliedPromoCodeId,
                    Expr::value(cart.applied_promo_code_id),
                )
                .col_expr(CartCol::UpdatedAt, Expr::value(now))
                .filter(CartCol::SessionId.eq(cart.session_id))
                .filter(CartCol::Version.eq(expected_version))
                .exec(&txn)
                .await?
                .rows_affected
        };

        if written == 0 {
            let current = stored_cart_version(&txn, cart.session_id).await?;
            return Err(StoreError::VersionConflict { current });
        }

        CartLines::delete_many()
            .filter(CartLineCol::SessionId.eq(cart.session_id))
            .exec(&txn)
            .await?;

        let mut rows = Vec::with_capacity(cart.lines.len());
        for line in cart.lines.values() {
            rows.push(cart_lines::ActiveModel {
                id: Set(Uuid::new_v4()),
                session_id: Set(cart.session_id),
                item_id: Set(line.item_id),
                name: Set(line.name.clone()),
                restaurant_id: Set(line.restaurant_id),
                quantity: Set(quantity_to_db(line.quantity)?),
                unit_price: Set(line.unit_price),
                created_at: Set(now),
            });
        }
        if !rows.is_empty() {
            CartLines::insert_many(rows).exec_without_returning(&txn).await?;
        }

        txn.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PromoStore for PgStore {
    async fn find_by_code(&self, code: &str) -> Result<Option<PromoCode>, StoreError> {
        PromoCodes::find()
            .filter(PromoCol::Code.eq(code))
            .one(&self.orm)
            .await?
            .map(promo_from_entity)
            .transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PromoCode>, StoreError> {
        PromoCodes::find_by_id(id)
            .one(&self.orm)
            .await?
            .map(promo_from_entity)
            .transpose()
    }

    async fn usage_count(&self, promo_code_id: Uuid, user_id: Uuid) -> Result<i64, StoreError> {
        let count = PromoCodeUsages::find()
            .filter(UsageCol::PromoCodeId.eq(promo_code_id))
            .filter(UsageCol::UserId.eq(user_id))
            .count(&self.orm)
            .await?;
        Ok(count as i64)
    }

    async fn record_usage(&self, usage: &PromoCodeUsage) -> Result<UsageOutcome, StoreError> {
        let txn = self.orm.begin().await?;
        let outcome = admit_usage(&txn, usage).await?;
        txn.commit().await?;
        Ok(outcome)
    }

    async fn insert(&self, promo: &PromoCode) -> Result<(), StoreError> {
        promo.validate_definition().map_err(StoreError::Corrupt)?;
        promo_codes::ActiveModel {
            id: Set(promo.id),
            code: Set(promo.code.clone()),
            discount_type: Set(promo.discount_type.as_str().to_string()),
            discount_value: Set(promo.discount_value),
            minimum_order_amount: Set(promo.minimum_order_amount),
            max_discount_amount: Set(promo.max_discount_amount),
            usage_limit: Set(promo.usage_limit),
            usage_limit_per_user: Set(promo.usage_limit_per_user),
            start_date: Set(promo.start_date.fixed_offset()),
            end_date: Set(promo.end_date.fixed_offset()),
            restaurant_id: Set(promo.restaurant_id),
            first_time_only: Set(promo.first_time_only),
            is_active: Set(promo.is_active),
            times_used: Set(promo.times_used),
            created_at: Set(Utc::now().fixed_offset()),
        }
        .insert(&self.orm)
        .await
        .map_err(|err| match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                StoreError::Duplicate(format!("promo code {}", promo.code))
            }
            _ => StoreError::Db(err),
        })?;
        Ok(())
    }
}

#[async_trait]
impl LoyaltyStore for PgStore {
    async fn balance(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(Users::find_by_id(user_id)
            .one(&self.orm)
            .await?
            .map(|user| user.loyalty_points)
            .unwrap_or(0))
    }

    async fn history(
        &self,
        user_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<LoyaltyTransaction>, u64), StoreError> {
        let finder = LoyaltyTransactions::find()
            .filter(LedgerCol::UserId.eq(user_id))
            .order_by_desc(LedgerCol::Seq);
        let total = finder.clone().count(&self.orm).await?;

        let entries = finder
            .limit(limit)
            .offset(offset)
            .all(&self.orm)
            .await?
            .into_iter()
            .map(transaction_from_entity)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((entries, total))
    }

    async fn find_for_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        kind: TransactionType,
    ) -> Result<Option<LoyaltyTransaction>, StoreError> {
        LoyaltyTransactions::find()
            .filter(LedgerCol::UserId.eq(user_id))
            .filter(LedgerCol::OrderId.eq(order_id))
            .filter(LedgerCol::TransactionType.eq(kind.as_str()))
            .order_by_desc(LedgerCol::Seq)
            .one(&self.orm)
            .await?
            .map(transaction_from_entity)
            .transpose()
    }

    async fn expiring(&self, now: DateTime<Utc>) -> Result<Vec<LoyaltyTransaction>, StoreError> {
        LoyaltyTransactions::find()
            .filter(LedgerCol::TransactionType.eq(TransactionType::Earned.as_str()))
            .filter(LedgerCol::ExpiresAt.lte(now.fixed_offset()))
            .filter(
                LedgerCol::Id.not_in_subquery(
                    Query::select()
                        .column(ExpirationCol::EarnedTransactionId)
                        .from(LoyaltyExpirations.table_ref())
                        .to_owned(),
                ),
            )
            .order_by_asc(LedgerCol::UserId)
            .order_by_asc(LedgerCol::Seq)
            .all(&self.orm)
            .await?
            .into_iter()
            .map(transaction_from_entity)
            .collect()
    }

    async fn append(&self, request: LedgerAppend) -> Result<AppendOutcome, StoreError> {
        let txn = self.orm.begin().await?;
        let user_id = request.user_id;
        let kind = request.movement.kind();

        ensure_user(&txn, user_id).await?;
        let user = Users::find_by_id(user_id)
            .lock(LockType::Update)
            .one(&txn)
            .await?
            .ok_or(StoreError::NotFound)?;

        let prior = match (request.movement.once_per_order(), request.order_id) {
            (true, Some(order_id)) => LoyaltyTransactions::find()
                .filter(LedgerCol::UserId.eq(user_id))
                .filter(LedgerCol::OrderId.eq(order_id))
                .filter(LedgerCol::TransactionType.eq(kind.as_str()))
                .one(&txn)
                .await?
                .map(transaction_from_entity)
                .transpose()?,
            _ => None,
        };

        let grants = if request.consumes.is_empty() {
            Vec::new()
        } else {
            LoyaltyTransactions::find()
                .filter(LedgerCol::UserId.eq(user_id))
                .filter(LedgerCol::TransactionType.eq(TransactionType::Earned.as_str()))
                .filter(LedgerCol::Id.is_in(request.consumes.clone()))
                .filter(
                    LedgerCol::Id.not_in_subquery(
                        Query::select()
                            .column(ExpirationCol::EarnedTransactionId)
                            .from(LoyaltyExpirations.table_ref())
                            .to_owned(),
                    ),
                )
                .all(&txn)
                .await?
                .into_iter()
                .map(transaction_from_entity)
                .collect::<Result<Vec<_>, _>>()?
        };

        let last_seq = LoyaltyTransactions::find()
            .filter(LedgerCol::UserId.eq(user_id))
            .order_by_desc(LedgerCol::Seq)
            .one(&txn)
            .await?
            .map(|row| row.seq)
            .unwrap_or(0);
        let head = LedgerHead {
            balance: user.loyalty_points,
            seq: last_seq,
        };

        let outcome = loyalty_service::decide(&request, head, prior, &grants);
        if let AppendOutcome::Written(entry) = &outcome {
            loyalty_transactions::ActiveModel {
                id: Set(entry.id),
                user_id: Set(entry.user_id),
                seq: Set(entry.seq),
                transaction_type: Set(entry.transaction_type.as_str().to_string()),
                points: Set(entry.points),
                balance_after: Set(entry.balance_after),
                order_id: Set(entry.order_id),
                description: Set(entry.description.clone()),
                expires_at: Set(entry.expires_at.map(|at| at.fixed_offset())),
                created_at: Set(entry.created_at.fixed_offset()),
            }
            .insert(&txn)
            .await?;

            Users::update_many()
                .col_expr(UserCol::LoyaltyPoints, Expr::value(entry.balance_after))
                .filter(UserCol::Id.eq(user_id))
                .exec(&txn)
                .await?;

            for grant in &grants {
                loyalty_expirations::ActiveModel {
                    earned_transaction_id: Set(grant.id),
                    expired_transaction_id: Set(entry.id),
                    created_at: Set(entry.created_at.fixed_offset()),
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        Ok(outcome)
    }
}

#[async_trait]
impl OrderSink for PgStore {
    async fn save_order(
        &self,
        order: &Order,
        usage: Option<&PromoCodeUsage>,
    ) -> Result<Uuid, StoreError> {
        let txn = self.orm.begin().await?;

        if Orders::find_by_id(order.id).one(&txn).await?.is_some() {
            return Ok(order.id);
        }
        if let Some(user_id) = order.user_id {
            ensure_user(&txn, user_id).await?;
        }

        orders::ActiveModel {
            id: Set(order.id),
            user_id: Set(order.user_id),
            subtotal: Set(order.subtotal),
            discount_amount: Set(order.discount_amount),
            delivery_charge: Set(order.delivery_charge),
            free_delivery_applied: Set(order.free_delivery_applied),
            points_used: Set(order.points_used),
            points_discount: Set(order.points_discount),
            final_total: Set(order.final_total),
            promo_code_id: Set(order.promo_code_id),
            delivery_method: Set(order.delivery_method.as_str().to_string()),
            payment_method: Set(order.payment_method.as_str().to_string()),
            status: Set(order.status.as_str().to_string()),
            payment_status: Set(order.payment_status.as_str().to_string()),
            created_at: Set(order.created_at.fixed_offset()),
            updated_at: Set(order.updated_at.fixed_offset()),
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(order.lines.len());
        for (position, line) in order.lines.iter().enumerate() {
            items.push(order_items::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                item_id: Set(line.item_id),
                name: Set(line.name.clone()),
                quantity: Set(quantity_to_db(line.quantity)?),
                unit_price: Set(line.unit_price),
                line_subtotal: Set(line.line_subtotal),
                position: Set(position as i32),
            });
        }
        if !items.is_empty() {
            OrderItems::insert_many(items).exec_without_returning(&txn).await?;
        }

        if let Some(usage) = usage {
            admit_usage(&txn, usage).await?;
        }

        txn.commit().await?;
        Ok(order.id)
    }

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let Some(row) = Orders::find_by_id(id).one(&self.orm).await? else {
            return Ok(None);
        };
        let items = OrderItems::find()
            .filter(OrderItemCol::OrderId.eq(id))
            .order_by_asc(OrderItemCol::Position)
            .all(&self.orm)
            .await?;
        order_from_entity(row, items).map(Some)
    }

    async fn has_orders(&self, user_id: Uuid) -> Result<bool, StoreError> {
        let count = Orders::find()
            .filter(OrderCol::UserId.eq(user_id))
            .count(&self.orm)
            .await?;
        Ok(count > 0)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: (OrderStatus, PaymentStatus),
        to: (OrderStatus, PaymentStatus),
    ) -> Result<Order, StoreError> {
        let result = Orders::update_many()
            .col_expr(OrderCol::Status, Expr::value(to.0.as_str()))
            .col_expr(OrderCol::PaymentStatus, Expr::value(to.1.as_str()))
            .col_expr(OrderCol::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(OrderCol::Id.eq(id))
            .filter(OrderCol::Status.eq(from.0.as_str()))
            .filter(OrderCol::PaymentStatus.eq(from.1.as_str()))
            .exec(&self.orm)
            .await?;

        if result.rows_affected == 0 {
            return match Orders::find_by_id(id).one(&self.orm).await? {
                Some(_) => Err(StoreError::StateConflict),
                None => Err(StoreError::NotFound),
            };
        }

        self.find_order(id).await?.ok_or(StoreError::NotFound)
    }
}
