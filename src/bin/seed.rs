use chrono::{Duration, Utc};
use food_order_core::{
    config::AppConfig,
    db::{create_orm_conn, create_pool, run_migrations},
};
use rust_decimal::Decimal;
use uuid::Uuid;

// Fixed ids keep re-runs idempotent and give manual testing stable handles.
const BISTRO_ID: Uuid = Uuid::from_u128(0x6b1f_0c4e_0000_4000_8000_0000_0000_0001);
const NOODLE_BAR_ID: Uuid = Uuid::from_u128(0x6b1f_0c4e_0000_4000_8000_0000_0000_0002);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let orm = create_orm_conn(&config.database_url).await?;
    let pool = create_pool(&config.database_url).await?;
    // Ensure migrations are applied.
    run_migrations(&orm).await?;

    let admin_id = ensure_user(&pool, "admin@example.com", "admin").await?;
    let user_id = ensure_user(&pool, "user@example.com", "customer").await?;
    seed_restaurants(&pool).await?;
    seed_menu(&pool).await?;
    seed_promo_codes(&pool).await?;

    println!("Seed completed. Admin ID: {admin_id}, User ID: {user_id}");
    Ok(())
}

async fn ensure_user(pool: &sqlx::PgPool, email: &str, role: &str) -> anyhow::Result<Uuid> {
    let (user_id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO users (id, email, role)
        VALUES ($1, $2, $3)
        ON CONFLICT (email) DO UPDATE SET role = EXCLUDED.role
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(email)
    .bind(role)
    .fetch_one(pool)
    .await?;

    println!("Ensured user {email} (role={role})");
    Ok(user_id)
}

async fn seed_restaurants(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    for (id, name) in [(BISTRO_ID, "Corner Bistro"), (NOODLE_BAR_ID, "Noodle Bar")] {
        sqlx::query(
            r#"
            INSERT INTO restaurants (id, name, is_active)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;
    }

    println!("Seeded restaurants");
    Ok(())
}

async fn seed_menu(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let items = [
        (1_u128, BISTRO_ID, "Margherita Pizza", 100),
        (2, BISTRO_ID, "Caesar Salad", 80),
        (3, BISTRO_ID, "Tiramisu", 60),
        (4, NOODLE_BAR_ID, "Chicken Ramen", 120),
        (5, NOODLE_BAR_ID, "Pork Dumplings", 70),
    ];

    for (n, restaurant_id, name, price) in items {
        sqlx::query(
            r#"
            INSERT INTO menu_items (id, restaurant_id, name, price, is_available)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(Uuid::from_u128(0x9a3e_0000_0000_4000_8000_0000_0000_0000 + n))
        .bind(restaurant_id)
        .bind(name)
        .bind(Decimal::from(price))
        .execute(pool)
        .await?;
    }

    println!("Seeded menu items");
    Ok(())
}

async fn seed_promo_codes(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let start = Utc::now() - Duration::days(1);
    let end = Utc::now() + Duration::days(90);
    // code, type, value, minimum, cap, per-user limit, restaurant, first-time only
    let codes: [(&str, &str, i64, i64, Option<i64>, Option<i32>, Option<Uuid>, bool); 4] = [
        ("SAVE20", "percentage", 20, 100, Some(30), Some(3), None, false),
        ("WELCOME50", "fixed", 50, 150, None, Some(1), None, true),
        ("FREESHIP", "free_delivery", 0, 0, None, None, None, false),
        ("NOODLES10", "percentage", 10, 0, None, None, Some(NOODLE_BAR_ID), false),
    ];

    for (code, discount_type, value, minimum, cap, per_user, restaurant_id, first_time_only) in codes
    {
        sqlx::query(
            r#"
            INSERT INTO promo_codes (
                id, code, discount_type, discount_value, minimum_order_amount,
                max_discount_amount, usage_limit_per_user, start_date, end_date,
                restaurant_id, first_time_only
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(code)
        .bind(discount_type)
        .bind(Decimal::from(value))
        .bind(Decimal::from(minimum))
        .bind(cap.map(Decimal::from))
        .bind(per_user)
        .bind(start)
        .bind(end)
        .bind(restaurant_id)
        .bind(first_time_only)
        .execute(pool)
        .await?;
    }

    println!("Seeded promo codes");
    Ok(())
}
