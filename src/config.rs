use std::{env, str::FromStr};

use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub checkout: CheckoutSettings,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_or("APP_PORT", 3000);
        Ok(Self {
            port,
            database_url,
            host,
            checkout: CheckoutSettings::from_env(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    /// Charged on `delivery` orders unless a promo grants free delivery.
    pub delivery_charge: Decimal,
    pub loyalty: LoyaltySettings,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            delivery_charge: Decimal::from(40),
            loyalty: LoyaltySettings::default(),
        }
    }
}

impl CheckoutSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            delivery_charge: env_or("DELIVERY_CHARGE", defaults.delivery_charge),
            loyalty: LoyaltySettings::from_env(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoyaltySettings {
    pub max_points_per_order: i64,
    /// Upper bound on the share of the subtotal payable with points.
    pub max_order_share_percent: i64,
    pub earn_divisor: i64,
    pub min_earn: i64,
    pub expiry_days: i64,
}

impl Default for LoyaltySettings {
    fn default() -> Self {
        Self {
            max_points_per_order: 1000,
            max_order_share_percent: 50,
            earn_divisor: 10,
            min_earn: 10,
            expiry_days: 365,
        }
    }
}

impl LoyaltySettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_points_per_order: env_or(
                "LOYALTY_MAX_POINTS_PER_ORDER",
                defaults.max_points_per_order,
            ),
            max_order_share_percent: env_or(
                "LOYALTY_MAX_ORDER_SHARE_PERCENT",
                defaults.max_order_share_percent,
            ),
            earn_divisor: env_or("LOYALTY_EARN_DIVISOR", defaults.earn_divisor).max(1),
            min_earn: env_or("LOYALTY_MIN_EARN", defaults.min_earn),
            expiry_days: env_or("LOYALTY_EXPIRY_DAYS", defaults.expiry_days),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}
