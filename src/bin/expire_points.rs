//! Scheduled job: expires loyalty points whose grant window has passed.
//! Meant to run daily from cron or a Kubernetes CronJob.

use chrono::Utc;
use food_order_core::{
    config::AppConfig,
    db::{create_orm_conn, create_pool},
    services::loyalty_service,
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,food_order_core=debug".into()),
        )
        .init();

    let config = AppConfig::from_env()?;
    let orm = create_orm_conn(&config.database_url).await?;
    let pool = create_pool(&config.database_url).await?;
    let state = AppState::postgres(orm, pool, config.checkout);

    let report = loyalty_service::expire(&state, Utc::now())
        .await
        .map_err(|err| anyhow::anyhow!("points expiry failed: {err}"))?;

    println!(
        "Expired {} points across {} users ({} failures)",
        report.points_expired, report.users, report.failures
    );
    if report.failures > 0 {
        anyhow::bail!("{} users could not be processed", report.failures);
    }
    Ok(())
}
