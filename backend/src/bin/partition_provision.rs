//! Runs one partition look-ahead pass and exits. Exits non-zero if any
//! bucket could not be provisioned.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_ledger_backend::{
    config::Config, db::connection::create_pool, repositories::PgPartitionRepository,
    services::PartitionLifecycleManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let pool = create_pool(&config).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let repo = Arc::new(PgPartitionRepository::new(pool.clone()));
    let report = PartitionLifecycleManager::from_config(&config, repo)
        .tick()
        .await;
    pool.close().await;

    tracing::info!(
        tenants = report.tenants,
        created = report.created,
        existing = report.existing,
        failed = report.failed,
        "Partition provisioning finished"
    );
    if report.failed > 0 {
        anyhow::bail!("{} partition(s) could not be provisioned", report.failed);
    }
    Ok(())
}
