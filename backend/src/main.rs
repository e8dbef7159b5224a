use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_ledger_backend::{
    config::Config,
    runtime::{shutdown_signal, LedgerRuntime},
};

fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "<empty>".into();
    }
    let prefix = s.chars().take(4).collect::<String>();
    format!("{}*** (len={})", prefix, s.len())
}

/// Hides the password part of a connection URL.
fn mask_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => mask_secret(raw),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!(
        database_url = %mask_url(&config.database_url),
        nats_url = %mask_url(&config.nats_url),
        nats_stream = %config.nats_stream,
        ledger_name = %config.ledger_name,
        subjects = ?config.ingestion_subjects,
        transit_backend = ?config.transit_backend,
        kms_key_id = %config.kms_key_id,
        local_transit_key = %mask_secret(&config.local_transit_key),
        envelope_integrity_key = %mask_secret(&config.envelope_integrity_key),
        partition_lookahead_months = config.partition_lookahead_months,
        time_zone = %config.time_zone,
        "Loaded configuration from environment/.env"
    );

    let bind_addr = config.http_bind_addr;
    let runtime = LedgerRuntime::init(config).await?;
    let app = runtime.router();
    let cancel = runtime.cancellation();

    tracing::info!("Server listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = cancel.cancelled() => {}
            }
        })
        .await;

    runtime.close().await;
    served?;
    Ok(())
}
