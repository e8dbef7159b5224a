//! Startup and shutdown of the service's execution contexts.
//!
//! `LedgerRuntime::init` builds every component from a validated `Config`
//! and spawns the background tasks: the partition timer and one ingestion
//! loop per subject. The HTTP server is run by the caller over `router()`.
//! `close` cancels the tasks, waits for them and closes the pool.

use axum::Router;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    build_router,
    config::Config,
    db::connection::{create_pool, DbPool},
    messaging::{jetstream::JetStreamMessageLog, MessageLog},
    repositories::{PgAuditEventRepository, PgConsentRepository, PgPartitionRepository},
    services::{AuditIngestionConsumer, AuditQueryService, ConsentLedger, PartitionLifecycleManager},
    state::AppState,
    utils::{envelope::EnvelopeEncryptor, kms::transit_backend_from_config},
};

pub struct LedgerRuntime {
    pool: DbPool,
    state: AppState,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl LedgerRuntime {
    pub async fn init(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let pool = create_pool(&config).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let backend = transit_backend_from_config(&config).await?;
        let encryptor = EnvelopeEncryptor::from_config(&config, backend);

        let audit_events = Arc::new(PgAuditEventRepository::new(pool.clone()));
        let consents = Arc::new(PgConsentRepository::new(pool.clone()));
        let partitions = Arc::new(PgPartitionRepository::new(pool.clone()));

        let manager = Arc::new(PartitionLifecycleManager::from_config(
            &config,
            partitions,
        ));
        // Provision before the first message is pulled.
        manager.tick().await;

        let consent = Arc::new(ConsentLedger::new(
            consents.clone(),
            encryptor.clone(),
            Arc::clone(&manager),
        ));
        let consumer = Arc::new(AuditIngestionConsumer::new(
            encryptor.clone(),
            audit_events.clone(),
            Arc::clone(&manager),
            Arc::clone(&consent),
            config.ingestion_retry_delay(),
        ));
        let log: Arc<dyn MessageLog> = Arc::new(JetStreamMessageLog::connect(&config).await?);

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(&manager).run(cancel.child_token()));
        for subject in &config.ingestion_subjects {
            tasks.spawn(Arc::clone(&consumer).run(
                Arc::clone(&log),
                subject.clone(),
                cancel.child_token(),
            ));
        }
        tracing::info!(
            consumers = config.ingestion_subjects.len(),
            "Ledger runtime started"
        );

        let query = AuditQueryService::new(
            audit_events,
            consents,
            encryptor,
            config.query_decrypt_concurrency,
        );
        let state = AppState::new(config, query, consent);
        Ok(Self {
            pool,
            state,
            cancel,
            tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops pulling new messages, lets in-flight work finish and closes the
    /// connection pool.
    pub async fn close(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "Background task ended abnormally");
            }
        }
        self.pool.close().await;
        tracing::info!("Ledger runtime stopped");
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
