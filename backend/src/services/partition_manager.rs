//! Keeps audit event partitions provisioned ahead of need.
//!
//! On every tick each registered tenant gets a partition for the current
//! month bucket and the configured number of future buckets. Creation is
//! create-if-absent at the storage layer, so ticks may overlap with
//! ingestion, with each other, and with other instances.
//!
//! Writers that still hit a missing partition (a late or back-dated event,
//! or a tenant never seen before) go through `write_provisioned`, which
//! creates the bucket of that one event and retries the write.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::Notify, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::LedgerError,
    models::{partition::PartitionSpec, tenant::TenantScope},
    repositories::{PartitionOutcome, PartitionRepositoryTrait},
    utils::time::{bucket_for, lookahead_buckets},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tenants: usize,
    pub created: usize,
    pub existing: usize,
    pub failed: usize,
}

pub struct PartitionLifecycleManager {
    repo: Arc<dyn PartitionRepositoryTrait>,
    lookahead_months: u32,
    time_zone: Tz,
    tick_every: Duration,
    wake: Arc<Notify>,
}

impl PartitionLifecycleManager {
    pub fn new(
        repo: Arc<dyn PartitionRepositoryTrait>,
        lookahead_months: u32,
        time_zone: Tz,
        tick_every: Duration,
    ) -> Self {
        Self {
            repo,
            lookahead_months,
            time_zone,
            tick_every,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn from_config(config: &Config, repo: Arc<dyn PartitionRepositoryTrait>) -> Self {
        Self::new(
            repo,
            config.partition_lookahead_months,
            config.time_zone,
            config.partition_tick(),
        )
    }

    /// Handle that requests an early tick, e.g. after a write hit a missing
    /// partition.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Registers the tenant and creates the partition holding `timestamp`,
    /// wherever it falls relative to the look-ahead window. An early tick is
    /// requested so a newly registered tenant gets its horizon too.
    pub async fn provision_for(
        &self,
        tenant_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<PartitionOutcome, LedgerError> {
        let tenant = TenantScope::new(tenant_id)?;
        if self.repo.register_tenant(&tenant).await? {
            tracing::info!(tenant_id, "Registered new ledger tenant");
        }
        let bucket = bucket_for(timestamp, &self.time_zone);
        let outcome = self
            .repo
            .ensure_partition(&PartitionSpec::new(tenant, bucket))
            .await?;
        tracing::info!(
            tenant_id,
            bucket = %bucket.label(),
            ?outcome,
            "Provisioned partition on demand"
        );
        self.wake.notify_one();
        Ok(outcome)
    }

    /// Runs `write`; on `PartitionMissing` provisions the event's bucket and
    /// runs it once more.
    pub async fn write_provisioned<T, F, Fut>(&self, write: F) -> Result<T, LedgerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        match write().await {
            Err(LedgerError::PartitionMissing {
                tenant_id,
                timestamp,
            }) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    event_timestamp = %timestamp,
                    "Write hit a missing partition"
                );
                self.provision_for(&tenant_id, timestamp).await?;
                write().await
            }
            other => other,
        }
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One provisioning pass. Failures are logged and counted, never raised:
    /// the next tick retries them.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let tenants = match self.repo.list_tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                tracing::error!(error = %err, "Partition tick: listing tenants failed");
                report.failed += 1;
                return report;
            }
        };
        report.tenants = tenants.len();

        let buckets = lookahead_buckets(now, self.lookahead_months, &self.time_zone);
        for tenant in tenants {
            for bucket in &buckets {
                let spec = PartitionSpec::new(tenant.clone(), *bucket);
                match self.repo.ensure_partition(&spec).await {
                    Ok(PartitionOutcome::Created) => report.created += 1,
                    Ok(PartitionOutcome::AlreadyExists) => report.existing += 1,
                    Err(err) => {
                        report.failed += 1;
                        tracing::warn!(
                            tenant_id = %tenant,
                            bucket = %bucket.label(),
                            error = %err,
                            "Partition tick: creation failed, will retry next tick"
                        );
                    }
                }
            }
        }

        if report.created > 0 || report.failed > 0 {
            tracing::info!(
                tenants = report.tenants,
                created = report.created,
                failed = report.failed,
                "Partition tick finished"
            );
        } else {
            tracing::debug!(tenants = report.tenants, "Partition tick: nothing to create");
        }
        report
    }

    /// Ticks until `cancel` fires. Cancellation is observed between ticks.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.tick_every.as_secs(),
            lookahead_months = self.lookahead_months,
            time_zone = %self.time_zone,
            "Partition lifecycle manager started"
        );

        let mut interval = tokio::time::interval(self.tick_every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Partition lifecycle manager stopping");
                    break;
                }
                _ = interval.tick() => {}
                _ = self.wake.notified() => {
                    tracing::debug!("Partition tick requested early");
                }
            }
            self.tick().await;
        }
    }
}
