use async_trait::async_trait;
use chrono::SecondsFormat;
use sqlx::PgPool;

use crate::{
    error::LedgerError,
    models::{
        partition::{PartitionSpec, AUDIT_EVENTS_TABLE},
        tenant::TenantScope,
    },
    repositories::common::is_duplicate_object,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionOutcome {
    Created,
    AlreadyExists,
}

/// Tenant registry and partition DDL. Every operation is create-if-absent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PartitionRepositoryTrait: Send + Sync {
    async fn list_tenants(&self) -> Result<Vec<TenantScope>, LedgerError>;

    /// Returns `true` when the tenant was not registered before.
    async fn register_tenant(&self, tenant: &TenantScope) -> Result<bool, LedgerError>;

    async fn ensure_partition(&self, spec: &PartitionSpec)
        -> Result<PartitionOutcome, LedgerError>;
}

#[derive(Clone)]
pub struct PgPartitionRepository {
    pool: PgPool,
}

impl PgPartitionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn table_exists(&self, name: &str) -> Result<bool, LedgerError> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Runs one partition DDL statement; losing a creation race is success.
    async fn create_if_absent(&self, ddl: &str) -> Result<(), LedgerError> {
        match sqlx::query(ddl).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_object(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// DDL cannot take bind parameters. Tenant ids are restricted to
/// `[A-Za-z0-9_-]`, and quotes are doubled anyway.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn tenant_partition_ddl(spec: &PartitionSpec) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES IN ({}) \
         PARTITION BY RANGE (event_timestamp)",
        spec.tenant_table(),
        AUDIT_EVENTS_TABLE,
        quote_literal(spec.tenant.as_str())
    )
}

pub(crate) fn month_partition_ddl(spec: &PartitionSpec) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES FROM ({}) TO ({})",
        spec.month_table(),
        spec.tenant_table(),
        quote_literal(&spec.bucket.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
        quote_literal(&spec.bucket.end.to_rfc3339_opts(SecondsFormat::Secs, true))
    )
}

#[async_trait]
impl PartitionRepositoryTrait for PgPartitionRepository {
    async fn list_tenants(&self) -> Result<Vec<TenantScope>, LedgerError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT tenant_id FROM ledger_tenants ORDER BY tenant_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids
            .iter()
            .filter_map(|id| match TenantScope::new(id) {
                Ok(scope) => Some(scope),
                Err(err) => {
                    tracing::warn!(tenant_id = %id, error = %err, "Skipping invalid tenant id");
                    None
                }
            })
            .collect())
    }

    async fn register_tenant(&self, tenant: &TenantScope) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "INSERT INTO ledger_tenants (tenant_id) VALUES ($1) ON CONFLICT (tenant_id) DO NOTHING",
        )
        .bind(tenant.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ensure_partition(
        &self,
        spec: &PartitionSpec,
    ) -> Result<PartitionOutcome, LedgerError> {
        let month_table = spec.month_table();
        if self.table_exists(&month_table).await? {
            return Ok(PartitionOutcome::AlreadyExists);
        }
        self.create_if_absent(&tenant_partition_ddl(spec)).await?;
        self.create_if_absent(&month_partition_ddl(spec)).await?;
        tracing::info!(
            tenant_id = %spec.tenant,
            partition = %month_table,
            from = %spec.bucket.start,
            to = %spec.bucket.end,
            "Audit event partition created"
        );
        Ok(PartitionOutcome::Created)
    }
}
