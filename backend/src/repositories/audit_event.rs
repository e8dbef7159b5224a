use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder};

use crate::{
    error::LedgerError,
    models::{
        audit_event::{AuditAction, AuditEventRow, NewAuditEvent},
        tenant::TenantScope,
        Page,
    },
    repositories::common::{push_clause, push_page, push_tenant_scope, AUDIT_EVENT_COLUMNS},
    types::AuditEventId,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditEventFilters {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub actor_type: Option<String>,
    pub actor_id: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
}

impl AuditEventFilters {
    pub fn matches(&self, row: &AuditEventRow) -> bool {
        self.from.map_or(true, |from| row.event_timestamp >= from)
            && self.to.map_or(true, |to| row.event_timestamp <= to)
            && self
                .actor_type
                .as_ref()
                .map_or(true, |v| &row.actor_type == v)
            && self
                .actor_id
                .as_ref()
                .map_or(true, |v| row.actor_id.as_ref() == Some(v))
            && self.action.map_or(true, |a| row.action == a.as_str())
            && self
                .resource_type
                .as_ref()
                .map_or(true, |v| &row.resource_type == v)
            && self
                .resource_id
                .as_ref()
                .map_or(true, |v| &row.resource_id == v)
    }
}

/// Append-only store of audit events. Rows are never updated.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditEventRepositoryTrait: Send + Sync {
    /// Fails with `PartitionMissing` when no partition covers the event's
    /// tenant and timestamp.
    async fn insert(&self, event: &NewAuditEvent) -> Result<AuditEventRow, LedgerError>;

    async fn fetch(
        &self,
        tenant: &TenantScope,
        id: AuditEventId,
    ) -> Result<Option<AuditEventRow>, LedgerError>;

    /// Newest first.
    async fn list(
        &self,
        tenant: &TenantScope,
        filters: &AuditEventFilters,
        page: Page,
    ) -> Result<Vec<AuditEventRow>, LedgerError>;

    async fn count(
        &self,
        tenant: &TenantScope,
        filters: &AuditEventFilters,
    ) -> Result<i64, LedgerError>;
}

#[derive(Clone)]
pub struct PgAuditEventRepository {
    pool: PgPool,
}

impl PgAuditEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Shared with the consent repository, which writes the mirrored event in
/// its own transaction.
pub(crate) async fn insert_audit_event<'e, E>(
    executor: E,
    event: &NewAuditEvent,
) -> Result<AuditEventRow, LedgerError>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "INSERT INTO audit_events \
         (id, tenant_id, event_timestamp, actor_type, actor_id, actor_email_enc, action, \
         resource_type, resource_id, before_value_enc, after_value_enc, metadata, source_event_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING {}",
        AUDIT_EVENT_COLUMNS
    );
    sqlx::query_as::<_, AuditEventRow>(&sql)
        .bind(event.id)
        .bind(&event.tenant_id)
        .bind(event.event_timestamp)
        .bind(&event.actor_type)
        .bind(&event.actor_id)
        .bind(&event.actor_email_enc)
        .bind(event.action.as_str())
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.before_value_enc)
        .bind(&event.after_value_enc)
        .bind(event.metadata.clone().map(sqlx::types::Json))
        .bind(event.source_event_id)
        .fetch_one(executor)
        .await
        .map_err(|err| LedgerError::from_sqlx(err, &event.tenant_id, event.event_timestamp))
}

#[async_trait]
impl AuditEventRepositoryTrait for PgAuditEventRepository {
    async fn insert(&self, event: &NewAuditEvent) -> Result<AuditEventRow, LedgerError> {
        insert_audit_event(&self.pool, event).await
    }

    async fn fetch(
        &self,
        tenant: &TenantScope,
        id: AuditEventId,
    ) -> Result<Option<AuditEventRow>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM audit_events WHERE tenant_id = $1 AND id = $2",
            AUDIT_EVENT_COLUMNS
        );
        let row = sqlx::query_as::<_, AuditEventRow>(&sql)
            .bind(tenant.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list(
        &self,
        tenant: &TenantScope,
        filters: &AuditEventFilters,
        page: Page,
    ) -> Result<Vec<AuditEventRow>, LedgerError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM audit_events", AUDIT_EVENT_COLUMNS));
        let mut has_clause = false;
        push_tenant_scope(&mut builder, &mut has_clause, tenant);
        apply_audit_event_filters(&mut builder, &mut has_clause, filters);
        builder.push(" ORDER BY event_timestamp DESC, id DESC");
        push_page(&mut builder, page);

        let rows = builder
            .build_query_as::<AuditEventRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn count(
        &self,
        tenant: &TenantScope,
        filters: &AuditEventFilters,
    ) -> Result<i64, LedgerError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM audit_events");
        let mut has_clause = false;
        push_tenant_scope(&mut builder, &mut has_clause, tenant);
        apply_audit_event_filters(&mut builder, &mut has_clause, filters);
        let total = builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }
}

fn apply_audit_event_filters(
    builder: &mut QueryBuilder<'_, Postgres>,
    has_clause: &mut bool,
    filters: &AuditEventFilters,
) {
    if let Some(from) = filters.from {
        push_clause(builder, has_clause);
        builder.push("event_timestamp >= ").push_bind(from);
    }
    if let Some(to) = filters.to {
        push_clause(builder, has_clause);
        builder.push("event_timestamp <= ").push_bind(to);
    }
    if let Some(actor_type) = filters.actor_type.as_ref() {
        push_clause(builder, has_clause);
        builder.push("actor_type = ").push_bind(actor_type.clone());
    }
    if let Some(actor_id) = filters.actor_id.as_ref() {
        push_clause(builder, has_clause);
        builder.push("actor_id = ").push_bind(actor_id.clone());
    }
    if let Some(action) = filters.action {
        push_clause(builder, has_clause);
        builder.push("action = ").push_bind(action.as_str());
    }
    if let Some(resource_type) = filters.resource_type.as_ref() {
        push_clause(builder, has_clause);
        builder
            .push("resource_type = ")
            .push_bind(resource_type.clone());
    }
    if let Some(resource_id) = filters.resource_id.as_ref() {
        push_clause(builder, has_clause);
        builder.push("resource_id = ").push_bind(resource_id.clone());
    }
}
