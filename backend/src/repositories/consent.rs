use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{
    error::LedgerError,
    models::{
        consent::{
            ConsentApplyOutcome, ConsentChange, ConsentMutation, ConsentPurpose, ConsentRecord,
            ConsentUpsert, PrivacyPolicy, Subject, SubjectType,
        },
        tenant::TenantScope,
        Page,
    },
    repositories::{
        audit_event::insert_audit_event,
        common::{push_clause, push_page, push_tenant_scope, CONSENT_RECORD_COLUMNS},
    },
    types::ConsentRecordId,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsentRecordFilters {
    pub subject_type: Option<SubjectType>,
    pub subject_id: Option<String>,
    pub purpose_code: Option<String>,
    /// `Some(true)` keeps only active records, `Some(false)` only inactive.
    pub active: Option<bool>,
}

impl ConsentRecordFilters {
    pub fn matches(&self, record: &ConsentRecord) -> bool {
        self.subject_type
            .map_or(true, |t| record.subject_type == t.as_str())
            && self
                .subject_id
                .as_ref()
                .map_or(true, |v| &record.subject_id == v)
            && self
                .purpose_code
                .as_ref()
                .map_or(true, |v| &record.purpose_code == v)
            && self.active.map_or(true, |a| record.is_active() == a)
    }
}

/// Consent state plus the purpose and policy reference data it refers to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsentRepositoryTrait: Send + Sync {
    /// Ordered by display order, then code.
    async fn list_purposes(&self) -> Result<Vec<ConsentPurpose>, LedgerError>;

    async fn find_purpose(&self, code: &str) -> Result<Option<ConsentPurpose>, LedgerError>;

    async fn current_policy(&self) -> Result<Option<PrivacyPolicy>, LedgerError>;

    /// Applies every write of a consent event atomically. A repeated
    /// `event_id` writes nothing and returns `AlreadyApplied`.
    async fn apply(&self, mutation: &ConsentMutation) -> Result<ConsentApplyOutcome, LedgerError>;

    async fn records_for_subject(
        &self,
        tenant: &TenantScope,
        subject: &Subject,
    ) -> Result<Vec<ConsentRecord>, LedgerError>;

    async fn list_records(
        &self,
        tenant: &TenantScope,
        filters: &ConsentRecordFilters,
        page: Page,
    ) -> Result<Vec<ConsentRecord>, LedgerError>;

    async fn count_records(
        &self,
        tenant: &TenantScope,
        filters: &ConsentRecordFilters,
    ) -> Result<i64, LedgerError>;
}

#[derive(Clone)]
pub struct PgConsentRepository {
    pool: PgPool,
}

impl PgConsentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// Upserts only supersede state written by an event that is not newer, so a
// late redelivery cannot roll a record back.
const UPSERT_GRANT: &str = "INSERT INTO consent_records \
     (id, tenant_id, subject_type, subject_id, purpose_code, granted, policy_version, \
     consent_method, revoked_at, last_event_id, last_event_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9, $10) \
     ON CONFLICT (tenant_id, subject_type, subject_id, purpose_code) DO UPDATE SET \
     granted = EXCLUDED.granted, policy_version = EXCLUDED.policy_version, \
     consent_method = EXCLUDED.consent_method, revoked_at = NULL, \
     last_event_id = EXCLUDED.last_event_id, last_event_at = EXCLUDED.last_event_at, \
     updated_at = NOW() \
     WHERE consent_records.last_event_at <= EXCLUDED.last_event_at";

const UPSERT_REVOKE: &str = "INSERT INTO consent_records \
     (id, tenant_id, subject_type, subject_id, purpose_code, granted, policy_version, \
     consent_method, revoked_at, last_event_id, last_event_at) \
     VALUES ($1, $2, $3, $4, $5, FALSE, NULL, NULL, $6, $7, $8) \
     ON CONFLICT (tenant_id, subject_type, subject_id, purpose_code) DO UPDATE SET \
     revoked_at = EXCLUDED.revoked_at, last_event_id = EXCLUDED.last_event_id, \
     last_event_at = EXCLUDED.last_event_at, updated_at = NOW() \
     WHERE consent_records.last_event_at <= EXCLUDED.last_event_at";

async fn upsert_record(
    conn: &mut sqlx::PgConnection,
    mutation: &ConsentMutation,
    upsert: &ConsentUpsert,
) -> Result<(), sqlx::Error> {
    let subject = &upsert.subject;
    match &upsert.change {
        ConsentChange::Grant {
            granted,
            policy_version,
            consent_method,
        } => {
            sqlx::query(UPSERT_GRANT)
                .bind(ConsentRecordId::new())
                .bind(&mutation.tenant_id)
                .bind(subject.subject_type.as_str())
                .bind(&subject.subject_id)
                .bind(&upsert.purpose_code)
                .bind(granted)
                .bind(policy_version)
                .bind(consent_method)
                .bind(mutation.event_id)
                .bind(mutation.occurred_at)
                .execute(conn)
                .await?;
        }
        ConsentChange::Revoke { revoked_at } => {
            sqlx::query(UPSERT_REVOKE)
                .bind(ConsentRecordId::new())
                .bind(&mutation.tenant_id)
                .bind(subject.subject_type.as_str())
                .bind(&subject.subject_id)
                .bind(&upsert.purpose_code)
                .bind(revoked_at)
                .bind(mutation.event_id)
                .bind(mutation.occurred_at)
                .execute(conn)
                .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl ConsentRepositoryTrait for PgConsentRepository {
    async fn list_purposes(&self) -> Result<Vec<ConsentPurpose>, LedgerError> {
        let purposes = sqlx::query_as::<_, ConsentPurpose>(
            "SELECT code, name, description, required, display_order FROM consent_purposes \
             ORDER BY display_order, code",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(purposes)
    }

    async fn find_purpose(&self, code: &str) -> Result<Option<ConsentPurpose>, LedgerError> {
        let purpose = sqlx::query_as::<_, ConsentPurpose>(
            "SELECT code, name, description, required, display_order FROM consent_purposes \
             WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(purpose)
    }

    async fn current_policy(&self) -> Result<Option<PrivacyPolicy>, LedgerError> {
        let policy = sqlx::query_as::<_, PrivacyPolicy>(
            "SELECT version, effective_date, is_current FROM privacy_policies WHERE is_current",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(policy)
    }

    async fn apply(&self, mutation: &ConsentMutation) -> Result<ConsentApplyOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "INSERT INTO consent_events (event_id, tenant_id, event_kind, occurred_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(mutation.event_id)
        .bind(&mutation.tenant_id)
        .bind(mutation.kind.as_str())
        .bind(mutation.occurred_at)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ConsentApplyOutcome::AlreadyApplied);
        }

        for upsert in &mutation.upserts {
            upsert_record(&mut tx, mutation, upsert).await?;
        }
        insert_audit_event(&mut *tx, &mutation.audit).await?;

        tx.commit().await?;
        Ok(ConsentApplyOutcome::Applied)
    }

    async fn records_for_subject(
        &self,
        tenant: &TenantScope,
        subject: &Subject,
    ) -> Result<Vec<ConsentRecord>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM consent_records \
             WHERE tenant_id = $1 AND subject_type = $2 AND subject_id = $3 \
             ORDER BY purpose_code",
            CONSENT_RECORD_COLUMNS
        );
        let records = sqlx::query_as::<_, ConsentRecord>(&sql)
            .bind(tenant.as_str())
            .bind(subject.subject_type.as_str())
            .bind(&subject.subject_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn list_records(
        &self,
        tenant: &TenantScope,
        filters: &ConsentRecordFilters,
        page: Page,
    ) -> Result<Vec<ConsentRecord>, LedgerError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM consent_records",
            CONSENT_RECORD_COLUMNS
        ));
        let mut has_clause = false;
        push_tenant_scope(&mut builder, &mut has_clause, tenant);
        apply_consent_record_filters(&mut builder, &mut has_clause, filters);
        builder.push(" ORDER BY updated_at DESC, id DESC");
        push_page(&mut builder, page);

        let records = builder
            .build_query_as::<ConsentRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn count_records(
        &self,
        tenant: &TenantScope,
        filters: &ConsentRecordFilters,
    ) -> Result<i64, LedgerError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM consent_records");
        let mut has_clause = false;
        push_tenant_scope(&mut builder, &mut has_clause, tenant);
        apply_consent_record_filters(&mut builder, &mut has_clause, filters);
        let total = builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }
}

fn apply_consent_record_filters(
    builder: &mut QueryBuilder<'_, Postgres>,
    has_clause: &mut bool,
    filters: &ConsentRecordFilters,
) {
    if let Some(subject_type) = filters.subject_type {
        push_clause(builder, has_clause);
        builder
            .push("subject_type = ")
            .push_bind(subject_type.as_str());
    }
    if let Some(subject_id) = filters.subject_id.as_ref() {
        push_clause(builder, has_clause);
        builder.push("subject_id = ").push_bind(subject_id.clone());
    }
    if let Some(purpose_code) = filters.purpose_code.as_ref() {
        push_clause(builder, has_clause);
        builder
            .push("purpose_code = ")
            .push_bind(purpose_code.clone());
    }
    match filters.active {
        Some(true) => {
            push_clause(builder, has_clause);
            builder.push("granted AND revoked_at IS NULL");
        }
        Some(false) => {
            push_clause(builder, has_clause);
            builder.push("NOT (granted AND revoked_at IS NULL)");
        }
        None => {}
    }
}
