//! Tenant-scoped, decrypting read side of the ledger.

use futures::{stream, StreamExt, TryFutureExt};
use serde_json::Value;
use std::sync::Arc;

use crate::{
    error::LedgerError,
    models::{
        audit_event::{AuditEventResponse, AuditEventRow},
        consent::ConsentRecordResponse,
        tenant::TenantScope,
        Page, PageResponse,
    },
    repositories::{
        AuditEventFilters, AuditEventRepositoryTrait, ConsentRecordFilters,
        ConsentRepositoryTrait,
    },
    types::AuditEventId,
    utils::{envelope::EnvelopeEncryptor, pii::PiiPolicy},
};

pub const REDACTED: &str = "[REDACTED]";

#[derive(Clone)]
pub struct AuditQueryService {
    audit_events: Arc<dyn AuditEventRepositoryTrait>,
    consents: Arc<dyn ConsentRepositoryTrait>,
    encryptor: EnvelopeEncryptor,
    decrypt_concurrency: usize,
}

impl AuditQueryService {
    pub fn new(
        audit_events: Arc<dyn AuditEventRepositoryTrait>,
        consents: Arc<dyn ConsentRepositoryTrait>,
        encryptor: EnvelopeEncryptor,
        decrypt_concurrency: usize,
    ) -> Self {
        Self {
            audit_events,
            consents,
            encryptor,
            decrypt_concurrency: decrypt_concurrency.max(1),
        }
    }

    /// Newest first. A row whose fields fail to decrypt is still returned,
    /// with those fields redacted.
    pub async fn list_audit_events(
        &self,
        tenant: &TenantScope,
        filters: &AuditEventFilters,
        page: Page,
        policy: PiiPolicy,
    ) -> Result<PageResponse<AuditEventResponse>, LedgerError> {
        let (rows, total) = tokio::try_join!(
            self.audit_events.list(tenant, filters, page),
            self.audit_events.count(tenant, filters),
        )?;

        let items = stream::iter(rows)
            .map(|row| self.open_row(row))
            .buffered(self.decrypt_concurrency)
            .map(|event| policy.apply(event))
            .collect::<Vec<_>>()
            .await;
        Ok(PageResponse::new(page, total, items))
    }

    pub async fn get_audit_event(
        &self,
        tenant: &TenantScope,
        id: AuditEventId,
        policy: PiiPolicy,
    ) -> Result<AuditEventResponse, LedgerError> {
        let row = self
            .audit_events
            .fetch(tenant, id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Audit event {} not found", id)))?;
        Ok(policy.apply(self.open_row(row).await))
    }

    pub async fn list_consent_records(
        &self,
        tenant: &TenantScope,
        filters: &ConsentRecordFilters,
        page: Page,
    ) -> Result<PageResponse<ConsentRecordResponse>, LedgerError> {
        let (records, total) = tokio::try_join!(
            self.consents.list_records(tenant, filters, page),
            self.consents.count_records(tenant, filters),
        )?;
        let items = records.into_iter().map(ConsentRecordResponse::from).collect();
        Ok(PageResponse::new(page, total, items))
    }

    async fn open_row(&self, row: AuditEventRow) -> AuditEventResponse {
        let (actor_email, before_value, after_value) = tokio::join!(
            self.open_text(&row, "actor_email", row.actor_email_enc.as_deref()),
            self.open_json(&row, "before_value", row.before_value_enc.as_deref()),
            self.open_json(&row, "after_value", row.after_value_enc.as_deref()),
        );

        let mut redacted_fields = Vec::new();
        let mut decrypt_error = None;
        for (field, code) in [
            ("actor_email", actor_email.redaction()),
            ("before_value", before_value.redaction()),
            ("after_value", after_value.redaction()),
        ] {
            if let Some(code) = code {
                redacted_fields.push(field.to_string());
                decrypt_error.get_or_insert_with(|| code.to_string());
            }
        }

        AuditEventResponse {
            id: row.id,
            tenant_id: row.tenant_id,
            timestamp: row.event_timestamp,
            actor_type: row.actor_type,
            actor_id: row.actor_id,
            actor_email: actor_email.into_value(|| REDACTED.to_string()),
            action: row.action,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            before_value: before_value.into_value(|| Value::String(REDACTED.to_string())),
            after_value: after_value.into_value(|| Value::String(REDACTED.to_string())),
            metadata: row.metadata.map(|m| m.0),
            source_event_id: row.source_event_id,
            inserted_at: row.inserted_at,
            redacted_fields,
            decrypt_error,
        }
    }

    async fn open_text(
        &self,
        row: &AuditEventRow,
        field: &'static str,
        envelope: Option<&str>,
    ) -> Opened<String> {
        match envelope {
            None => Opened::Absent,
            Some(envelope) => self
                .encryptor
                .decrypt(envelope)
                .map_ok_or_else(|err| redact(row, field, err), Opened::Value)
                .await,
        }
    }

    async fn open_json(
        &self,
        row: &AuditEventRow,
        field: &'static str,
        envelope: Option<&str>,
    ) -> Opened<Value> {
        match envelope {
            None => Opened::Absent,
            Some(envelope) => self
                .encryptor
                .decrypt_json(envelope)
                .map_ok_or_else(|err| redact(row, field, err), Opened::Value)
                .await,
        }
    }
}

enum Opened<T> {
    Absent,
    Value(T),
    Redacted(&'static str),
}

impl<T> Opened<T> {
    fn redaction(&self) -> Option<&'static str> {
        match self {
            Opened::Redacted(code) => Some(*code),
            _ => None,
        }
    }

    fn into_value(self, placeholder: impl FnOnce() -> T) -> Option<T> {
        match self {
            Opened::Absent => None,
            Opened::Value(value) => Some(value),
            Opened::Redacted(_) => Some(placeholder()),
        }
    }
}

fn redact<T>(row: &AuditEventRow, field: &'static str, err: LedgerError) -> Opened<T> {
    match &err {
        LedgerError::Integrity(_) => tracing::error!(
            alert = true,
            tenant_id = %row.tenant_id,
            audit_event_id = %row.id,
            field,
            error = %err,
            "Stored envelope failed its integrity check"
        ),
        _ => tracing::warn!(
            tenant_id = %row.tenant_id,
            audit_event_id = %row.id,
            field,
            code = err.code(),
            error = %err,
            "Could not decrypt audit field"
        ),
    }
    Opened::Redacted(err.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            audit_event::{AuditAction, NewAuditEvent},
            partition::PartitionSpec,
        },
        repositories::{InMemoryLedgerStore, PartitionRepositoryTrait},
        utils::{kms::LocalTransitBackend, time::bucket_for},
    };
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    fn base_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).single().expect("ts")
    }

    fn encryptor() -> EnvelopeEncryptor {
        EnvelopeEncryptor::new(
            Arc::new(LocalTransitBackend::new("local-transit-key-for-tests-0123456789")),
            "integrity-key-for-tests-0123456789abc",
            Duration::from_secs(5),
        )
    }

    async fn store_with(tenants: &[&str]) -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new();
        for tenant in tenants {
            let spec = PartitionSpec::new(
                TenantScope::new(tenant).expect("tenant"),
                bucket_for(base_ts(), &chrono_tz::UTC),
            );
            store.ensure_partition(&spec).await.expect("partition");
        }
        store
    }

    async fn sealed_event(
        encryptor: &EnvelopeEncryptor,
        tenant: &str,
        minute: i64,
    ) -> NewAuditEvent {
        NewAuditEvent {
            id: AuditEventId::new(),
            tenant_id: tenant.to_string(),
            event_timestamp: base_ts() + ChronoDuration::minutes(minute),
            actor_type: "user".into(),
            actor_id: Some(format!("{}-user", tenant)),
            actor_email_enc: Some(
                encryptor
                    .encrypt(&format!("owner@{}.example", tenant))
                    .await
                    .expect("encrypt"),
            ),
            action: AuditAction::Update,
            resource_type: "order".into(),
            resource_id: format!("{}-{}", tenant, minute),
            before_value_enc: None,
            after_value_enc: Some(
                encryptor
                    .encrypt_json(&serde_json::json!({"minute": minute}))
                    .await
                    .expect("encrypt"),
            ),
            metadata: Some(serde_json::json!({"ip": "10.1.2.3"})),
            source_event_id: None,
        }
    }

    fn service(store: &InMemoryLedgerStore, encryptor: EnvelopeEncryptor) -> AuditQueryService {
        AuditQueryService::new(Arc::new(store.clone()), Arc::new(store.clone()), encryptor, 4)
    }

    #[tokio::test]
    async fn interleaved_ingestion_never_leaks_across_tenants() {
        let store = store_with(&["acme", "globex", "initech"]).await;
        let encryptor = encryptor();
        let tenants = ["acme", "globex", "initech"];
        for minute in 0..30 {
            let tenant = tenants[(minute as usize * 7 + 3) % tenants.len()];
            store
                .insert(&sealed_event(&encryptor, tenant, minute).await)
                .await
                .expect("insert");
        }
        let service = service(&store, encryptor);

        let mut seen = 0;
        for tenant in tenants {
            let scope = TenantScope::new(tenant).expect("tenant");
            let page = service
                .list_audit_events(
                    &scope,
                    &AuditEventFilters::default(),
                    Page::new(Some(1), Some(100)),
                    PiiPolicy::Unmasked,
                )
                .await
                .expect("list");
            assert_eq!(page.total as usize, page.items.len());
            for item in &page.items {
                assert_eq!(item.tenant_id, tenant);
                assert_eq!(
                    item.actor_email.as_deref(),
                    Some(format!("owner@{}.example", tenant).as_str())
                );
            }
            seen += page.items.len();
        }
        assert_eq!(seen, 30);
    }

    #[tokio::test]
    async fn tampered_field_is_redacted_without_failing_the_page() {
        let store = store_with(&["acme"]).await;
        let encryptor = encryptor();
        let good = sealed_event(&encryptor, "acme", 1).await;
        let mut bad = sealed_event(&encryptor, "acme", 2).await;
        let envelope = bad.actor_email_enc.take().expect("envelope");
        let (ciphertext, tag) = envelope.rsplit_once('.').expect("tag");
        let flipped = if tag.starts_with('0') { "1" } else { "0" };
        bad.actor_email_enc = Some(format!("{}.{}{}", ciphertext, flipped, &tag[1..]));
        store.insert(&good).await.expect("insert");
        store.insert(&bad).await.expect("insert");

        let page = service(&store, encryptor)
            .list_audit_events(
                &TenantScope::new("acme").expect("tenant"),
                &AuditEventFilters::default(),
                Page::default(),
                PiiPolicy::Unmasked,
            )
            .await
            .expect("page still returns");

        assert_eq!(page.items.len(), 2);
        let tampered = page.items.iter().find(|e| e.id == bad.id).expect("bad row");
        assert_eq!(tampered.actor_email.as_deref(), Some(REDACTED));
        assert_eq!(tampered.redacted_fields, vec!["actor_email".to_string()]);
        assert_eq!(tampered.decrypt_error.as_deref(), Some("INTEGRITY_ERROR"));
        assert_eq!(tampered.after_value, Some(serde_json::json!({"minute": 2})));

        let intact = page.items.iter().find(|e| e.id == good.id).expect("good row");
        assert!(intact.redacted_fields.is_empty());
        assert_eq!(intact.actor_email.as_deref(), Some("owner@acme.example"));
    }

    #[tokio::test]
    async fn masked_policy_masks_decrypted_values() {
        let store = store_with(&["acme"]).await;
        let encryptor = encryptor();
        let event = sealed_event(&encryptor, "acme", 3).await;
        store.insert(&event).await.expect("insert");

        let found = service(&store, encryptor)
            .get_audit_event(
                &TenantScope::new("acme").expect("tenant"),
                event.id,
                PiiPolicy::Masked,
            )
            .await
            .expect("found");
        assert_eq!(found.actor_email.as_deref(), Some("o***@a***.example"));
        assert_eq!(found.metadata, Some(serde_json::json!({"ip": "10.1.2.0/24"})));
    }

    #[tokio::test]
    async fn get_is_tenant_scoped() {
        let store = store_with(&["acme", "globex"]).await;
        let encryptor = encryptor();
        let event = sealed_event(&encryptor, "acme", 4).await;
        store.insert(&event).await.expect("insert");

        let result = service(&store, encryptor)
            .get_audit_event(
                &TenantScope::new("globex").expect("tenant"),
                event.id,
                PiiPolicy::Unmasked,
            )
            .await;
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
    }
}
