//! Per-subject, per-purpose consent state.
//!
//! Required purposes come from the purpose reference table and are always
//! recorded as granted, whatever the client sent. Every applied event also
//! writes a mirrored audit event in the same transaction. A mirrored event
//! whose month has no partition yet gets one provisioned on demand.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use crate::{
    error::LedgerError,
    events::schema::{ConsentGrantedPayload, ConsentRequestMetadata, ConsentRevokedPayload},
    models::{
        audit_event::{AuditAction, NewAuditEvent},
        consent::{
            ConsentApplyOutcome, ConsentChange, ConsentEventKind, ConsentMutation,
            ConsentPurpose, ConsentUpsert, Subject,
        },
        tenant::TenantScope,
    },
    repositories::ConsentRepositoryTrait,
    services::partition_manager::PartitionLifecycleManager,
    types::{AuditEventId, EventId},
    utils::envelope::EnvelopeEncryptor,
};

pub const CONSENT_RESOURCE_TYPE: &str = "consent";

pub struct ConsentLedger {
    repo: Arc<dyn ConsentRepositoryTrait>,
    encryptor: EnvelopeEncryptor,
    partitions: Arc<PartitionLifecycleManager>,
}

impl ConsentLedger {
    pub fn new(
        repo: Arc<dyn ConsentRepositoryTrait>,
        encryptor: EnvelopeEncryptor,
        partitions: Arc<PartitionLifecycleManager>,
    ) -> Self {
        Self {
            repo,
            encryptor,
            partitions,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ConsentRepositoryTrait> {
        &self.repo
    }

    /// Processing time stands in for `occurred_at` when the event carries
    /// none.
    pub async fn apply_grant(
        &self,
        event: &ConsentGrantedPayload,
    ) -> Result<ConsentApplyOutcome, LedgerError> {
        let tenant = TenantScope::new(&event.tenant_id)?;
        let purposes = self.repo.list_purposes().await?;
        let decisions = resolve_grant_decisions(event, &purposes)?;
        let subject = Subject {
            subject_type: event.subject_type,
            subject_id: event.subject_id.clone(),
        };
        let occurred_at = event.occurred_at.unwrap_or_else(Utc::now);

        let upserts = decisions
            .iter()
            .map(|(code, granted)| ConsentUpsert {
                subject: subject.clone(),
                purpose_code: code.clone(),
                change: ConsentChange::Grant {
                    granted: *granted,
                    policy_version: event.policy_version.clone(),
                    consent_method: event.consent_method.clone(),
                },
            })
            .collect();

        let snapshot = json!({
            "purposes": decisions,
            "policy_version": event.policy_version,
            "consent_method": event.consent_method,
            "ip": event.metadata.ip,
            "user_agent": event.metadata.user_agent,
        });
        let audit = self
            .mirrored_audit_event(
                &tenant,
                &subject,
                event.event_id,
                ConsentEventKind::Granted,
                occurred_at,
                &snapshot,
                &event.metadata,
            )
            .await?;

        let mutation = ConsentMutation {
            event_id: event.event_id,
            tenant_id: tenant.as_str().to_string(),
            kind: ConsentEventKind::Granted,
            occurred_at,
            upserts,
            audit,
        };
        self.apply(mutation).await
    }

    pub async fn apply_revoke(
        &self,
        event: &ConsentRevokedPayload,
    ) -> Result<ConsentApplyOutcome, LedgerError> {
        let tenant = TenantScope::new(&event.tenant_id)?;
        if self.repo.find_purpose(&event.purpose_code).await?.is_none() {
            return Err(LedgerError::Validation(format!(
                "purpose_code: unknown purpose '{}'",
                event.purpose_code
            )));
        }
        let subject = Subject {
            subject_type: event.subject_type,
            subject_id: event.subject_id.clone(),
        };

        let snapshot = json!({
            "purpose_code": event.purpose_code,
            "revoked_at": event.revoked_at,
            "ip": event.metadata.ip,
            "user_agent": event.metadata.user_agent,
        });
        let audit = self
            .mirrored_audit_event(
                &tenant,
                &subject,
                event.event_id,
                ConsentEventKind::Revoked,
                event.revoked_at,
                &snapshot,
                &event.metadata,
            )
            .await?;

        let mutation = ConsentMutation {
            event_id: event.event_id,
            tenant_id: tenant.as_str().to_string(),
            kind: ConsentEventKind::Revoked,
            occurred_at: event.revoked_at,
            upserts: vec![ConsentUpsert {
                subject,
                purpose_code: event.purpose_code.clone(),
                change: ConsentChange::Revoke {
                    revoked_at: event.revoked_at,
                },
            }],
            audit,
        };
        self.apply(mutation).await
    }

    /// Every configured purpose mapped to whether the subject holds an
    /// active consent for it.
    pub async fn status(
        &self,
        tenant: &TenantScope,
        subject: &Subject,
    ) -> Result<BTreeMap<String, bool>, LedgerError> {
        let (purposes, records) = tokio::try_join!(
            self.repo.list_purposes(),
            self.repo.records_for_subject(tenant, subject)
        )?;
        let active: HashSet<&str> = records
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.purpose_code.as_str())
            .collect();
        Ok(purposes
            .into_iter()
            .map(|p| {
                let granted = active.contains(p.code.as_str());
                (p.code, granted)
            })
            .collect())
    }

    async fn apply(&self, mutation: ConsentMutation) -> Result<ConsentApplyOutcome, LedgerError> {
        let outcome = self
            .partitions
            .write_provisioned(|| self.repo.apply(&mutation))
            .await?;
        match outcome {
            ConsentApplyOutcome::Applied => tracing::info!(
                event_id = %mutation.event_id,
                tenant_id = %mutation.tenant_id,
                event_kind = mutation.kind.as_str(),
                purposes = mutation.upserts.len(),
                "Consent event applied"
            ),
            ConsentApplyOutcome::AlreadyApplied => tracing::debug!(
                event_id = %mutation.event_id,
                tenant_id = %mutation.tenant_id,
                "Consent event already applied"
            ),
        }
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn mirrored_audit_event(
        &self,
        tenant: &TenantScope,
        subject: &Subject,
        event_id: EventId,
        kind: ConsentEventKind,
        occurred_at: DateTime<Utc>,
        snapshot: &serde_json::Value,
        request: &ConsentRequestMetadata,
    ) -> Result<NewAuditEvent, LedgerError> {
        Ok(NewAuditEvent {
            id: AuditEventId::new(),
            tenant_id: tenant.as_str().to_string(),
            event_timestamp: occurred_at,
            actor_type: subject.subject_type.as_str().to_string(),
            actor_id: Some(subject.subject_id.clone()),
            actor_email_enc: None,
            action: AuditAction::Update,
            resource_type: CONSENT_RESOURCE_TYPE.to_string(),
            resource_id: format!("{}:{}", subject.subject_type, subject.subject_id),
            before_value_enc: None,
            after_value_enc: Some(self.encryptor.encrypt_json(snapshot).await?),
            metadata: Some(json!({
                "kind": kind.as_str(),
                "event_id": event_id,
                "request_id": request.request_id,
            })),
            source_event_id: Some(event_id),
        })
    }
}

/// Final granted flag per purpose for a grant event.
///
/// Required purposes are granted regardless of input. Optional purposes
/// take the client's choice and are left alone when not mentioned.
pub fn resolve_grant_decisions(
    event: &ConsentGrantedPayload,
    purposes: &[ConsentPurpose],
) -> Result<BTreeMap<String, bool>, LedgerError> {
    let by_code: HashMap<&str, &ConsentPurpose> =
        purposes.iter().map(|p| (p.code.as_str(), p)).collect();

    for code in event
        .consents
        .iter()
        .map(|c| &c.purpose_code)
        .chain(event.required_consents.iter())
    {
        if !by_code.contains_key(code.as_str()) {
            return Err(LedgerError::Validation(format!(
                "purpose_code: unknown purpose '{}'",
                code
            )));
        }
    }

    let mut decisions: BTreeMap<String, bool> = purposes
        .iter()
        .filter(|p| p.required)
        .map(|p| (p.code.clone(), true))
        .collect();
    for choice in &event.consents {
        if by_code[choice.purpose_code.as_str()].required {
            if !choice.granted {
                tracing::debug!(
                    purpose_code = %choice.purpose_code,
                    "Ignoring attempt to decline a required purpose"
                );
            }
            continue;
        }
        decisions.insert(choice.purpose_code.clone(), choice.granted);
    }
    Ok(decisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::schema::ConsentChoice,
        models::{consent::SubjectType, partition::PartitionSpec},
        repositories::{InMemoryLedgerStore, PartitionRepositoryTrait},
        utils::{kms::LocalTransitBackend, time::bucket_for},
    };
    use chrono::TimeZone;
    use std::time::Duration;

    fn encryptor() -> EnvelopeEncryptor {
        EnvelopeEncryptor::new(
            Arc::new(LocalTransitBackend::new("local-transit-key-for-tests-0123456789")),
            "integrity-key-for-tests-0123456789abc",
            Duration::from_secs(5),
        )
    }

    fn ledger(store: &InMemoryLedgerStore, encryptor: EnvelopeEncryptor) -> ConsentLedger {
        let partitions = Arc::new(PartitionLifecycleManager::new(
            Arc::new(store.clone()),
            1,
            chrono_tz::UTC,
            Duration::from_secs(3600),
        ));
        ConsentLedger::new(Arc::new(store.clone()), encryptor, partitions)
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).single().expect("ts")
    }

    async fn store() -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new();
        store.add_purpose("essential", "Essential service", true, 1);
        store.add_purpose("analytics", "Usage analytics", false, 2);
        store.add_purpose("marketing", "Marketing email", false, 3);
        let tenant = TenantScope::new("acme").expect("tenant");
        store
            .ensure_partition(&PartitionSpec::new(tenant, bucket_for(at(1, 0), &chrono_tz::UTC)))
            .await
            .expect("partition");
        store
    }

    fn grant(
        event_id: EventId,
        consents: Vec<(&str, bool)>,
        occurred_at: DateTime<Utc>,
    ) -> ConsentGrantedPayload {
        ConsentGrantedPayload {
            event_id,
            tenant_id: "acme".into(),
            subject_type: SubjectType::Guest,
            subject_id: "g-1".into(),
            consent_method: "banner".into(),
            policy_version: "2024-05".into(),
            consents: consents
                .into_iter()
                .map(|(code, granted)| ConsentChoice {
                    purpose_code: code.into(),
                    granted,
                })
                .collect(),
            required_consents: Vec::new(),
            metadata: ConsentRequestMetadata {
                ip: Some("10.1.2.3".into()),
                user_agent: Some("Mozilla/5.0".into()),
                request_id: Some("req-1".into()),
            },
            occurred_at: Some(occurred_at),
        }
    }

    fn revoke(event_id: EventId, code: &str, revoked_at: DateTime<Utc>) -> ConsentRevokedPayload {
        ConsentRevokedPayload {
            event_id,
            tenant_id: "acme".into(),
            subject_type: SubjectType::Guest,
            subject_id: "g-1".into(),
            purpose_code: code.into(),
            revoked_at,
            metadata: ConsentRequestMetadata::default(),
        }
    }

    fn subject() -> Subject {
        Subject {
            subject_type: SubjectType::Guest,
            subject_id: "g-1".into(),
        }
    }

    #[tokio::test]
    async fn applying_the_same_grant_twice_matches_applying_it_once() {
        let store = store().await;
        let ledger = ledger(&store, encryptor());
        let event = grant(EventId::new(), vec![("marketing", true)], at(2, 9));

        assert_eq!(
            ledger.apply_grant(&event).await.expect("apply"),
            ConsentApplyOutcome::Applied
        );
        let once: Vec<_> = store
            .consent_records()
            .into_iter()
            .map(|r| (r.purpose_code, r.granted, r.revoked_at, r.last_event_id, r.updated_at))
            .collect();

        assert_eq!(
            ledger.apply_grant(&event).await.expect("reapply"),
            ConsentApplyOutcome::AlreadyApplied
        );
        let twice: Vec<_> = store
            .consent_records()
            .into_iter()
            .map(|r| (r.purpose_code, r.granted, r.revoked_at, r.last_event_id, r.updated_at))
            .collect();

        assert_eq!(once, twice);
        assert_eq!(store.audit_events().len(), 1, "mirrored audit event written once");
    }

    #[tokio::test]
    async fn required_purposes_are_injected_and_cannot_be_declined() {
        let store = store().await;
        let ledger = ledger(&store, encryptor());

        ledger
            .apply_grant(&grant(EventId::new(), vec![("analytics", false)], at(2, 9)))
            .await
            .expect("omitting required");
        let status = ledger
            .status(&TenantScope::new("acme").expect("tenant"), &subject())
            .await
            .expect("status");
        assert_eq!(status.get("essential"), Some(&true));
        assert_eq!(status.get("analytics"), Some(&false));
        assert_eq!(status.get("marketing"), Some(&false));

        ledger
            .apply_grant(&grant(EventId::new(), vec![("essential", false)], at(3, 9)))
            .await
            .expect("declining required");
        let status = ledger
            .status(&TenantScope::new("acme").expect("tenant"), &subject())
            .await
            .expect("status");
        assert_eq!(status.get("essential"), Some(&true));
    }

    #[tokio::test]
    async fn revoke_then_grant_reactivates() {
        let store = store().await;
        let ledger = ledger(&store, encryptor());
        let tenant = TenantScope::new("acme").expect("tenant");

        ledger
            .apply_grant(&grant(EventId::new(), vec![("marketing", true)], at(2, 9)))
            .await
            .expect("grant");
        ledger
            .apply_revoke(&revoke(EventId::new(), "marketing", at(3, 9)))
            .await
            .expect("revoke");
        let status = ledger.status(&tenant, &subject()).await.expect("status");
        assert_eq!(status.get("marketing"), Some(&false));
        let revoked = store
            .consent_records()
            .into_iter()
            .find(|r| r.purpose_code == "marketing")
            .expect("record");
        assert!(revoked.granted);
        assert_eq!(revoked.revoked_at, Some(at(3, 9)));

        ledger
            .apply_grant(&grant(EventId::new(), vec![("marketing", true)], at(4, 9)))
            .await
            .expect("grant again");
        let status = ledger.status(&tenant, &subject()).await.expect("status");
        assert_eq!(status.get("marketing"), Some(&true));
        assert_eq!(store.audit_events().len(), 3);
    }

    #[tokio::test]
    async fn late_redelivery_does_not_roll_state_back() {
        let store = store().await;
        let ledger = ledger(&store, encryptor());

        ledger
            .apply_revoke(&revoke(EventId::new(), "marketing", at(5, 9)))
            .await
            .expect("revoke");
        ledger
            .apply_grant(&grant(EventId::new(), vec![("marketing", true)], at(4, 9)))
            .await
            .expect("older grant");
        let status = ledger
            .status(&TenantScope::new("acme").expect("tenant"), &subject())
            .await
            .expect("status");
        assert_eq!(status.get("marketing"), Some(&false));
    }

    #[tokio::test]
    async fn unknown_purposes_are_validation_errors() {
        let store = store().await;
        let ledger = ledger(&store, encryptor());
        assert!(matches!(
            ledger
                .apply_grant(&grant(EventId::new(), vec![("telepathy", true)], at(2, 9)))
                .await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ledger.apply_revoke(&revoke(EventId::new(), "telepathy", at(2, 9))).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(store.consent_records().is_empty());
    }

    #[tokio::test]
    async fn mirrored_audit_event_is_encrypted_and_tagged() {
        let store = store().await;
        let encryptor = encryptor();
        let ledger = ledger(&store, encryptor.clone());
        let event_id = EventId::new();
        ledger
            .apply_grant(&grant(event_id, vec![("marketing", true)], at(2, 9)))
            .await
            .expect("grant");

        let row = store.audit_events().pop().expect("audit row");
        assert_eq!(row.action, "UPDATE");
        assert_eq!(row.resource_type, CONSENT_RESOURCE_TYPE);
        assert_eq!(row.source_event_id, Some(event_id));
        assert_eq!(
            row.metadata.as_ref().map(|m| m.0["kind"].clone()),
            Some(json!("consent_granted"))
        );
        let envelope = row.after_value_enc.expect("after value");
        assert!(!envelope.contains("10.1.2.3"));
        let snapshot = encryptor.decrypt_json(&envelope).await.expect("decrypt");
        assert_eq!(snapshot["ip"], "10.1.2.3");
        assert_eq!(snapshot["purposes"]["essential"], true);
    }

    #[tokio::test]
    async fn back_dated_revoke_provisions_its_own_partition() {
        let store = store().await;
        let ledger = ledger(&store, encryptor());
        let last_year = Utc.with_ymd_and_hms(2023, 2, 11, 10, 0, 0).single().expect("ts");

        let outcome = ledger
            .apply_revoke(&revoke(EventId::new(), "marketing", last_year))
            .await
            .expect("revoke lands despite no partition for 2023-02");
        assert_eq!(outcome, ConsentApplyOutcome::Applied);
        let tenant = TenantScope::new("acme").expect("tenant");
        assert!(store.partitions(&tenant).iter().any(|b| b.contains(last_year)));
        assert_eq!(store.audit_events().len(), 1);
    }

    #[tokio::test]
    async fn first_grant_from_unknown_tenant_registers_it() {
        let store = store().await;
        let ledger = ledger(&store, encryptor());
        let mut event = grant(EventId::new(), vec![("analytics", true)], at(2, 9));
        event.tenant_id = "initech".into();

        ledger.apply_grant(&event).await.expect("grant");

        let initech = TenantScope::new("initech").expect("tenant");
        assert!(store
            .list_tenants()
            .await
            .expect("tenants")
            .contains(&initech));
        let status = ledger
            .status(&initech, &subject())
            .await
            .expect("status");
        assert_eq!(status.get("analytics"), Some(&true));
    }
}
