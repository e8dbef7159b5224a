use audit_ledger_backend::{
    messaging::MessageLog,
    models::Page,
    repositories::{AuditEventFilters, AuditEventRepositoryTrait, PartitionRepositoryTrait},
    services::AuditQueryService,
    utils::pii::PiiPolicy,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod support;

use support::{tenant, test_ledger, wait_drained, TestLedger, TENANT};

const AUDIT_SUBJECT: &str = "ledger.audit";
const CONSENT_SUBJECT: &str = "ledger.consent";

fn audit_payload(resource_id: &str) -> Vec<u8> {
    json!({
        "event_type": "audit_event",
        "tenant_id": TENANT,
        "timestamp": Utc::now(),
        "actor_type": "service",
        "actor_email": "ops@acme.example",
        "action": "CREATE",
        "resource_type": "shipment",
        "resource_id": resource_id,
        "after_value": {"carrier": "dhl"}
    })
    .to_string()
    .into_bytes()
}

fn grant_payload(event_id: &str, subject_id: &str) -> Vec<u8> {
    json!({
        "event_type": "consent_granted",
        "event_id": event_id,
        "tenant_id": TENANT,
        "subject_type": "guest",
        "subject_id": subject_id,
        "consent_method": "banner",
        "policy_version": "2024-06",
        "consents": [{"purpose_code": "analytics", "granted": true}]
    })
    .to_string()
    .into_bytes()
}

fn spawn_consumers(ledger: &TestLedger, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    let log: Arc<dyn MessageLog> = Arc::new(ledger.log.clone());
    [AUDIT_SUBJECT, CONSENT_SUBJECT]
        .into_iter()
        .map(|subject| {
            tokio::spawn(Arc::clone(&ledger.consumer).run(
                Arc::clone(&log),
                subject.to_string(),
                cancel.child_token(),
            ))
        })
        .collect()
}

async fn stop(cancel: CancellationToken, handles: Vec<JoinHandle<()>>) {
    cancel.cancel();
    for handle in handles {
        handle.await.expect("consumer task");
    }
}

#[tokio::test]
async fn transient_storage_failures_are_retried_until_persisted() {
    let ledger = test_ledger().await;
    ledger.store.fail_next_writes(3);
    for i in 0..4 {
        ledger.log.publish(AUDIT_SUBJECT, audit_payload(&format!("shp-{}", i)));
    }
    ledger.log.publish(
        CONSENT_SUBJECT,
        grant_payload("0b6f3d56-27c4-4d0e-9a4e-3f1f8b0c2d11", "visitor-1"),
    );

    let cancel = CancellationToken::new();
    let handles = spawn_consumers(&ledger, &cancel);
    wait_drained(&ledger.log).await;
    stop(cancel, handles).await;

    assert_eq!(ledger.log.nak_count(), 3);
    assert_eq!(ledger.log.acked().len(), 5);
    // 4 generic events plus the mirrored consent event.
    assert_eq!(ledger.store.audit_events().len(), 5);
    assert_eq!(ledger.store.consent_records().len(), 2);
}

#[tokio::test]
async fn crash_before_ack_loses_nothing_and_does_not_double_apply_consent() {
    let ledger = test_ledger().await;
    ledger.log.publish(AUDIT_SUBJECT, audit_payload("shp-crash"));
    let grant = grant_payload("5d2e8c1a-6f47-4b3b-8e2a-9c0d1e2f3a4b", "visitor-2");
    ledger.log.publish(CONSENT_SUBJECT, grant.clone());

    // A consumer that persists and then dies before acking.
    for subject in [AUDIT_SUBJECT, CONSENT_SUBJECT] {
        let mut subscription = ledger.log.subscribe(subject).await.expect("subscribe");
        let message = subscription
            .next_message()
            .await
            .expect("message")
            .expect("delivery");
        ledger.consumer.process(message.payload()).await.expect("persisted");
    }
    assert_eq!(ledger.log.expire_in_flight(), 2);

    let cancel = CancellationToken::new();
    let handles = spawn_consumers(&ledger, &cancel);
    wait_drained(&ledger.log).await;
    stop(cancel, handles).await;

    let rows = ledger.store.audit_events();
    let generic = rows.iter().filter(|r| r.resource_type == "shipment").count();
    let mirrored = rows.iter().filter(|r| r.resource_type == "consent").count();
    // Generic events carry no idempotency key, so redelivery duplicates them.
    assert_eq!(generic, 2);
    assert_eq!(mirrored, 1);
    assert_eq!(ledger.store.consent_records().len(), 2);
}

#[tokio::test]
async fn ingested_events_are_readable_through_the_query_service() {
    let ledger = test_ledger().await;
    ledger.log.publish(AUDIT_SUBJECT, audit_payload("shp-visible"));
    ledger.log.publish(AUDIT_SUBJECT, b"{not json".to_vec());

    let cancel = CancellationToken::new();
    let handles = spawn_consumers(&ledger, &cancel);
    wait_drained(&ledger.log).await;
    stop(cancel, handles).await;

    // The malformed message is acked and dropped.
    assert_eq!(ledger.log.acked().len(), 2);
    let query = AuditQueryService::new(
        Arc::new(ledger.store.clone()),
        Arc::new(ledger.store.clone()),
        ledger.encryptor.clone(),
        4,
    );
    let page = query
        .list_audit_events(
            &tenant(TENANT),
            &AuditEventFilters::default(),
            Page::new(None, None),
            PiiPolicy::Unmasked,
        )
        .await
        .expect("page");
    assert_eq!(page.total, 1);
    let event = &page.items[0];
    assert_eq!(event.actor_email.as_deref(), Some("ops@acme.example"));
    assert_eq!(event.after_value, Some(json!({"carrier": "dhl"})));
    assert!(event.redacted_fields.is_empty());
}

fn audit_payload_at(tenant_id: &str, timestamp: DateTime<Utc>, resource_id: &str) -> Vec<u8> {
    json!({
        "event_type": "audit_event",
        "tenant_id": tenant_id,
        "timestamp": timestamp,
        "actor_type": "service",
        "action": "EXPORT",
        "resource_type": "report",
        "resource_id": resource_id
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn events_outside_the_lookahead_window_provision_their_own_partition() {
    let ledger = test_ledger().await;
    let far_future = Utc::now() + ChronoDuration::days(200);
    let back_dated = Utc::now() - ChronoDuration::days(70);
    ledger
        .log
        .publish(AUDIT_SUBJECT, audit_payload_at(TENANT, far_future, "r-future"));
    ledger
        .log
        .publish(AUDIT_SUBJECT, audit_payload_at(TENANT, back_dated, "r-past"));

    let cancel = CancellationToken::new();
    let handles = spawn_consumers(&ledger, &cancel);
    wait_drained(&ledger.log).await;
    stop(cancel, handles).await;

    assert_eq!(ledger.log.nak_count(), 0);
    assert_eq!(ledger.log.acked().len(), 2);
    assert_eq!(ledger.store.audit_events().len(), 2);
    let buckets = ledger.store.partitions(&tenant(TENANT));
    for ts in [far_future, back_dated] {
        assert!(buckets.iter().any(|b| b.contains(ts)), "no partition for {}", ts);
    }
}

#[tokio::test]
async fn first_event_from_a_new_tenant_is_persisted() {
    let ledger = test_ledger().await;
    ledger
        .log
        .publish(AUDIT_SUBJECT, audit_payload_at("initech", Utc::now(), "r-new"));

    let cancel = CancellationToken::new();
    let handles = spawn_consumers(&ledger, &cancel);
    wait_drained(&ledger.log).await;
    stop(cancel, handles).await;

    assert_eq!(ledger.log.nak_count(), 0);
    let tenants = ledger.store.list_tenants().await.expect("tenants");
    assert!(tenants.contains(&tenant("initech")));
    let rows = ledger
        .store
        .list(&tenant("initech"), &AuditEventFilters::default(), Page::new(None, None))
        .await
        .expect("list");
    assert_eq!(rows.len(), 1);
}
