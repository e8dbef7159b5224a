use axum::http::{Method, StatusCode};
use chrono::Utc;
use serde_json::json;
use tower::ServiceExt;

mod support;

use support::{body_json, request, test_ledger, TestLedger, OTHER_TENANT, TENANT};

async fn ingest(ledger: &TestLedger, tenant: &str, resource_id: &str, email: &str) {
    let payload = json!({
        "event_type": "audit_event",
        "tenant_id": tenant,
        "timestamp": Utc::now(),
        "actor_type": "user",
        "actor_id": "u-42",
        "actor_email": email,
        "action": "UPDATE",
        "resource_type": "invoice",
        "resource_id": resource_id,
        "before_value": {"status": "draft"},
        "after_value": {"status": "sent", "contact_email": "billing@customer.example"},
        "metadata": {"ip": "192.0.2.44", "source": "billing"}
    });
    ledger
        .consumer
        .process(payload.to_string().as_bytes())
        .await
        .expect("ingested");
}

#[tokio::test]
async fn lists_only_the_callers_tenant() {
    let ledger = test_ledger().await;
    for i in 0..6 {
        let tenant = if i % 2 == 0 { TENANT } else { OTHER_TENANT };
        ingest(&ledger, tenant, &format!("inv-{}", i), "alice@example.com").await;
    }

    let response = ledger
        .router
        .clone()
        .oneshot(request(Method::GET, "/audit-events?per_page=50", Some(TENANT), Some("auditor"), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total"], 3);
    let items = json["items"].as_array().expect("items");
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|item| item["tenant_id"] == TENANT));
    assert_eq!(items[0]["actor_email"], "alice@example.com");
    assert_eq!(items[0]["after_value"]["status"], "sent");
}

#[tokio::test]
async fn requests_without_tenant_scope_are_rejected() {
    let ledger = test_ledger().await;
    for uri in ["/audit-events", "/consent-records", "/consent/status?subject_type=guest&subject_id=g"] {
        let response = ledger
            .router
            .clone()
            .oneshot(request(Method::GET, uri, None, None, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        let json = body_json(response).await;
        assert_eq!(json["code"], "TENANT_SCOPE_REQUIRED");
    }

    let health = ledger
        .router
        .clone()
        .oneshot(request(Method::GET, "/health", None, None, None))
        .await
        .expect("response");
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn non_auditor_roles_get_masked_pii() {
    let ledger = test_ledger().await;
    ingest(&ledger, TENANT, "inv-1", "alice@example.com").await;

    let response = ledger
        .router
        .clone()
        .oneshot(request(Method::GET, "/audit-events", Some(TENANT), Some("support"), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-pii-masked").and_then(|v| v.to_str().ok()),
        Some("true")
    );
    let json = body_json(response).await;
    let item = &json["items"][0];
    assert_eq!(item["actor_email"], "a***@e***.com");
    assert_eq!(item["after_value"]["contact_email"], "b***@c***.example");
    assert_eq!(item["metadata"]["ip"], "192.0.2.0/24");
    assert_eq!(item["metadata"]["source"], "billing");
}

#[tokio::test]
async fn detail_is_decrypted_and_tenant_scoped() {
    let ledger = test_ledger().await;
    ingest(&ledger, TENANT, "inv-9", "carol@example.com").await;
    let id = ledger.store.audit_events()[0].id.to_string();

    let response = ledger
        .router
        .clone()
        .oneshot(request(Method::GET, &format!("/audit-events/{}", id), Some(TENANT), Some("system_admin"), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-pii-masked").and_then(|v| v.to_str().ok()),
        Some("false")
    );
    let json = body_json(response).await;
    assert_eq!(json["actor_email"], "carol@example.com");
    assert_eq!(json["before_value"]["status"], "draft");

    let response = ledger
        .router
        .clone()
        .oneshot(request(Method::GET, &format!("/audit-events/{}", id), Some(OTHER_TENANT), None, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");

    let response = ledger
        .router
        .clone()
        .oneshot(request(Method::GET, "/audit-events/not-a-uuid", Some(TENANT), None, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn filters_and_pagination_apply() {
    let ledger = test_ledger().await;
    for i in 0..5 {
        ingest(&ledger, TENANT, &format!("inv-{}", i), "alice@example.com").await;
    }

    let response = ledger
        .router
        .clone()
        .oneshot(request(
            Method::GET,
            "/audit-events?resource_id=inv-3&action=update",
            Some(TENANT),
            None,
            None,
        ))
        .await
        .expect("response");
    let json = body_json(response).await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["items"][0]["resource_id"], "inv-3");

    let response = ledger
        .router
        .clone()
        .oneshot(request(Method::GET, "/audit-events?page=2&per_page=2", Some(TENANT), None, None))
        .await
        .expect("response");
    let json = body_json(response).await;
    assert_eq!(json["page"], 2);
    assert_eq!(json["per_page"], 2);
    assert_eq!(json["total"], 5);
    assert_eq!(json["items"].as_array().map(Vec::len), Some(2));

    let response = ledger
        .router
        .clone()
        .oneshot(request(Method::GET, "/audit-events?from=2024-02-01&to=2024-01-01", Some(TENANT), None, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let ledger = test_ledger().await;
    let response = ledger
        .router
        .clone()
        .oneshot(request(Method::GET, "/api-docs/openapi.json", None, None, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["paths"]["/consent/grant"].is_object());
}
