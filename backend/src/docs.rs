#![allow(dead_code)] // OpenAPI doc stubs are only referenced by utoipa macros.

use utoipa::OpenApi;

use crate::{
    error::ErrorResponse,
    events::schema::ConsentChoice,
    handlers::{
        audit_events::AuditEventListQuery,
        consents::{
            ConsentMutationResponse, ConsentRecordListQuery, ConsentStatusQuery,
            GrantConsentRequest, RevokeConsentRequest,
        },
        HealthResponse,
    },
    models::{
        audit_event::AuditEventResponse,
        consent::{
            ConsentApplyOutcome, ConsentPurpose, ConsentRecordResponse, ConsentStatusResponse,
            PrivacyPolicy, SubjectType,
        },
        PageResponse,
    },
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_doc,
        list_audit_events_doc,
        get_audit_event_doc,
        list_consent_records_doc,
        list_purposes_doc,
        get_purpose_doc,
        current_policy_doc,
        grant_consent_doc,
        revoke_consent_doc,
        consent_status_doc
    ),
    components(schemas(
        ErrorResponse,
        HealthResponse,
        AuditEventResponse,
        ConsentRecordResponse,
        ConsentPurpose,
        PrivacyPolicy,
        ConsentStatusResponse,
        ConsentMutationResponse,
        ConsentApplyOutcome,
        ConsentChoice,
        SubjectType,
        GrantConsentRequest,
        RevokeConsentRequest
    )),
    tags(
        (name = "Audit", description = "Tenant-scoped audit event queries"),
        (name = "Consent", description = "Consent state, reference data and mutations"),
        (name = "Health", description = "Liveness")
    )
)]
pub struct ApiDoc;

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "Health"
)]
fn health_doc() {}

#[utoipa::path(
    get,
    path = "/audit-events",
    params(AuditEventListQuery),
    responses(
        (status = 200, description = "Decrypted page; `x-pii-masked` states the masking policy", body = PageResponse<AuditEventResponse>),
        (status = 400, body = ErrorResponse),
        (status = 503, body = ErrorResponse)
    ),
    tag = "Audit"
)]
fn list_audit_events_doc() {}

#[utoipa::path(
    get,
    path = "/audit-events/{id}",
    params(("id" = String, Path, description = "Audit event id")),
    responses(
        (status = 200, body = AuditEventResponse),
        (status = 404, body = ErrorResponse)
    ),
    tag = "Audit"
)]
fn get_audit_event_doc() {}

#[utoipa::path(
    get,
    path = "/consent-records",
    params(ConsentRecordListQuery),
    responses((status = 200, body = PageResponse<ConsentRecordResponse>)),
    tag = "Consent"
)]
fn list_consent_records_doc() {}

#[utoipa::path(
    get,
    path = "/consent/purposes",
    responses((status = 200, body = Vec<ConsentPurpose>)),
    tag = "Consent"
)]
fn list_purposes_doc() {}

#[utoipa::path(
    get,
    path = "/consent/purposes/{code}",
    params(("code" = String, Path, description = "Purpose code")),
    responses(
        (status = 200, body = ConsentPurpose),
        (status = 404, body = ErrorResponse)
    ),
    tag = "Consent"
)]
fn get_purpose_doc() {}

#[utoipa::path(
    get,
    path = "/consent/policies/current",
    responses(
        (status = 200, body = PrivacyPolicy),
        (status = 404, body = ErrorResponse)
    ),
    tag = "Consent"
)]
fn current_policy_doc() {}

#[utoipa::path(
    post,
    path = "/consent/grant",
    request_body = GrantConsentRequest,
    responses(
        (status = 200, body = ConsentMutationResponse),
        (status = 400, body = ErrorResponse),
        (status = 503, body = ErrorResponse)
    ),
    tag = "Consent"
)]
fn grant_consent_doc() {}

#[utoipa::path(
    post,
    path = "/consent/revoke",
    request_body = RevokeConsentRequest,
    responses(
        (status = 200, body = ConsentMutationResponse),
        (status = 400, body = ErrorResponse)
    ),
    tag = "Consent"
)]
fn revoke_consent_doc() {}

#[utoipa::path(
    get,
    path = "/consent/status",
    params(ConsentStatusQuery),
    responses((status = 200, body = ConsentStatusResponse)),
    tag = "Consent"
)]
fn consent_status_doc() {}
