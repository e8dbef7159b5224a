use axum::{
    extract::{Extension, Path, Query, State},
    http::{header::USER_AGENT, HeaderMap},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::{
    error::AppError,
    events::{
        schema::{ConsentChoice, ConsentGrantedPayload, ConsentRequestMetadata, ConsentRevokedPayload},
        validate_grant,
    },
    handlers::audit_events::normalize_filter,
    middleware::{GatewayContext, RequestId},
    models::{
        consent::{
            ConsentApplyOutcome, ConsentPurpose, ConsentRecordResponse, ConsentStatusResponse,
            PrivacyPolicy, Subject, SubjectType,
        },
        Page, PageResponse,
    },
    repositories::ConsentRecordFilters,
    state::AppState,
    types::EventId,
    validation::rules,
};

#[derive(Debug, Deserialize, Serialize, Validate, ToSchema)]
pub struct GrantConsentRequest {
    /// Idempotency key; generated when absent.
    #[schema(value_type = Option<String>)]
    pub event_id: Option<EventId>,
    pub subject_type: SubjectType,
    #[validate(length(max = 255), custom(function = "rules::validate_not_blank"))]
    pub subject_id: String,
    #[validate(length(max = 64), custom(function = "rules::validate_not_blank"))]
    pub consent_method: String,
    /// Defaults to the current privacy policy.
    pub policy_version: Option<String>,
    #[serde(default)]
    pub consents: Vec<ConsentChoice>,
    #[serde(default)]
    pub required_consents: Vec<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Serialize, Validate, ToSchema)]
pub struct RevokeConsentRequest {
    #[schema(value_type = Option<String>)]
    pub event_id: Option<EventId>,
    pub subject_type: SubjectType,
    #[validate(length(max = 255), custom(function = "rules::validate_not_blank"))]
    pub subject_id: String,
    #[validate(custom(function = "rules::validate_purpose_code"))]
    pub purpose_code: String,
    /// Defaults to now.
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConsentMutationResponse {
    #[schema(value_type = String)]
    pub event_id: EventId,
    pub outcome: ConsentApplyOutcome,
    pub purposes: BTreeMap<String, bool>,
}

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct ConsentStatusQuery {
    pub subject_type: SubjectType,
    pub subject_id: String,
}

#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ConsentRecordListQuery {
    pub subject_type: Option<SubjectType>,
    pub subject_id: Option<String>,
    pub purpose_code: Option<String>,
    pub active: Option<bool>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

pub async fn list_purposes(
    State(state): State<AppState>,
) -> Result<Json<Vec<ConsentPurpose>>, AppError> {
    Ok(Json(state.consent_repository().list_purposes().await?))
}

pub async fn get_purpose(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<ConsentPurpose>, AppError> {
    state
        .consent_repository()
        .find_purpose(&code)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Consent purpose '{}' not found", code)))
}

pub async fn current_policy(
    State(state): State<AppState>,
) -> Result<Json<PrivacyPolicy>, AppError> {
    state
        .consent_repository()
        .current_policy()
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("No current privacy policy".into()))
}

pub async fn grant_consent(
    State(state): State<AppState>,
    Extension(context): Extension<GatewayContext>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<GrantConsentRequest>,
) -> Result<Json<ConsentMutationResponse>, AppError> {
    body.validate()?;
    let policy_version = match normalize_filter(body.policy_version) {
        Some(version) => version,
        None => state
            .consent_repository()
            .current_policy()
            .await?
            .map(|policy| policy.version)
            .ok_or_else(|| {
                AppError::Validation(vec!["policy_version: no current privacy policy".into()])
            })?,
    };

    let payload = ConsentGrantedPayload {
        event_id: body.event_id.unwrap_or_default(),
        tenant_id: context.tenant.as_str().to_string(),
        subject_type: body.subject_type,
        subject_id: body.subject_id.trim().to_string(),
        consent_method: body.consent_method.trim().to_string(),
        policy_version,
        consents: body.consents,
        required_consents: body.required_consents,
        metadata: request_metadata(&headers, &request_id),
        occurred_at: body.occurred_at,
    };
    validate_grant(&payload)?;

    let outcome = state.consent.apply_grant(&payload).await?;
    let subject = Subject {
        subject_type: payload.subject_type,
        subject_id: payload.subject_id,
    };
    let purposes = state.consent.status(&context.tenant, &subject).await?;
    Ok(Json(ConsentMutationResponse {
        event_id: payload.event_id,
        outcome,
        purposes,
    }))
}

pub async fn revoke_consent(
    State(state): State<AppState>,
    Extension(context): Extension<GatewayContext>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<RevokeConsentRequest>,
) -> Result<Json<ConsentMutationResponse>, AppError> {
    body.validate()?;
    let payload = ConsentRevokedPayload {
        event_id: body.event_id.unwrap_or_default(),
        tenant_id: context.tenant.as_str().to_string(),
        subject_type: body.subject_type,
        subject_id: body.subject_id.trim().to_string(),
        purpose_code: body.purpose_code,
        revoked_at: body.revoked_at.unwrap_or_else(Utc::now),
        metadata: request_metadata(&headers, &request_id),
    };
    payload.validate()?;

    let outcome = state.consent.apply_revoke(&payload).await?;
    let subject = Subject {
        subject_type: payload.subject_type,
        subject_id: payload.subject_id,
    };
    let purposes = state.consent.status(&context.tenant, &subject).await?;
    Ok(Json(ConsentMutationResponse {
        event_id: payload.event_id,
        outcome,
        purposes,
    }))
}

pub async fn consent_status(
    State(state): State<AppState>,
    Extension(context): Extension<GatewayContext>,
    Query(q): Query<ConsentStatusQuery>,
) -> Result<Json<ConsentStatusResponse>, AppError> {
    let subject_id = normalize_filter(Some(q.subject_id))
        .ok_or_else(|| AppError::BadRequest("subject_id is required".into()))?;
    let subject = Subject {
        subject_type: q.subject_type,
        subject_id,
    };
    let purposes = state.consent.status(&context.tenant, &subject).await?;
    Ok(Json(ConsentStatusResponse {
        subject_type: subject.subject_type,
        subject_id: subject.subject_id,
        purposes,
    }))
}

pub async fn list_consent_records(
    State(state): State<AppState>,
    Extension(context): Extension<GatewayContext>,
    Query(q): Query<ConsentRecordListQuery>,
) -> Result<Json<PageResponse<ConsentRecordResponse>>, AppError> {
    let page = Page::new(q.page, q.per_page);
    let filters = ConsentRecordFilters {
        subject_type: q.subject_type,
        subject_id: normalize_filter(q.subject_id),
        purpose_code: normalize_filter(q.purpose_code),
        active: q.active,
    };
    let records = state
        .query
        .list_consent_records(&context.tenant, &filters, page)
        .await?;
    Ok(Json(records))
}

fn request_metadata(headers: &HeaderMap, request_id: &RequestId) -> ConsentRequestMetadata {
    ConsentRequestMetadata {
        ip: extract_ip(headers),
        user_agent: extract_user_agent(headers),
        request_id: Some(request_id.0.clone()),
    }
}

fn extract_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        return value
            .split(',')
            .next()
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty());
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|agent| agent.trim().chars().take(512).collect::<String>())
        .filter(|agent| !agent.is_empty())
}
