use axum::{
    extract::{Extension, Path, Query, State},
    http::HeaderValue,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::{IntoParams, ToSchema};

use crate::{
    error::AppError,
    middleware::GatewayContext,
    models::{audit_event::AuditAction, Page},
    repositories::AuditEventFilters,
    state::AppState,
    types::AuditEventId,
    utils::pii::PiiPolicy,
};

pub const PII_MASKED_HEADER: &str = "x-pii-masked";

#[derive(Debug, Default, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct AuditEventListQuery {
    /// Inclusive lower bound (RFC3339 or YYYY-MM-DD).
    pub from: Option<String>,
    /// Inclusive upper bound (RFC3339 or YYYY-MM-DD, end of day).
    pub to: Option<String>,
    pub actor_type: Option<String>,
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

pub async fn list_audit_events(
    State(state): State<AppState>,
    Extension(context): Extension<GatewayContext>,
    Query(q): Query<AuditEventListQuery>,
) -> Result<Response, AppError> {
    let page = Page::new(q.page, q.per_page);
    let filters = build_filters(q)?;
    let policy = context.pii_policy();
    let events = state
        .query
        .list_audit_events(&context.tenant, &filters, page, policy)
        .await?;
    Ok(with_pii_header(Json(events).into_response(), policy))
}

pub async fn get_audit_event(
    State(state): State<AppState>,
    Extension(context): Extension<GatewayContext>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = AuditEventId::from_str(&id)
        .map_err(|_| AppError::BadRequest("Invalid audit event ID".into()))?;
    let policy = context.pii_policy();
    let event = state
        .query
        .get_audit_event(&context.tenant, id, policy)
        .await?;
    Ok(with_pii_header(Json(event).into_response(), policy))
}

fn with_pii_header(mut response: Response, policy: PiiPolicy) -> Response {
    response.headers_mut().insert(
        PII_MASKED_HEADER,
        HeaderValue::from_static(policy.header_value()),
    );
    response
}

fn build_filters(q: AuditEventListQuery) -> Result<AuditEventFilters, AppError> {
    let from = parse_bound(q.from.as_deref(), true)
        .map_err(|_| AppError::BadRequest("`from` must be a valid datetime (RFC3339 or YYYY-MM-DD)".into()))?;
    let to = parse_bound(q.to.as_deref(), false)
        .map_err(|_| AppError::BadRequest("`to` must be a valid datetime (RFC3339 or YYYY-MM-DD)".into()))?;
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(AppError::BadRequest(
                "`from` must be before or equal to `to`".into(),
            ));
        }
    }

    let action = normalize_filter(q.action)
        .map(|raw| {
            AuditAction::from_str(&raw)
                .map_err(|_| AppError::BadRequest(format!("Unknown action '{}'", raw)))
        })
        .transpose()?;

    Ok(AuditEventFilters {
        from,
        to,
        actor_type: normalize_filter(q.actor_type),
        actor_id: normalize_filter(q.actor_id),
        action,
        resource_type: normalize_filter(q.resource_type),
        resource_id: normalize_filter(q.resource_id),
    })
}

pub(crate) fn normalize_filter(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bound(raw: Option<&str>, is_start: bool) -> Result<Option<DateTime<Utc>>, ()> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => parse_datetime_value(value, is_start).map(Some).ok_or(()),
        None => Ok(None),
    }
}

fn parse_datetime_value(value: &str, is_start: bool) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let time = if is_start {
        NaiveTime::from_hms_opt(0, 0, 0)
    } else {
        NaiveTime::from_hms_opt(23, 59, 59)
    }?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(
        NaiveDateTime::new(date, time),
        Utc,
    ))
}
