//! Inbound event payloads as published on the message log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    models::{audit_event::AuditAction, consent::SubjectType},
    types::EventId,
    validation::rules,
};

/// A generic audit action reported by a producing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AuditEventPayload {
    /// Optional producer-side identifier, kept as `source_event_id`.
    #[serde(default)]
    pub event_id: Option<EventId>,
    #[validate(custom(function = "rules::validate_tenant_id"))]
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    #[validate(
        length(max = 64),
        custom(function = "rules::validate_not_blank")
    )]
    pub actor_type: String,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub actor_id: Option<String>,
    #[serde(default)]
    #[validate(length(max = 320))]
    pub actor_email: Option<String>,
    pub action: AuditAction,
    #[validate(
        length(max = 100),
        custom(function = "rules::validate_not_blank")
    )]
    pub resource_type: String,
    #[validate(
        length(max = 255),
        custom(function = "rules::validate_not_blank")
    )]
    pub resource_id: String,
    #[serde(default)]
    pub before_value: Option<Value>,
    #[serde(default)]
    pub after_value: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, ToSchema)]
pub struct ConsentChoice {
    #[validate(custom(function = "rules::validate_purpose_code"))]
    pub purpose_code: String,
    pub granted: bool,
}

/// Request context captured where the consent was given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate, ToSchema)]
pub struct ConsentRequestMetadata {
    #[serde(default)]
    #[validate(length(max = 64))]
    pub ip: Option<String>,
    #[serde(default)]
    #[validate(length(max = 512))]
    pub user_agent: Option<String>,
    #[serde(default)]
    #[validate(length(max = 128))]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ConsentGrantedPayload {
    pub event_id: EventId,
    #[validate(custom(function = "rules::validate_tenant_id"))]
    pub tenant_id: String,
    pub subject_type: SubjectType,
    #[validate(
        length(max = 255),
        custom(function = "rules::validate_not_blank")
    )]
    pub subject_id: String,
    #[validate(
        length(max = 64),
        custom(function = "rules::validate_not_blank")
    )]
    pub consent_method: String,
    #[validate(
        length(max = 32),
        custom(function = "rules::validate_not_blank")
    )]
    pub policy_version: String,
    #[serde(default)]
    #[validate(nested)]
    pub consents: Vec<ConsentChoice>,
    /// Advisory only: the ledger derives required purposes from its own
    /// reference table.
    #[serde(default)]
    pub required_consents: Vec<String>,
    #[serde(default)]
    #[validate(nested)]
    pub metadata: ConsentRequestMetadata,
    /// When the subject gave consent; processing time when absent.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ConsentRevokedPayload {
    pub event_id: EventId,
    #[validate(custom(function = "rules::validate_tenant_id"))]
    pub tenant_id: String,
    pub subject_type: SubjectType,
    #[validate(
        length(max = 255),
        custom(function = "rules::validate_not_blank")
    )]
    pub subject_id: String,
    #[validate(custom(function = "rules::validate_purpose_code"))]
    pub purpose_code: String,
    pub revoked_at: DateTime<Utc>,
    #[serde(default)]
    #[validate(nested)]
    pub metadata: ConsentRequestMetadata,
}
