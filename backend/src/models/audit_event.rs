use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

use crate::types::{AuditEventId, EventId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Create,
    Read,
    Update,
    Delete,
    Access,
    Export,
}

impl AuditAction {
    pub const ALL: [AuditAction; 6] = [
        AuditAction::Create,
        AuditAction::Read,
        AuditAction::Update,
        AuditAction::Delete,
        AuditAction::Access,
        AuditAction::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Read => "READ",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::Access => "ACCESS",
            AuditAction::Export => "EXPORT",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let upper = value.trim().to_ascii_uppercase();
        AuditAction::ALL
            .into_iter()
            .find(|action| action.as_str() == upper)
            .ok_or_else(|| format!("unknown audit action '{}'", value))
    }
}

/// An audit event ready to be written. Sensitive fields already hold
/// envelopes produced by the encryptor.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEvent {
    pub id: AuditEventId,
    pub tenant_id: String,
    pub event_timestamp: DateTime<Utc>,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub actor_email_enc: Option<String>,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub before_value_enc: Option<String>,
    pub after_value_enc: Option<String>,
    pub metadata: Option<Value>,
    pub source_event_id: Option<EventId>,
}

/// A stored audit event row. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEventRow {
    pub id: AuditEventId,
    pub tenant_id: String,
    pub event_timestamp: DateTime<Utc>,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub actor_email_enc: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub before_value_enc: Option<String>,
    pub after_value_enc: Option<String>,
    pub metadata: Option<Json<Value>>,
    pub source_event_id: Option<EventId>,
    pub inserted_at: DateTime<Utc>,
}

impl AuditEventRow {
    pub fn from_new(event: NewAuditEvent, inserted_at: DateTime<Utc>) -> Self {
        Self {
            id: event.id,
            tenant_id: event.tenant_id,
            event_timestamp: event.event_timestamp,
            actor_type: event.actor_type,
            actor_id: event.actor_id,
            actor_email_enc: event.actor_email_enc,
            action: event.action.as_str().to_string(),
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            before_value_enc: event.before_value_enc,
            after_value_enc: event.after_value_enc,
            metadata: event.metadata.map(Json),
            source_event_id: event.source_event_id,
            inserted_at,
        }
    }
}

/// Decrypted view of an audit event returned by the query API.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuditEventResponse {
    #[schema(value_type = String)]
    pub id: AuditEventId,
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub actor_email: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub before_value: Option<Value>,
    pub after_value: Option<Value>,
    pub metadata: Option<Value>,
    #[schema(value_type = Option<String>)]
    pub source_event_id: Option<EventId>,
    pub inserted_at: DateTime<Utc>,
    /// Fields whose envelope could not be opened; their value is redacted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redacted_fields: Vec<String>,
    /// Error code of the first decryption failure on this row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decrypt_error: Option<String>,
}
