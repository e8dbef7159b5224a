use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{collections::BTreeMap, fmt, str::FromStr};
use utoipa::ToSchema;

use crate::{
    models::audit_event::NewAuditEvent,
    types::{ConsentRecordId, EventId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    Tenant,
    Guest,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Tenant => "tenant",
            SubjectType::Guest => "guest",
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tenant" => Ok(SubjectType::Tenant),
            "guest" => Ok(SubjectType::Guest),
            other => Err(format!("unknown subject type '{}'", other)),
        }
    }
}

/// The data subject a consent decision belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject {
    pub subject_type: SubjectType,
    pub subject_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConsentRecord {
    pub id: ConsentRecordId,
    pub tenant_id: String,
    pub subject_type: String,
    pub subject_id: String,
    pub purpose_code: String,
    pub granted: bool,
    pub policy_version: Option<String>,
    pub consent_method: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_event_id: EventId,
    pub last_event_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConsentRecord {
    pub fn is_active(&self) -> bool {
        self.granted && self.revoked_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConsentRecordResponse {
    #[schema(value_type = String)]
    pub id: ConsentRecordId,
    pub tenant_id: String,
    pub subject_type: String,
    pub subject_id: String,
    pub purpose_code: String,
    pub granted: bool,
    pub is_active: bool,
    pub policy_version: Option<String>,
    pub consent_method: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    #[schema(value_type = String)]
    pub last_event_id: EventId,
    pub updated_at: DateTime<Utc>,
}

impl From<ConsentRecord> for ConsentRecordResponse {
    fn from(record: ConsentRecord) -> Self {
        Self {
            is_active: record.is_active(),
            id: record.id,
            tenant_id: record.tenant_id,
            subject_type: record.subject_type,
            subject_id: record.subject_id,
            purpose_code: record.purpose_code,
            granted: record.granted,
            policy_version: record.policy_version,
            consent_method: record.consent_method,
            revoked_at: record.revoked_at,
            last_event_id: record.last_event_id,
            updated_at: record.updated_at,
        }
    }
}

/// Reference data: a named legal basis for processing.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct ConsentPurpose {
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub required: bool,
    pub display_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct PrivacyPolicy {
    pub version: String,
    pub effective_date: NaiveDate,
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConsentStatusResponse {
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub purposes: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentEventKind {
    Granted,
    Revoked,
}

impl ConsentEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentEventKind::Granted => "consent_granted",
            ConsentEventKind::Revoked => "consent_revoked",
        }
    }
}

/// State change applied to one (subject, purpose) pair.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsentChange {
    /// Sets `granted` and clears `revoked_at`.
    Grant {
        granted: bool,
        policy_version: String,
        consent_method: String,
    },
    /// Sets `revoked_at`, leaving the grant history as is.
    Revoke { revoked_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsentUpsert {
    pub subject: Subject,
    pub purpose_code: String,
    pub change: ConsentChange,
}

/// Everything one consent event writes, applied atomically: the idempotency
/// marker, the record upserts and the mirrored audit event.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsentMutation {
    pub event_id: EventId,
    pub tenant_id: String,
    pub kind: ConsentEventKind,
    pub occurred_at: DateTime<Utc>,
    pub upserts: Vec<ConsentUpsert>,
    pub audit: NewAuditEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConsentApplyOutcome {
    Applied,
    AlreadyApplied,
}
