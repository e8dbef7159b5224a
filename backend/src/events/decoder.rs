use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use validator::Validate;

use crate::{
    error::LedgerError,
    events::schema::{AuditEventPayload, ConsentGrantedPayload, ConsentRevokedPayload},
    types::EventId,
    validation::rules::validate_purpose_code,
};

/// Field every payload carries to say what kind of event it is.
pub const DISCRIMINATOR: &str = "event_type";

/// Every event the ledger understands. Downstream code matches on this
/// exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum LedgerEvent {
    AuditEvent(AuditEventPayload),
    ConsentGranted(ConsentGrantedPayload),
    ConsentRevoked(ConsentRevokedPayload),
}

impl LedgerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::AuditEvent(_) => "audit_event",
            LedgerEvent::ConsentGranted(_) => "consent_granted",
            LedgerEvent::ConsentRevoked(_) => "consent_revoked",
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            LedgerEvent::AuditEvent(p) => &p.tenant_id,
            LedgerEvent::ConsentGranted(p) => &p.tenant_id,
            LedgerEvent::ConsentRevoked(p) => &p.tenant_id,
        }
    }

    pub fn event_id(&self) -> Option<EventId> {
        match self {
            LedgerEvent::AuditEvent(p) => p.event_id,
            LedgerEvent::ConsentGranted(p) => Some(p.event_id),
            LedgerEvent::ConsentRevoked(p) => Some(p.event_id),
        }
    }

    fn validate(&self) -> Result<(), LedgerError> {
        match self {
            LedgerEvent::AuditEvent(payload) => payload.validate()?,
            LedgerEvent::ConsentRevoked(payload) => payload.validate()?,
            LedgerEvent::ConsentGranted(payload) => validate_grant(payload)?,
        }
        Ok(())
    }
}

/// Field rules plus the checks that span the `consents` list.
pub fn validate_grant(payload: &ConsentGrantedPayload) -> Result<(), LedgerError> {
    payload.validate()?;
    let mut seen = HashSet::new();
    for choice in &payload.consents {
        if !seen.insert(choice.purpose_code.as_str()) {
            return Err(LedgerError::Validation(format!(
                "consents: duplicate purpose_code '{}'",
                choice.purpose_code
            )));
        }
    }
    for code in &payload.required_consents {
        validate_purpose_code(code)
            .map_err(|e| LedgerError::Validation(format!("required_consents: {}", e.code)))?;
    }
    Ok(())
}

/// Classifies and validates a raw message payload. Pure: no I/O, no clock.
pub fn decode(payload: &[u8]) -> Result<LedgerEvent, LedgerError> {
    let event: LedgerEvent = serde_json::from_slice(payload)
        .map_err(|e| LedgerError::Validation(format!("malformed event: {}", e)))?;
    event.validate()?;
    Ok(event)
}
