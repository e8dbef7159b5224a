use chrono::{DateTime, Utc};
use thiserror::Error;

/// SQLSTATE raised by Postgres when a row matches no partition.
const PG_CHECK_VIOLATION: &str = "23514";
const NO_PARTITION_MESSAGE: &str = "no partition of relation";

/// Errors produced by the ledger pipeline (ingestion, encryption, storage).
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Storage or transit backend could not be reached in time.
    #[error("Transient backend failure: {0}")]
    Transient(String),

    /// Envelope tag did not verify.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Malformed or unknown event payload.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The write targets a tenant/month bucket with no partition yet.
    #[error("No partition provisioned for tenant '{tenant_id}' at {timestamp}")]
    PartitionMissing {
        tenant_id: String,
        timestamp: DateTime<Utc>,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[source] sqlx::Error),
}

/// What the ingestion loop must do with the message that produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Commit the offset; redelivery cannot change the outcome.
    Ack,
    /// Leave uncommitted so the log redelivers it.
    Retry,
}

impl LedgerError {
    /// Classifies a sqlx error, recognising writes that hit no partition.
    pub fn from_sqlx(err: sqlx::Error, tenant_id: &str, timestamp: DateTime<Utc>) -> Self {
        if is_missing_partition(&err) {
            return LedgerError::PartitionMissing {
                tenant_id: tenant_id.to_string(),
                timestamp,
            };
        }
        LedgerError::from(err)
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            LedgerError::Validation(_) => Disposition::Ack,
            LedgerError::Transient(_)
            | LedgerError::Integrity(_)
            | LedgerError::PartitionMissing { .. }
            | LedgerError::NotFound(_)
            | LedgerError::Storage(_) => Disposition::Retry,
        }
    }

    /// Stable machine-readable code used in logs and API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Transient(_) => "TRANSIENT_ERROR",
            LedgerError::Integrity(_) => "INTEGRITY_ERROR",
            LedgerError::Validation(_) => "VALIDATION_ERROR",
            LedgerError::PartitionMissing { .. } => "PARTITION_UNAVAILABLE",
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                LedgerError::Transient(err.to_string())
            }
            sqlx::Error::RowNotFound => LedgerError::NotFound("Resource not found".to_string()),
            other => LedgerError::Storage(other),
        }
    }
}

impl From<validator::ValidationErrors> for LedgerError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {}", field, e.code.as_ref()))
            })
            .collect();
        messages.sort();
        if messages.is_empty() {
            messages.push(errors.to_string());
        }
        LedgerError::Validation(messages.join(", "))
    }
}

fn is_missing_partition(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some(PG_CHECK_VIOLATION)
                && db.message().contains(NO_PARTITION_MESSAGE)
        }
        _ => false,
    }
}
