use std::fmt;

use crate::{error::LedgerError, validation::rules::validate_tenant_id};

/// A validated tenant identifier. Every read and write in the ledger is
/// scoped by one; there is no way to build a query without it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantScope(String);

impl TenantScope {
    pub fn new(raw: &str) -> Result<Self, LedgerError> {
        let trimmed = raw.trim();
        validate_tenant_id(trimmed)
            .map_err(|e| LedgerError::Validation(format!("tenant_id: {}", e.code)))?;
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantScope {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
