use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::models::tenant::TenantScope;

pub const AUDIT_EVENTS_TABLE: &str = "audit_events";
/// Postgres truncates identifiers past 63 bytes.
const MAX_IDENTIFIER_LENGTH: usize = 63;
const TENANT_SLUG_LENGTH: usize = 24;

/// One calendar-month bucket, `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonthBucket {
    pub year: i32,
    pub month: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl MonthBucket {
    pub fn label(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// A tenant-month partition of the audit event table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionSpec {
    pub tenant: TenantScope,
    pub bucket: MonthBucket,
}

impl PartitionSpec {
    pub fn new(tenant: TenantScope, bucket: MonthBucket) -> Self {
        Self { tenant, bucket }
    }

    /// Name of the per-tenant partition (LIST on tenant_id).
    pub fn tenant_table(&self) -> String {
        tenant_table_name(&self.tenant)
    }

    /// Name of the per-tenant, per-month partition (RANGE on event_timestamp).
    pub fn month_table(&self) -> String {
        format!("{}_p{}", self.tenant_table(), self.bucket.label())
    }
}

/// Builds a deterministic identifier such as `audit_events_t_acme_1a2b3c4d`.
/// The hash suffix keeps names distinct when two tenant ids only differ in
/// case or punctuation.
pub fn tenant_table_name(tenant: &TenantScope) -> String {
    let slug: String = tenant
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(TENANT_SLUG_LENGTH)
        .collect();
    let digest = Sha256::digest(tenant.as_str().as_bytes());
    let suffix = hex::encode(&digest[..4]);
    let name = format!("{}_t_{}_{}", AUDIT_EVENTS_TABLE, slug, suffix);
    debug_assert!(name.len() + "_p000000".len() <= MAX_IDENTIFIER_LENGTH);
    name
}
