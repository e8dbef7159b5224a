//! In-process implementation of every repository trait. Used by tests and
//! local runs; partitions are enforced the way Postgres enforces them.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    error::LedgerError,
    models::{
        audit_event::{AuditEventRow, NewAuditEvent},
        consent::{
            ConsentApplyOutcome, ConsentChange, ConsentMutation, ConsentPurpose, ConsentRecord,
            PrivacyPolicy, Subject,
        },
        partition::{MonthBucket, PartitionSpec},
        tenant::TenantScope,
        Page,
    },
    repositories::{
        audit_event::{AuditEventFilters, AuditEventRepositoryTrait},
        consent::{ConsentRecordFilters, ConsentRepositoryTrait},
        partition::{PartitionOutcome, PartitionRepositoryTrait},
    },
    types::{AuditEventId, ConsentRecordId, EventId},
};

type RecordKey = (String, String, String, String);

#[derive(Default)]
struct StoreState {
    tenants: BTreeSet<String>,
    partitions: BTreeMap<String, Vec<MonthBucket>>,
    audit_events: Vec<AuditEventRow>,
    consent_events: HashSet<EventId>,
    consent_records: BTreeMap<RecordKey, ConsentRecord>,
    purposes: Vec<ConsentPurpose>,
    policies: Vec<PrivacyPolicy>,
    #[cfg(any(test, feature = "test-support"))]
    faults: Faults,
}

/// Injected storage failures, consumed one per call.
#[cfg(any(test, feature = "test-support"))]
#[derive(Default)]
struct Faults {
    failing_writes: usize,
    failing_partitions: usize,
    write_attempts: usize,
}

impl StoreState {
    #[cfg(any(test, feature = "test-support"))]
    fn take_write_failure(&mut self) -> Result<(), LedgerError> {
        self.faults.write_attempts += 1;
        if self.faults.failing_writes > 0 {
            self.faults.failing_writes -= 1;
            return Err(LedgerError::Transient("storage unavailable".to_string()));
        }
        Ok(())
    }

    #[cfg(not(any(test, feature = "test-support")))]
    fn take_write_failure(&mut self) -> Result<(), LedgerError> {
        Ok(())
    }

    #[cfg(any(test, feature = "test-support"))]
    fn take_partition_failure(&mut self) -> Result<(), LedgerError> {
        if self.faults.failing_partitions > 0 {
            self.faults.failing_partitions -= 1;
            return Err(LedgerError::Transient("DDL lock timeout".to_string()));
        }
        Ok(())
    }

    #[cfg(not(any(test, feature = "test-support")))]
    fn take_partition_failure(&mut self) -> Result<(), LedgerError> {
        Ok(())
    }

    fn check_partition(&self, event: &NewAuditEvent) -> Result<(), LedgerError> {
        let covered = self
            .partitions
            .get(&event.tenant_id)
            .map_or(false, |buckets| {
                buckets.iter().any(|b| b.contains(event.event_timestamp))
            });
        if covered {
            Ok(())
        } else {
            Err(LedgerError::PartitionMissing {
                tenant_id: event.tenant_id.clone(),
                timestamp: event.event_timestamp,
            })
        }
    }

    fn record_key(tenant_id: &str, subject: &Subject, purpose_code: &str) -> RecordKey {
        (
            tenant_id.to_string(),
            subject.subject_type.as_str().to_string(),
            subject.subject_id.clone(),
            purpose_code.to_string(),
        )
    }
}

#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_purpose(&self, code: &str, name: &str, required: bool, display_order: i32) {
        let mut state = self.lock();
        state.purposes.retain(|p| p.code != code);
        state.purposes.push(ConsentPurpose {
            code: code.to_string(),
            name: name.to_string(),
            description: None,
            required,
            display_order,
        });
    }

    /// Makes `version` the single current policy.
    pub fn set_current_policy(&self, version: &str, effective_date: NaiveDate) {
        let mut state = self.lock();
        for policy in state.policies.iter_mut() {
            policy.is_current = false;
        }
        state.policies.retain(|p| p.version != version);
        state.policies.push(PrivacyPolicy {
            version: version.to_string(),
            effective_date,
            is_current: true,
        });
    }

    /// The next `count` writes (audit inserts or consent applies) fail with a
    /// transient error before touching any state.
    #[cfg(any(test, feature = "test-support"))]
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().faults.failing_writes = count;
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn fail_next_partitions(&self, count: usize) {
        self.lock().faults.failing_partitions = count;
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn write_attempts(&self) -> usize {
        self.lock().faults.write_attempts
    }

    pub fn audit_events(&self) -> Vec<AuditEventRow> {
        self.lock().audit_events.clone()
    }

    pub fn consent_records(&self) -> Vec<ConsentRecord> {
        self.lock().consent_records.values().cloned().collect()
    }

    pub fn partitions(&self, tenant: &TenantScope) -> Vec<MonthBucket> {
        let mut buckets = self
            .lock()
            .partitions
            .get(tenant.as_str())
            .cloned()
            .unwrap_or_default();
        buckets.sort();
        buckets
    }
}

#[async_trait]
impl AuditEventRepositoryTrait for InMemoryLedgerStore {
    async fn insert(&self, event: &NewAuditEvent) -> Result<AuditEventRow, LedgerError> {
        let mut state = self.lock();
        state.take_write_failure()?;
        state.check_partition(event)?;
        let row = AuditEventRow::from_new(event.clone(), Utc::now());
        state.audit_events.push(row.clone());
        Ok(row)
    }

    async fn fetch(
        &self,
        tenant: &TenantScope,
        id: AuditEventId,
    ) -> Result<Option<AuditEventRow>, LedgerError> {
        Ok(self
            .lock()
            .audit_events
            .iter()
            .find(|row| row.tenant_id == tenant.as_str() && row.id == id)
            .cloned())
    }

    async fn list(
        &self,
        tenant: &TenantScope,
        filters: &AuditEventFilters,
        page: Page,
    ) -> Result<Vec<AuditEventRow>, LedgerError> {
        let state = self.lock();
        let mut rows: Vec<AuditEventRow> = state
            .audit_events
            .iter()
            .filter(|row| row.tenant_id == tenant.as_str() && filters.matches(row))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.event_timestamp
                .cmp(&a.event_timestamp)
                .then_with(|| b.id.as_uuid().cmp(a.id.as_uuid()))
        });
        Ok(rows
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.per_page as usize)
            .collect())
    }

    async fn count(
        &self,
        tenant: &TenantScope,
        filters: &AuditEventFilters,
    ) -> Result<i64, LedgerError> {
        Ok(self
            .lock()
            .audit_events
            .iter()
            .filter(|row| row.tenant_id == tenant.as_str() && filters.matches(row))
            .count() as i64)
    }
}

#[async_trait]
impl ConsentRepositoryTrait for InMemoryLedgerStore {
    async fn list_purposes(&self) -> Result<Vec<ConsentPurpose>, LedgerError> {
        let mut purposes = self.lock().purposes.clone();
        purposes.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.code.cmp(&b.code))
        });
        Ok(purposes)
    }

    async fn find_purpose(&self, code: &str) -> Result<Option<ConsentPurpose>, LedgerError> {
        Ok(self.lock().purposes.iter().find(|p| p.code == code).cloned())
    }

    async fn current_policy(&self) -> Result<Option<PrivacyPolicy>, LedgerError> {
        Ok(self.lock().policies.iter().find(|p| p.is_current).cloned())
    }

    async fn apply(&self, mutation: &ConsentMutation) -> Result<ConsentApplyOutcome, LedgerError> {
        let mut state = self.lock();
        state.take_write_failure()?;
        if state.consent_events.contains(&mutation.event_id) {
            return Ok(ConsentApplyOutcome::AlreadyApplied);
        }
        // Checked before any write so a failure leaves nothing behind.
        state.check_partition(&mutation.audit)?;

        let now = Utc::now();
        for upsert in &mutation.upserts {
            let key = StoreState::record_key(
                &mutation.tenant_id,
                &upsert.subject,
                &upsert.purpose_code,
            );
            let existing = state.consent_records.get(&key).cloned();
            if let Some(current) = existing.as_ref() {
                if current.last_event_at > mutation.occurred_at {
                    continue;
                }
            }
            let mut record = existing.unwrap_or_else(|| ConsentRecord {
                id: ConsentRecordId::new(),
                tenant_id: mutation.tenant_id.clone(),
                subject_type: upsert.subject.subject_type.as_str().to_string(),
                subject_id: upsert.subject.subject_id.clone(),
                purpose_code: upsert.purpose_code.clone(),
                granted: false,
                policy_version: None,
                consent_method: None,
                revoked_at: None,
                last_event_id: mutation.event_id,
                last_event_at: mutation.occurred_at,
                created_at: now,
                updated_at: now,
            });
            match &upsert.change {
                ConsentChange::Grant {
                    granted,
                    policy_version,
                    consent_method,
                } => {
                    record.granted = *granted;
                    record.policy_version = Some(policy_version.clone());
                    record.consent_method = Some(consent_method.clone());
                    record.revoked_at = None;
                }
                ConsentChange::Revoke { revoked_at } => {
                    record.revoked_at = Some(*revoked_at);
                }
            }
            record.last_event_id = mutation.event_id;
            record.last_event_at = mutation.occurred_at;
            record.updated_at = now;
            state.consent_records.insert(key, record);
        }

        let row = AuditEventRow::from_new(mutation.audit.clone(), now);
        state.audit_events.push(row);
        state.consent_events.insert(mutation.event_id);
        Ok(ConsentApplyOutcome::Applied)
    }

    async fn records_for_subject(
        &self,
        tenant: &TenantScope,
        subject: &Subject,
    ) -> Result<Vec<ConsentRecord>, LedgerError> {
        Ok(self
            .lock()
            .consent_records
            .values()
            .filter(|r| {
                r.tenant_id == tenant.as_str()
                    && r.subject_type == subject.subject_type.as_str()
                    && r.subject_id == subject.subject_id
            })
            .cloned()
            .collect())
    }

    async fn list_records(
        &self,
        tenant: &TenantScope,
        filters: &ConsentRecordFilters,
        page: Page,
    ) -> Result<Vec<ConsentRecord>, LedgerError> {
        let mut records: Vec<ConsentRecord> = self
            .lock()
            .consent_records
            .values()
            .filter(|r| r.tenant_id == tenant.as_str() && filters.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.id.as_uuid().cmp(a.id.as_uuid()))
        });
        Ok(records
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.per_page as usize)
            .collect())
    }

    async fn count_records(
        &self,
        tenant: &TenantScope,
        filters: &ConsentRecordFilters,
    ) -> Result<i64, LedgerError> {
        Ok(self
            .lock()
            .consent_records
            .values()
            .filter(|r| r.tenant_id == tenant.as_str() && filters.matches(r))
            .count() as i64)
    }
}

#[async_trait]
impl PartitionRepositoryTrait for InMemoryLedgerStore {
    async fn list_tenants(&self) -> Result<Vec<TenantScope>, LedgerError> {
        self.lock()
            .tenants
            .iter()
            .map(|id| TenantScope::new(id))
            .collect()
    }

    async fn register_tenant(&self, tenant: &TenantScope) -> Result<bool, LedgerError> {
        Ok(self.lock().tenants.insert(tenant.as_str().to_string()))
    }

    async fn ensure_partition(
        &self,
        spec: &PartitionSpec,
    ) -> Result<PartitionOutcome, LedgerError> {
        let mut state = self.lock();
        state.take_partition_failure()?;
        let buckets = state
            .partitions
            .entry(spec.tenant.as_str().to_string())
            .or_default();
        if buckets.contains(&spec.bucket) {
            return Ok(PartitionOutcome::AlreadyExists);
        }
        buckets.push(spec.bucket);
        Ok(PartitionOutcome::Created)
    }
}
