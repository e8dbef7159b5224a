pub mod audit_event;
pub mod common;
pub mod consent;
pub mod memory;
pub mod partition;

pub use audit_event::{AuditEventFilters, AuditEventRepositoryTrait, PgAuditEventRepository};
pub use consent::{ConsentRecordFilters, ConsentRepositoryTrait, PgConsentRepository};
pub use memory::InMemoryLedgerStore;
pub use partition::{PartitionOutcome, PartitionRepositoryTrait, PgPartitionRepository};
