pub mod audit_query;
pub mod consent_ledger;
pub mod ingestion;
pub mod partition_manager;

pub use audit_query::AuditQueryService;
pub use consent_ledger::ConsentLedger;
pub use ingestion::AuditIngestionConsumer;
pub use partition_manager::PartitionLifecycleManager;
