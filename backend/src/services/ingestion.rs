//! Pulls events off the message log and persists them.
//!
//! A message is acked only after its writes succeed. Validation failures
//! are acked too since redelivery cannot fix them; everything else is
//! NAKed and redelivered. Generic audit events are append-only, so a
//! redelivered one becomes a second row. Consent events are idempotent on
//! their `event_id`. An event landing in a month with no partition gets
//! that partition provisioned before its write is retried once.

use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Disposition, LedgerError},
    events::{decode, schema::AuditEventPayload, LedgerEvent},
    messaging::{LogMessage, MessageLog},
    models::{audit_event::NewAuditEvent, consent::ConsentApplyOutcome},
    repositories::AuditEventRepositoryTrait,
    services::{consent_ledger::ConsentLedger, partition_manager::PartitionLifecycleManager},
    types::AuditEventId,
    utils::envelope::EnvelopeEncryptor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Persisted,
    /// A consent event whose `event_id` was already applied.
    AlreadyApplied,
}

#[derive(Clone)]
pub struct AuditIngestionConsumer {
    encryptor: EnvelopeEncryptor,
    audit_events: Arc<dyn AuditEventRepositoryTrait>,
    partitions: Arc<PartitionLifecycleManager>,
    consent: Arc<ConsentLedger>,
    retry_delay: Duration,
}

impl AuditIngestionConsumer {
    pub fn new(
        encryptor: EnvelopeEncryptor,
        audit_events: Arc<dyn AuditEventRepositoryTrait>,
        partitions: Arc<PartitionLifecycleManager>,
        consent: Arc<ConsentLedger>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            encryptor,
            audit_events,
            partitions,
            consent,
            retry_delay,
        }
    }

    /// Decodes, encrypts and persists one payload.
    pub async fn process(&self, payload: &[u8]) -> Result<IngestOutcome, LedgerError> {
        let event = decode(payload)?;
        tracing::debug!(
            tenant_id = event.tenant_id(),
            event_kind = event.kind(),
            "Decoded event"
        );
        let outcome = match &event {
            LedgerEvent::AuditEvent(payload) => {
                let sealed = self.seal(payload).await?;
                self.partitions
                    .write_provisioned(|| self.audit_events.insert(&sealed))
                    .await?;
                IngestOutcome::Persisted
            }
            LedgerEvent::ConsentGranted(payload) => {
                outcome_of(self.consent.apply_grant(payload).await?)
            }
            LedgerEvent::ConsentRevoked(payload) => {
                outcome_of(self.consent.apply_revoke(payload).await?)
            }
        };
        Ok(outcome)
    }

    /// Processes one delivery and settles it on the log.
    pub async fn handle(&self, message: &dyn LogMessage) -> Disposition {
        let subject = message.subject();
        let stream_sequence = message.stream_sequence();
        let delivered = message.delivered();

        let disposition = match self.process(message.payload()).await {
            Ok(outcome) => {
                tracing::debug!(
                    subject,
                    stream_sequence,
                    delivered,
                    ?outcome,
                    "Event persisted"
                );
                Disposition::Ack
            }
            Err(err) => {
                self.report_failure(subject, stream_sequence, delivered, &err)
                    .await;
                err.disposition()
            }
        };

        let settled = match disposition {
            Disposition::Ack => message.ack().await,
            Disposition::Retry => message.nak(self.retry_delay).await,
        };
        if let Err(err) = settled {
            // The broker redelivers after the ack wait either way.
            tracing::warn!(
                subject,
                stream_sequence,
                ?disposition,
                error = %err,
                "Failed to settle message"
            );
        }
        disposition
    }

    /// Consumes `subject` until `cancel` fires. The in-flight message is
    /// always finished before the loop exits.
    pub async fn run(
        self: Arc<Self>,
        log: Arc<dyn MessageLog>,
        subject: String,
        cancel: CancellationToken,
    ) {
        let mut subscription = loop {
            match log.subscribe(&subject).await {
                Ok(subscription) => break subscription,
                Err(err) => {
                    tracing::error!(subject = %subject, error = %err, "Subscribe failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        };
        tracing::info!(subject = %subject, "Ingestion consumer started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = subscription.next_message() => next,
            };
            match next {
                Some(Ok(message)) => {
                    self.handle(message.as_ref()).await;
                }
                Some(Err(err)) => {
                    tracing::warn!(subject = %subject, error = %err, "Pull failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                None => {
                    tracing::warn!(subject = %subject, "Subscription closed");
                    break;
                }
            }
        }
        tracing::info!(subject = %subject, "Ingestion consumer stopped");
    }

    async fn seal(&self, payload: &AuditEventPayload) -> Result<NewAuditEvent, LedgerError> {
        let actor_email_enc = match payload.actor_email.as_deref().map(str::trim) {
            Some(email) if !email.is_empty() => Some(self.encryptor.encrypt(email).await?),
            _ => None,
        };
        let before_value_enc = match &payload.before_value {
            Some(value) => Some(self.encryptor.encrypt_json(value).await?),
            None => None,
        };
        let after_value_enc = match &payload.after_value {
            Some(value) => Some(self.encryptor.encrypt_json(value).await?),
            None => None,
        };

        Ok(NewAuditEvent {
            id: AuditEventId::new(),
            tenant_id: payload.tenant_id.clone(),
            event_timestamp: payload.timestamp,
            actor_type: payload.actor_type.clone(),
            actor_id: payload.actor_id.clone(),
            actor_email_enc,
            action: payload.action,
            resource_type: payload.resource_type.clone(),
            resource_id: payload.resource_id.clone(),
            before_value_enc,
            after_value_enc,
            metadata: payload.metadata.clone(),
            source_event_id: payload.event_id,
        })
    }

    async fn report_failure(
        &self,
        subject: &str,
        stream_sequence: u64,
        delivered: i64,
        err: &LedgerError,
    ) {
        match err {
            LedgerError::Validation(_) => tracing::warn!(
                subject,
                stream_sequence,
                delivered,
                error = %err,
                "Skipping malformed event"
            ),
            LedgerError::Integrity(_) => tracing::error!(
                alert = true,
                subject,
                stream_sequence,
                delivered,
                error = %err,
                "Integrity failure while ingesting event"
            ),
            LedgerError::PartitionMissing { tenant_id, timestamp } => {
                tracing::error!(
                    subject,
                    stream_sequence,
                    delivered,
                    tenant_id = %tenant_id,
                    event_timestamp = %timestamp,
                    "Partition still missing after provisioning"
                );
                self.partitions.waker().notify_one();
            }
            _ => tracing::warn!(
                subject,
                stream_sequence,
                delivered,
                code = err.code(),
                error = %err,
                "Event not persisted, will be redelivered"
            ),
        }
    }
}

fn outcome_of(applied: ConsentApplyOutcome) -> IngestOutcome {
    match applied {
        ConsentApplyOutcome::Applied => IngestOutcome::Persisted,
        ConsentApplyOutcome::AlreadyApplied => IngestOutcome::AlreadyApplied,
    }
}
