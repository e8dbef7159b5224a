//! Durable message log the ingestion consumers read from.

pub mod jetstream;
pub mod memory;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::LedgerError;

/// One delivery of a message. It stays pending on the log until acked.
#[async_trait]
pub trait LogMessage: Send + Sync {
    fn subject(&self) -> &str;
    fn payload(&self) -> &[u8];
    fn stream_sequence(&self) -> u64;
    /// How many times this message has been delivered, starting at 1.
    fn delivered(&self) -> i64;
    async fn ack(&self) -> Result<(), LedgerError>;
    /// Negative acknowledgement: ask for redelivery after `delay`.
    async fn nak(&self, delay: Duration) -> Result<(), LedgerError>;
}

#[async_trait]
pub trait MessageSubscription: Send {
    /// `None` once the subscription is closed.
    async fn next_message(&mut self) -> Option<Result<Box<dyn LogMessage>, LedgerError>>;
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Attaches to the durable consumer group for `subject`.
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn MessageSubscription>, LedgerError>;
}
