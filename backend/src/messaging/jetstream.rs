use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy},
    AckKind,
};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use std::time::Duration;

use crate::{
    config::{durable_consumer_name, Config},
    error::LedgerError,
    messaging::{LogMessage, MessageLog, MessageSubscription},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// JetStream-backed log. Each subject gets its own durable pull consumer
/// with explicit acks.
pub struct JetStreamMessageLog {
    stream: jetstream::stream::Stream,
    stream_name: String,
    ack_wait: Duration,
    ledger_name: String,
}

impl JetStreamMessageLog {
    pub async fn connect(config: &Config) -> Result<Self, LedgerError> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(CONNECT_TIMEOUT)
            .connect(config.nats_url.as_str())
            .await
            .map_err(|e| LedgerError::Transient(format!("{}: {}", config.nats_url, e)))?;
        tracing::info!(url = %config.nats_url, "Connected to NATS");

        let context = jetstream::new(client);
        let stream = context
            .get_or_create_stream(jetstream::stream::Config {
                name: config.nats_stream.clone(),
                subjects: config.ingestion_subjects.clone(),
                retention: jetstream::stream::RetentionPolicy::Limits,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                LedgerError::Transient(format!(
                    "Failed to create/get stream '{}': {}",
                    config.nats_stream, e
                ))
            })?;
        tracing::info!(
            stream = %config.nats_stream,
            subjects = ?config.ingestion_subjects,
            "JetStream stream ready"
        );

        Ok(Self {
            stream,
            stream_name: config.nats_stream.clone(),
            ack_wait: Duration::from_secs(config.ingestion_ack_wait_seconds),
            ledger_name: config.ledger_name.clone(),
        })
    }
}

#[async_trait]
impl MessageLog for JetStreamMessageLog {
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn MessageSubscription>, LedgerError> {
        let consumer_name = durable_consumer_name(&self.ledger_name, subject);
        let consumer = self
            .stream
            .get_or_create_consumer(
                &consumer_name,
                pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                LedgerError::Transient(format!(
                    "Failed to create durable consumer '{}': {}",
                    consumer_name, e
                ))
            })?;

        let messages = consumer.messages().await.map_err(|e| {
            LedgerError::Transient(format!("Failed to subscribe to '{}': {}", subject, e))
        })?;

        tracing::info!(
            stream = %self.stream_name,
            consumer = %consumer_name,
            filter = subject,
            "Durable subscription created"
        );

        Ok(Box::new(JetStreamSubscription {
            messages: messages.boxed(),
        }))
    }
}

struct JetStreamSubscription {
    messages: BoxStream<'static, Result<jetstream::Message, pull::MessagesError>>,
}

#[async_trait]
impl MessageSubscription for JetStreamSubscription {
    async fn next_message(&mut self) -> Option<Result<Box<dyn LogMessage>, LedgerError>> {
        let next = self.messages.next().await?;
        Some(
            next.map(|message| Box::new(JetStreamMessage::new(message)) as Box<dyn LogMessage>)
                .map_err(|e| LedgerError::Transient(format!("JetStream pull failed: {}", e))),
        )
    }
}

struct JetStreamMessage {
    message: jetstream::Message,
    stream_sequence: u64,
    delivered: i64,
}

impl JetStreamMessage {
    fn new(message: jetstream::Message) -> Self {
        let (stream_sequence, delivered) = message
            .info()
            .map(|info| (info.stream_sequence, info.delivered))
            .unwrap_or((0, 1));
        Self {
            message,
            stream_sequence,
            delivered,
        }
    }
}

#[async_trait]
impl LogMessage for JetStreamMessage {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn stream_sequence(&self) -> u64 {
        self.stream_sequence
    }

    fn delivered(&self) -> i64 {
        self.delivered
    }

    async fn ack(&self) -> Result<(), LedgerError> {
        self.message
            .ack()
            .await
            .map_err(|e| LedgerError::Transient(format!("ack failed: {}", e)))
    }

    async fn nak(&self, delay: Duration) -> Result<(), LedgerError> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| LedgerError::Transient(format!("nak failed: {}", e)))
    }
}
