//! In-process message log with JetStream-like delivery semantics: a message
//! stays pending until acked, a NAK requeues it and `delivered` counts
//! every attempt.

use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::Notify;

use crate::{
    error::LedgerError,
    messaging::{LogMessage, MessageLog, MessageSubscription},
};

#[derive(Debug, Clone)]
struct Stored {
    subject: String,
    payload: Vec<u8>,
    sequence: u64,
    delivered: i64,
}

#[derive(Default)]
struct LogState {
    next_sequence: u64,
    queues: HashMap<String, VecDeque<Stored>>,
    in_flight: HashMap<u64, Stored>,
    acked: Vec<u64>,
    naks: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<LogState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryMessageLog {
    shared: Arc<Shared>,
}

impl InMemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message and returns its stream sequence.
    pub fn publish(&self, subject: &str, payload: impl Into<Vec<u8>>) -> u64 {
        let sequence = {
            let mut state = self.shared.lock();
            state.next_sequence += 1;
            let sequence = state.next_sequence;
            state
                .queues
                .entry(subject.to_string())
                .or_default()
                .push_back(Stored {
                    subject: subject.to_string(),
                    payload: payload.into(),
                    sequence,
                    delivered: 0,
                });
            sequence
        };
        self.shared.notify.notify_waiters();
        sequence
    }

    pub fn acked(&self) -> Vec<u64> {
        self.shared.lock().acked.clone()
    }

    pub fn nak_count(&self) -> usize {
        self.shared.lock().naks
    }

    /// Messages not yet acked, queued or in flight.
    pub fn pending(&self) -> usize {
        let state = self.shared.lock();
        state.in_flight.len() + state.queues.values().map(VecDeque::len).sum::<usize>()
    }

    /// Requeues every delivered-but-unacked message, as the broker does once
    /// the ack wait of a crashed consumer expires.
    pub fn expire_in_flight(&self) -> usize {
        let count = {
            let mut state = self.shared.lock();
            let mut expired: Vec<Stored> = state.in_flight.drain().map(|(_, m)| m).collect();
            let count = expired.len();
            expired.sort_by_key(|m| m.sequence);
            for message in expired.into_iter().rev() {
                state
                    .queues
                    .entry(message.subject.clone())
                    .or_default()
                    .push_front(message);
            }
            count
        };
        self.shared.notify.notify_waiters();
        count
    }
}

#[async_trait]
impl MessageLog for InMemoryMessageLog {
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn MessageSubscription>, LedgerError> {
        Ok(Box::new(InMemorySubscription {
            shared: Arc::clone(&self.shared),
            subject: subject.to_string(),
        }))
    }
}

struct InMemorySubscription {
    shared: Arc<Shared>,
    subject: String,
}

impl InMemorySubscription {
    fn take(&self) -> Option<InMemoryMessage> {
        let mut state = self.shared.lock();
        let mut message = state.queues.get_mut(&self.subject)?.pop_front()?;
        message.delivered += 1;
        state.in_flight.insert(message.sequence, message.clone());
        Some(InMemoryMessage {
            shared: Arc::clone(&self.shared),
            message,
        })
    }
}

#[async_trait]
impl MessageSubscription for InMemorySubscription {
    async fn next_message(&mut self) -> Option<Result<Box<dyn LogMessage>, LedgerError>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(message) = self.take() {
                return Some(Ok(Box::new(message)));
            }
            notified.await;
        }
    }
}

struct InMemoryMessage {
    shared: Arc<Shared>,
    message: Stored,
}

#[async_trait]
impl LogMessage for InMemoryMessage {
    fn subject(&self) -> &str {
        &self.message.subject
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn stream_sequence(&self) -> u64 {
        self.message.sequence
    }

    fn delivered(&self) -> i64 {
        self.message.delivered
    }

    async fn ack(&self) -> Result<(), LedgerError> {
        let mut state = self.shared.lock();
        if state.in_flight.remove(&self.message.sequence).is_some() {
            state.acked.push(self.message.sequence);
        }
        Ok(())
    }

    async fn nak(&self, _delay: Duration) -> Result<(), LedgerError> {
        {
            let mut state = self.shared.lock();
            if let Some(message) = state.in_flight.remove(&self.message.sequence) {
                state.naks += 1;
                state
                    .queues
                    .entry(message.subject.clone())
                    .or_default()
                    .push_back(message);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
