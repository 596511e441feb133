//! Transport boundary: batches in, dispositions out, publish for the outbox.
//!
//! The transport itself is opaque. It delivers each message at least once,
//! redelivers anything not acked, and dead-letters a message once its own
//! retry budget is spent. Handlers in this crate never talk to it directly;
//! they return one [`Disposition`] per delivered message.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::PublishError;

/// A single delivered message.
#[derive(Debug, Clone)]
pub struct Message<B> {
    /// Transport handle used to settle the message (a lease id, delivery tag, ...).
    pub id: String,
    pub body: B,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

/// A batch of messages delivered from one queue.
#[derive(Debug, Clone)]
pub struct Batch<B> {
    pub queue: String,
    pub messages: Vec<Message<B>>,
}

impl<B> Batch<B> {
    pub fn new(queue: impl Into<String>, messages: Vec<Message<B>>) -> Self {
        Self {
            queue: queue.into(),
            messages,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

impl Batch<serde_json::Value> {
    /// Decode every body into `T`.
    ///
    /// Returns the decodable messages as a typed batch alongside the raw
    /// messages that failed to decode, leaving the ack decision for those
    /// to the caller.
    pub fn decode<T: DeserializeOwned>(self) -> (Batch<T>, Vec<Message<serde_json::Value>>) {
        let mut decoded = Vec::with_capacity(self.messages.len());
        let mut rejected = Vec::new();

        for message in self.messages {
            match serde_json::from_value::<T>(message.body.clone()) {
                Ok(body) => decoded.push(Message {
                    id: message.id,
                    body,
                    attempts: message.attempts,
                    timestamp: message.timestamp,
                }),
                Err(e) => {
                    tracing::warn!(
                        queue = self.queue.as_str(),
                        message_id = message.id.as_str(),
                        error = %e,
                        "Undecodable message body"
                    );
                    rejected.push(message);
                }
            }
        }

        (Batch::new(self.queue, decoded), rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    Retry,
}

/// The settle decision for one delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disposition {
    pub message_id: String,
    pub ack: Ack,
}

impl Disposition {
    pub fn ack(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            ack: Ack::Ack,
        }
    }

    pub fn retry(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            ack: Ack::Retry,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.ack == Ack::Ack
    }
}

/// Split dispositions into (acked, retried) message ids.
pub fn partition(dispositions: &[Disposition]) -> (Vec<String>, Vec<String>) {
    let mut acks = Vec::new();
    let mut retries = Vec::new();
    for d in dispositions {
        match d.ack {
            Ack::Ack => acks.push(d.message_id.clone()),
            Ack::Retry => retries.push(d.message_id.clone()),
        }
    }
    (acks, retries)
}

/// Publishes a body on a topic. Implemented by the queue transport and by
/// `MemoryTransport` in tests.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, body: &serde_json::Value) -> Result<(), PublishError>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, topic: &str, body: &serde_json::Value) -> Result<(), PublishError> {
        (**self).publish(topic, body).await
    }
}
