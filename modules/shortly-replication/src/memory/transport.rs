use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::PublishError;
use crate::transport::{Ack, Batch, Disposition, Message, Publisher};

#[derive(Default)]
struct TransportState {
    /// Every successful publish, in order.
    log: Vec<(String, serde_json::Value)>,
    /// Messages waiting to be delivered, per topic.
    pending: BTreeMap<String, VecDeque<Message<serde_json::Value>>>,
    /// Delivered but not yet settled, by message id.
    in_flight: BTreeMap<String, (String, Message<serde_json::Value>)>,
    failing: HashSet<String>,
}

/// In-memory at-least-once transport for tests.
///
/// Published bodies queue up per topic. [`deliver`](Self::deliver) hands
/// them out as a batch; [`settle`](Self::settle) drops acked messages and
/// puts retried ones back at the end of their topic's queue with the
/// attempt count bumped.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<TransportState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every publish to `topic` fail until [`heal_topic`](Self::heal_topic).
    pub fn fail_topic(&self, topic: &str) {
        self.state().failing.insert(topic.to_string());
    }

    pub fn heal_topic(&self, topic: &str) {
        self.state().failing.remove(topic);
    }

    /// All bodies ever published to `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<serde_json::Value> {
        self.state()
            .log
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn publish_count(&self) -> usize {
        self.state().log.len()
    }

    /// Hand out up to `max` pending messages of `topic` as one batch.
    pub fn deliver(&self, topic: &str, max: usize) -> Batch<serde_json::Value> {
        let mut state = self.state();
        let mut messages = Vec::new();
        if let Some(queue) = state.pending.get_mut(topic) {
            while messages.len() < max {
                match queue.pop_front() {
                    Some(message) => messages.push(message),
                    None => break,
                }
            }
        }
        for message in &messages {
            state
                .in_flight
                .insert(message.id.clone(), (topic.to_string(), message.clone()));
        }
        Batch::new(topic, messages)
    }

    /// Apply handler dispositions to in-flight messages.
    pub fn settle(&self, dispositions: &[Disposition]) {
        let mut state = self.state();
        for d in dispositions {
            let Some((topic, mut message)) = state.in_flight.remove(&d.message_id) else {
                continue;
            };
            if d.ack == Ack::Retry {
                message.attempts += 1;
                state.pending.entry(topic).or_default().push_back(message);
            }
        }
    }

    pub fn pending(&self, topic: &str) -> usize {
        self.state().pending.get(topic).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl Publisher for MemoryTransport {
    async fn publish(&self, topic: &str, body: &serde_json::Value) -> Result<(), PublishError> {
        let mut state = self.state();
        if state.failing.contains(topic) {
            return Err(PublishError::Unavailable(format!("{topic} is failing")));
        }

        state.log.push((topic.to_string(), body.clone()));
        state
            .pending
            .entry(topic.to_string())
            .or_default()
            .push_back(Message {
                id: Uuid::new_v4().to_string(),
                body: body.clone(),
                attempts: 1,
                timestamp: Utc::now(),
            });
        Ok(())
    }
}
