//! Queue-client adapter for the replication transport boundary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use queue_client::{PulledMessage, QueueClient, QueueError};
use shortly_replication::transport::partition;
use shortly_replication::{Batch, Disposition, Message, PublishError, Publisher};

#[derive(Clone)]
pub struct QueueTransport {
    client: Arc<QueueClient>,
    retry_delay: Duration,
}

impl QueueTransport {
    pub fn new(client: QueueClient, retry_delay: Duration) -> Self {
        Self {
            client: Arc::new(client),
            retry_delay,
        }
    }

    pub async fn pull(
        &self,
        queue: &str,
        batch_size: usize,
        visibility: Duration,
    ) -> Result<Batch<serde_json::Value>, QueueError> {
        let pulled = self.client.pull(queue, batch_size, visibility).await?;
        Ok(to_batch(queue, pulled))
    }

    pub async fn settle(&self, queue: &str, dispositions: &[Disposition]) -> Result<(), QueueError> {
        let (acks, retries) = partition(dispositions);
        self.client
            .settle(queue, &acks, &retries, self.retry_delay)
            .await
    }
}

#[async_trait]
impl Publisher for QueueTransport {
    async fn publish(&self, topic: &str, body: &serde_json::Value) -> Result<(), PublishError> {
        self.client
            .publish(topic, body)
            .await
            .map_err(|e| match e {
                QueueError::Api { status, message } if status < 500 => PublishError::Rejected {
                    topic: topic.to_string(),
                    message: format!("status {status}: {message}"),
                },
                other => PublishError::Unavailable(other.to_string()),
            })
    }
}

/// Pulled messages keyed by lease id, since the lease is what gets settled.
fn to_batch(queue: &str, pulled: Vec<PulledMessage>) -> Batch<serde_json::Value> {
    let messages = pulled
        .into_iter()
        .map(|m| Message {
            body: m.json_body(),
            timestamp: Utc
                .timestamp_millis_opt(m.timestamp_ms)
                .single()
                .unwrap_or_else(Utc::now),
            attempts: m.attempts,
            id: m.lease_id,
        })
        .collect();
    Batch::new(queue, messages)
}
