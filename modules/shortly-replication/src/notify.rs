use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::transport::Publisher;
use crate::types::AggregateUpdate;

/// Downstream collaborator that fans aggregate updates out to live clients.
#[async_trait]
pub trait LookupNotifier: Send + Sync {
    async fn notify(&self, updates: &[AggregateUpdate]) -> anyhow::Result<()>;
}

/// Drops every update. Used when no live-analytics topic is configured.
pub struct NoopNotifier;

#[async_trait]
impl LookupNotifier for NoopNotifier {
    async fn notify(&self, _updates: &[AggregateUpdate]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Publishes each update of a live (not soft-deleted) entity on a topic.
///
/// Best effort: the lookups are already committed when this runs, so a
/// failed publish is logged and skipped rather than retried.
pub struct TopicNotifier<P: Publisher> {
    publisher: P,
    topic: String,
}

impl<P: Publisher> TopicNotifier<P> {
    pub fn new(publisher: P, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl<P: Publisher> LookupNotifier for TopicNotifier<P> {
    async fn notify(&self, updates: &[AggregateUpdate]) -> anyhow::Result<()> {
        for update in updates.iter().filter(|u| u.aggregate.deleted_at.is_none()) {
            let body = json!({
                "id": update.aggregate.entity_id,
                "count": update.aggregate.count,
                "lastLookupAt": update.aggregate.last_fact_at,
                "timestamps": update.recent_timestamps,
            });
            if let Err(e) = self.publisher.publish(&self.topic, &body).await {
                warn!(
                    topic = self.topic.as_str(),
                    entity_id = update.aggregate.entity_id.as_str(),
                    error = %e,
                    "Live analytics notification failed"
                );
            }
        }
        Ok(())
    }
}
