//! Dead-letter sink for change messages.
//!
//! Reached only after the transport gave up on a message. Marks the origin
//! outbox rows `failed_at` for observability and acks. Never re-publishes.

use tracing::{info, warn};

use crate::outbox::OutboxStore;
use crate::transport::{Batch, Disposition};
use crate::types::ChangeMessage;

pub struct DeadLetterHandler<O: OutboxStore> {
    outbox: O,
}

impl<O: OutboxStore> DeadLetterHandler<O> {
    pub fn new(outbox: O) -> Self {
        Self { outbox }
    }

    /// Mark every origin record in the batch failed.
    ///
    /// The marking is one bulk write: on success every message is acked, on
    /// failure every message is retried.
    pub async fn handle(&self, batch: &Batch<ChangeMessage>) -> Vec<Disposition> {
        let mut ids: Vec<i64> = batch.messages.iter().map(|m| m.body.id).collect();
        ids.sort_unstable();
        ids.dedup();

        match self.outbox.mark_failed(&ids).await {
            Ok(marked) => {
                info!(
                    queue = batch.queue.as_str(),
                    records = ids.len(),
                    marked,
                    "Dead-lettered change records marked failed"
                );
                batch
                    .messages
                    .iter()
                    .map(|m| Disposition::ack(&m.id))
                    .collect()
            }
            Err(e) => {
                warn!(
                    queue = batch.queue.as_str(),
                    records = ids.len(),
                    error = %e,
                    "Failed to mark dead-lettered records"
                );
                batch
                    .messages
                    .iter()
                    .map(|m| Disposition::retry(&m.id))
                    .collect()
            }
        }
    }
}
