//! The dispatch pass: unsent outbox rows → transport → sent marks.
//!
//! Every pass is a full sweep of unsent rows. Origin services call
//! [`Dispatcher::dispatch`] right after committing a mutation, and
//! [`Dispatcher::run`] repeats the same sweep on an interval so anything a
//! crashed or failed pass left behind is picked up again.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::outbox::OutboxStore;
use crate::transport::Publisher;
use crate::types::ChangeRecord;

/// Counts from one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub selected: usize,
    pub published: usize,
    pub failed: usize,
    pub marked: u64,
}

impl std::fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "selected={} published={} failed={} marked={}",
            self.selected, self.published, self.failed, self.marked
        )
    }
}

pub struct Dispatcher<O, P>
where
    O: OutboxStore,
    P: Publisher,
{
    outbox: O,
    publisher: P,
    batch_limit: usize,
}

impl<O, P> Dispatcher<O, P>
where
    O: OutboxStore,
    P: Publisher,
{
    pub fn new(outbox: O, publisher: P) -> Self {
        Self {
            outbox,
            publisher,
            batch_limit: 100,
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// Publish every unsent record, then mark the published ones sent.
    ///
    /// The sweep reads the outbox in pages of `batch_limit`, keyed by id, and
    /// marks each page's published records with one bulk update. A record
    /// whose publish fails stays unsent for the next pass; the cursor moves
    /// past it so later records still go out. If the process dies between
    /// publish and mark, the record is published again later; receivers are
    /// idempotent.
    pub async fn dispatch(&self) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let mut cursor = 0;

        loop {
            let records = self.outbox.unsent(cursor, self.batch_limit).await?;
            let Some(last) = records.last() else {
                break;
            };
            cursor = last.id;
            report.selected += records.len();

            let published = self.publish_page(&records, &mut report).await;
            report.published += published.len();

            match self.outbox.mark_sent(&published).await {
                Ok(marked) => report.marked += marked,
                Err(e) => {
                    // The published records stay unsent and go out again next pass.
                    warn!(count = published.len(), error = %e, "Failed to mark records sent");
                }
            }

            if records.len() < self.batch_limit {
                break;
            }
        }

        Ok(report)
    }

    /// Returns the ids that were handed to the transport.
    async fn publish_page(
        &self,
        records: &[ChangeRecord],
        report: &mut DispatchReport,
    ) -> Vec<i64> {
        let mut published = Vec::with_capacity(records.len());
        for record in records {
            let body = match serde_json::to_value(record.to_message()) {
                Ok(body) => body,
                Err(e) => {
                    warn!(record_id = record.id, error = %e, "Unserializable change record");
                    report.failed += 1;
                    continue;
                }
            };

            match self.publisher.publish(&record.topic, &body).await {
                Ok(()) => {
                    debug!(record_id = record.id, topic = record.topic.as_str(), "Published");
                    published.push(record.id);
                }
                Err(e) => {
                    warn!(
                        record_id = record.id,
                        topic = record.topic.as_str(),
                        error = %e,
                        "Publish failed, will retry on next pass"
                    );
                    report.failed += 1;
                }
            }
        }
        published
    }

    /// Sweep on an interval until `shutdown` resolves.
    pub async fn run<F>(&self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Dispatcher stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match self.dispatch().await {
                        Ok(report) if report.selected > 0 => info!(%report, "Dispatch pass"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Dispatch pass failed"),
                    }
                }
            }
        }
    }
}
