//! Lookup aggregation: dereference facts → deduplicated rows → rollup.
//!
//! Facts carry no id and no version. The `(entity_id, timestamp)` pair is
//! the only identity, so duplicate suppression is a set difference against
//! what is already recorded. Each entity's group commits in its own
//! transaction, and the group's messages are acked only after that commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::transport::{Batch, Disposition, Message};
use crate::types::{Aggregate, AggregateUpdate, LookupFact};

/// How many new timestamps accompany each aggregate update.
pub const RECENT_TIMESTAMPS: usize = 5;

/// Storage for recorded facts and their rollup.
///
/// Implemented by `PgLookupStore` (postgres) and `MemoryLookups` (tests).
#[async_trait]
pub trait LookupStore: Send + Sync {
    /// Which of `timestamps` are already recorded for `entity_id`.
    async fn recorded(
        &self,
        entity_id: &str,
        timestamps: &[DateTime<Utc>],
    ) -> Result<Vec<DateTime<Utc>>>;

    /// Atomically insert `new_facts` for `entity_id`, add the count of rows
    /// actually inserted to the rollup and advance its last-fact timestamp.
    /// Either everything is written or nothing is.
    async fn record(&self, entity_id: &str, new_facts: &[DateTime<Utc>]) -> Result<Recorded>;
}

/// What one `record` call wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub aggregate: Aggregate,
    /// Facts this call inserted, ascending. Facts a concurrent writer got to
    /// first are absent.
    pub inserted: Vec<DateTime<Utc>>,
}

#[async_trait]
impl<S: LookupStore + ?Sized> LookupStore for Arc<S> {
    async fn recorded(
        &self,
        entity_id: &str,
        timestamps: &[DateTime<Utc>],
    ) -> Result<Vec<DateTime<Utc>>> {
        (**self).recorded(entity_id, timestamps).await
    }

    async fn record(&self, entity_id: &str, new_facts: &[DateTime<Utc>]) -> Result<Recorded> {
        (**self).record(entity_id, new_facts).await
    }
}

/// Result of one aggregation pass.
#[derive(Debug, Default)]
pub struct AggregationReport {
    pub dispositions: Vec<Disposition>,
    /// One entry per entity whose group committed new facts.
    pub updates: Vec<AggregateUpdate>,
}

pub struct LookupAggregator<S: LookupStore> {
    store: S,
}

impl<S: LookupStore> LookupAggregator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn process(&self, batch: &Batch<LookupFact>) -> AggregationReport {
        let mut report = AggregationReport::default();

        for (entity_id, messages) in group_by_entity(&batch.messages) {
            match self.process_group(entity_id, &messages).await {
                Ok(update) => {
                    // Commit is durable; only now may the group be acked.
                    report
                        .dispositions
                        .extend(messages.iter().map(|m| Disposition::ack(&m.id)));
                    report.updates.extend(update);
                }
                Err(e) => {
                    warn!(
                        queue = batch.queue.as_str(),
                        entity_id,
                        messages = messages.len(),
                        error = %e,
                        "Lookup group failed, retrying"
                    );
                    report
                        .dispositions
                        .extend(messages.iter().map(|m| Disposition::retry(&m.id)));
                }
            }
        }

        info!(
            queue = batch.queue.as_str(),
            messages = batch.len(),
            updated = report.updates.len(),
            "Lookup batch processed"
        );
        report
    }

    /// Returns `None` when every fact of the group was already recorded,
    /// including by a concurrent pass that won the insert.
    async fn process_group(
        &self,
        entity_id: &str,
        messages: &[&Message<LookupFact>],
    ) -> Result<Option<AggregateUpdate>> {
        let candidates: BTreeSet<DateTime<Utc>> =
            messages.iter().map(|m| m.body.timestamp).collect();
        let candidates: Vec<DateTime<Utc>> = candidates.into_iter().collect();

        let recorded: BTreeSet<DateTime<Utc>> = self
            .store
            .recorded(entity_id, &candidates)
            .await?
            .into_iter()
            .collect();

        let new_facts: Vec<DateTime<Utc>> = candidates
            .into_iter()
            .filter(|ts| !recorded.contains(ts))
            .collect();

        if new_facts.is_empty() {
            debug!(entity_id, "No new lookups in group");
            return Ok(None);
        }

        let Recorded {
            aggregate,
            inserted,
        } = self.store.record(entity_id, &new_facts).await?;
        if inserted.is_empty() {
            debug!(entity_id, "Lookups recorded concurrently, nothing new");
            return Ok(None);
        }
        debug!(
            entity_id,
            new = inserted.len(),
            count = aggregate.count,
            "Lookup group committed"
        );

        Ok(Some(AggregateUpdate {
            aggregate,
            recent_timestamps: most_recent(&inserted, RECENT_TIMESTAMPS),
        }))
    }
}

/// Group messages by entity, preserving the order within each group.
fn group_by_entity(messages: &[Message<LookupFact>]) -> BTreeMap<&str, Vec<&Message<LookupFact>>> {
    let mut groups: BTreeMap<&str, Vec<&Message<LookupFact>>> = BTreeMap::new();
    for message in messages {
        groups
            .entry(message.body.entity_id.as_str())
            .or_default()
            .push(message);
    }
    groups
}

/// The `n` newest of `sorted` (ascending), kept in ascending order.
fn most_recent(sorted: &[DateTime<Utc>], n: usize) -> Vec<DateTime<Utc>> {
    let start = sorted.len().saturating_sub(n);
    sorted[start..].to_vec()
}
