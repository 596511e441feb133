//! Lookup aggregation: dedup, per-entity atomicity, ack after commit.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shortly_replication::memory::{MemoryLookups, MemoryStore};
use shortly_replication::topics::LOOKUPS_ANALYTICS;
use shortly_replication::{
    Ack, Batch, LinkRow, LookupAggregator, LookupFact, LookupStore, Message, Recorded,
};

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_740_000_000 + secs, 0).unwrap()
}

fn seed_link(store: &MemoryStore, id: &str) {
    store.insert_link(LinkRow {
        id: id.into(),
        v: 0,
        short: Some(id.to_lowercase()),
        long: None,
        user_id: None,
        expires_at: None,
        created_at: t(0),
        deleted_at: None,
        lookup_count: 0,
        last_lookup_at: None,
    });
}

fn facts(items: &[(&str, DateTime<Utc>)]) -> Batch<LookupFact> {
    let messages = items
        .iter()
        .enumerate()
        .map(|(i, (entity, ts))| Message {
            id: format!("m{i}"),
            body: LookupFact {
                entity_id: entity.to_string(),
                timestamp: *ts,
            },
            attempts: 1,
            timestamp: *ts,
        })
        .collect();
    Batch::new(LOOKUPS_ANALYTICS, messages)
}

fn ack_of(report: &shortly_replication::AggregationReport, id: &str) -> Ack {
    report
        .dispositions
        .iter()
        .find(|d| d.message_id == id)
        .map(|d| d.ack)
        .unwrap()
}

#[tokio::test]
async fn duplicate_facts_in_one_batch_count_once() {
    let store = MemoryStore::new();
    seed_link(&store, "L1");
    let aggregator = LookupAggregator::new(store.lookups());

    let report = aggregator
        .process(&facts(&[("L1", t(1)), ("L1", t(1)), ("L1", t(2))]))
        .await;

    assert_eq!(report.dispositions.len(), 3);
    assert!(report.dispositions.iter().all(|d| d.is_ack()));
    assert_eq!(store.lookup_rows("L1"), 2);

    let link = store.link("L1").unwrap();
    assert_eq!(link.lookup_count, 2);
    assert_eq!(link.last_lookup_at, Some(t(2)));

    assert_eq!(report.updates.len(), 1);
    let update = &report.updates[0];
    assert_eq!(update.aggregate.count, 2);
    assert_eq!(update.recent_timestamps, vec![t(1), t(2)]);
}

#[tokio::test]
async fn redelivered_facts_are_not_counted_again() {
    let store = MemoryStore::new();
    seed_link(&store, "L1");
    let aggregator = LookupAggregator::new(store.lookups());

    aggregator.process(&facts(&[("L1", t(1))])).await;
    let report = aggregator.process(&facts(&[("L1", t(1))])).await;

    assert!(report.dispositions.iter().all(|d| d.is_ack()));
    assert!(report.updates.is_empty());
    assert_eq!(store.link("L1").unwrap().lookup_count, 1);
    assert_eq!(store.lookup_rows("L1"), 1);
}

#[tokio::test]
async fn failed_group_writes_nothing_and_is_retried() {
    let store = MemoryStore::new();
    seed_link(&store, "L1");
    let aggregator = LookupAggregator::new(store.lookups());
    store.fail_writes("L1");

    let batch = facts(&[("L1", t(1)), ("L1", t(2))]);
    let report = aggregator.process(&batch).await;

    assert!(report.dispositions.iter().all(|d| !d.is_ack()));
    assert!(report.updates.is_empty());
    assert_eq!(store.lookup_rows("L1"), 0);
    assert_eq!(store.link("L1").unwrap().lookup_count, 0);

    store.heal_writes("L1");
    let report = aggregator.process(&batch).await;
    assert!(report.dispositions.iter().all(|d| d.is_ack()));
    assert_eq!(store.link("L1").unwrap().lookup_count, 2);
}

#[tokio::test]
async fn one_failing_entity_does_not_hold_back_others() {
    let store = MemoryStore::new();
    seed_link(&store, "L1");
    seed_link(&store, "L2");
    store.fail_writes("L1");
    let aggregator = LookupAggregator::new(store.lookups());

    let report = aggregator
        .process(&facts(&[("L1", t(1)), ("L2", t(1)), ("L1", t(2))]))
        .await;

    assert_eq!(ack_of(&report, "m0"), Ack::Retry);
    assert_eq!(ack_of(&report, "m1"), Ack::Ack);
    assert_eq!(ack_of(&report, "m2"), Ack::Retry);
    assert_eq!(store.link("L2").unwrap().lookup_count, 1);
    assert_eq!(report.updates.len(), 1);
    assert_eq!(report.updates[0].aggregate.entity_id, "L2");
}

#[tokio::test]
async fn facts_for_unreplicated_link_are_retried() {
    let store = MemoryStore::new();
    let aggregator = LookupAggregator::new(store.lookups());

    let report = aggregator.process(&facts(&[("L404", t(1))])).await;
    assert_eq!(ack_of(&report, "m0"), Ack::Retry);
    assert_eq!(store.lookup_rows("L404"), 0);
}

#[tokio::test]
async fn update_carries_the_five_newest_timestamps_in_order() {
    let store = MemoryStore::new();
    seed_link(&store, "L1");
    let aggregator = LookupAggregator::new(store.lookups());

    // Delivered out of order on purpose
    let items: Vec<(&str, DateTime<Utc>)> = [7, 2, 5, 0, 6, 1, 4, 3].iter().map(|s| ("L1", t(*s))).collect();
    let report = aggregator.process(&facts(&items)).await;

    let update = &report.updates[0];
    assert_eq!(update.aggregate.count, 8);
    assert_eq!(update.recent_timestamps, (3..8).map(t).collect::<Vec<_>>());
    assert_eq!(update.aggregate.last_fact_at, Some(t(7)));
}

#[tokio::test]
async fn late_fact_does_not_move_last_lookup_back() {
    let store = MemoryStore::new();
    seed_link(&store, "L1");
    let aggregator = LookupAggregator::new(store.lookups());

    aggregator.process(&facts(&[("L1", t(50))])).await;
    let report = aggregator.process(&facts(&[("L1", t(10))])).await;

    let aggregate = &report.updates[0].aggregate;
    assert_eq!(aggregate.count, 2);
    assert_eq!(aggregate.last_fact_at, Some(t(50)));
}

#[tokio::test]
async fn aggregate_reports_soft_deleted_links() {
    let store = MemoryStore::new();
    seed_link(&store, "L1");
    let mut link = store.link("L1").unwrap();
    link.deleted_at = Some(t(5));
    store.insert_link(link);

    let aggregator = LookupAggregator::new(store.lookups());
    let report = aggregator.process(&facts(&[("L1", t(1))])).await;

    assert_eq!(report.updates[0].aggregate.deleted_at, Some(t(5)));
}

/// Reports nothing as recorded, as if another pass inserted the same facts
/// between the dedup check and the insert.
struct RacedLookups(MemoryLookups);

#[async_trait]
impl LookupStore for RacedLookups {
    async fn recorded(
        &self,
        _entity_id: &str,
        _timestamps: &[DateTime<Utc>],
    ) -> anyhow::Result<Vec<DateTime<Utc>>> {
        Ok(Vec::new())
    }

    async fn record(
        &self,
        entity_id: &str,
        new_facts: &[DateTime<Utc>],
    ) -> anyhow::Result<Recorded> {
        self.0.record(entity_id, new_facts).await
    }
}

#[tokio::test]
async fn facts_inserted_by_a_concurrent_pass_produce_no_update() {
    let store = MemoryStore::new();
    seed_link(&store, "L1");
    let aggregator = LookupAggregator::new(RacedLookups(store.lookups()));

    let report = aggregator.process(&facts(&[("L1", t(1))])).await;
    assert_eq!(report.updates.len(), 1);

    let report = aggregator.process(&facts(&[("L1", t(1))])).await;
    assert!(report.dispositions.iter().all(|d| d.is_ack()));
    assert!(report.updates.is_empty());
    assert_eq!(store.link("L1").unwrap().lookup_count, 1);

    // Only the facts this pass inserted are announced.
    let report = aggregator.process(&facts(&[("L1", t(1)), ("L1", t(2))])).await;
    assert_eq!(report.updates[0].recent_timestamps, vec![t(2)]);
    assert_eq!(report.updates[0].aggregate.count, 2);
}
