//! Versioned consumer behaviour against the in-memory store.
//! No Postgres needed.

use chrono::Utc;
use serde_json::{json, Value};
use shortly_replication::memory::MemoryStore;
use shortly_replication::topics::USERS_LINKS;
use shortly_replication::{
    Ack, ApplyError, ApplyOutcome, Batch, ChangeConsumer, ChangeMessage, LinkChange, Message, UserChange,
};

fn user(payload: Value) -> UserChange {
    serde_json::from_value(payload).unwrap()
}

fn link(payload: Value) -> LinkChange {
    serde_json::from_value(payload).unwrap()
}

fn batch(payloads: Vec<Value>) -> Batch<ChangeMessage> {
    let messages = payloads
        .into_iter()
        .enumerate()
        .map(|(i, data)| Message {
            id: format!("m{i}"),
            body: ChangeMessage {
                id: i as i64 + 1,
                topic: USERS_LINKS.to_string(),
                data,
            },
            attempts: 1,
            timestamp: Utc::now(),
        })
        .collect();
    Batch::new(USERS_LINKS, messages)
}

fn acks(batch_report: &shortly_replication::SyncReport) -> Vec<Ack> {
    batch_report.dispositions.iter().map(|d| d.ack).collect()
}

// =========================================================================
// Create
// =========================================================================

#[tokio::test]
async fn create_then_redelivered_create_is_duplicate() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.users());
    let create = user(json!({ "id": "U1", "v": 0, "username": "ada" }));

    let first = consumer.apply(&create).await;
    assert!(matches!(first, ApplyOutcome::Created(_)));
    assert_eq!(first.ack(), Ack::Ack);

    let second = consumer.apply(&create).await;
    assert!(matches!(second, ApplyOutcome::DuplicateApply));
    assert_eq!(second.ack(), Ack::Ack);

    let row = store.user("U1").unwrap();
    assert_eq!(row.v, 0);
    assert_eq!(row.username.as_deref(), Some("ada"));
}

// =========================================================================
// Update
// =========================================================================

#[tokio::test]
async fn redelivered_update_is_duplicate() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.users());

    consumer.apply(&user(json!({ "id": "U1", "v": 0, "username": "ada" }))).await;
    let update = user(json!({ "id": "U1", "v": 1, "username": "lovelace" }));

    assert!(matches!(consumer.apply(&update).await, ApplyOutcome::Updated(_)));
    let again = consumer.apply(&update).await;
    assert!(matches!(again, ApplyOutcome::DuplicateApply));
    assert_eq!(again.ack(), Ack::Ack);

    let row = store.user("U1").unwrap();
    assert_eq!(row.v, 1);
    assert_eq!(row.username.as_deref(), Some("lovelace"));
}

#[tokio::test]
async fn out_of_order_updates_converge_after_retry() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.links());

    consumer
        .apply(&link(json!({ "id": "L1", "v": 0, "short": "abc", "long": "https://a.example" })))
        .await;

    let v1 = link(json!({ "id": "L1", "v": 1, "long": "https://b.example" }));
    let v2 = link(json!({ "id": "L1", "v": 2, "long": "https://c.example" }));

    // v2 arrives before v1
    let early = consumer.apply(&v2).await;
    assert!(matches!(early, ApplyOutcome::OutOfOrderApply { local_v: 0 }));
    assert_eq!(early.ack(), Ack::Retry);
    assert_eq!(store.link("L1").unwrap().v, 0);

    assert!(matches!(consumer.apply(&v1).await, ApplyOutcome::Updated(_)));
    // redelivery of v2
    assert!(matches!(consumer.apply(&v2).await, ApplyOutcome::Updated(_)));

    let row = store.link("L1").unwrap();
    assert_eq!(row.v, 2);
    assert_eq!(row.long.as_deref(), Some("https://c.example"));
    assert_eq!(row.short.as_deref(), Some("abc"));
}

#[tokio::test]
async fn stale_update_is_acked_without_applying() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.users());

    consumer.apply(&user(json!({ "id": "U1", "v": 0, "username": "a" }))).await;
    consumer.apply(&user(json!({ "id": "U1", "v": 1, "username": "b" }))).await;
    consumer.apply(&user(json!({ "id": "U1", "v": 2, "username": "c" }))).await;

    let stale = consumer
        .apply(&user(json!({ "id": "U1", "v": 1, "username": "b" })))
        .await;
    assert!(matches!(stale, ApplyOutcome::StaleApply { local_v: 2 }));
    assert_eq!(stale.ack(), Ack::Ack);

    let row = store.user("U1").unwrap();
    assert_eq!(row.v, 2);
    assert_eq!(row.username.as_deref(), Some("c"));
}

#[tokio::test]
async fn update_before_create_is_not_found_and_retried() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.users());

    let outcome = consumer
        .apply(&user(json!({ "id": "U9", "v": 1, "deletedAt": "2025-02-01T00:00:00Z" })))
        .await;
    assert!(matches!(outcome, ApplyOutcome::NotFound));
    assert_eq!(outcome.ack(), Ack::Retry);
    assert!(store.user("U9").is_none());
}

#[tokio::test]
async fn soft_delete_and_restore_are_plain_updates() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.users());

    consumer.apply(&user(json!({ "id": "U1", "v": 0, "username": "a" }))).await;
    consumer
        .apply(&user(json!({ "id": "U1", "v": 1, "deletedAt": "2025-02-01T00:00:00Z" })))
        .await;
    assert!(store.user("U1").unwrap().deleted_at.is_some());

    consumer
        .apply(&user(json!({ "id": "U1", "v": 2, "deletedAt": null })))
        .await;
    let row = store.user("U1").unwrap();
    assert_eq!(row.v, 2);
    assert!(row.deleted_at.is_none());
    assert_eq!(row.username.as_deref(), Some("a"));
}

#[tokio::test]
async fn write_failure_is_retried() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.users());
    store.fail_writes("U1");

    let outcome = consumer.apply(&user(json!({ "id": "U1", "v": 0 }))).await;
    assert!(matches!(outcome, ApplyOutcome::Failed(_)));
    assert_eq!(outcome.ack(), Ack::Retry);

    store.heal_writes("U1");
    let outcome = consumer.apply(&user(json!({ "id": "U1", "v": 0 }))).await;
    assert!(matches!(outcome, ApplyOutcome::Created(_)));
}

#[tokio::test]
async fn negative_version_is_retried_without_touching_the_store() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.users());
    consumer.apply(&user(json!({ "id": "U1", "v": 0, "username": "a" }))).await;

    for v in [-1, i64::MIN] {
        let outcome = consumer
            .apply(&user(json!({ "id": "U1", "v": v, "username": "x" })))
            .await;
        assert!(matches!(outcome, ApplyOutcome::Failed(ApplyError::InvalidVersion(bad)) if bad == v));
        assert_eq!(outcome.ack(), Ack::Retry);
    }

    let report = consumer
        .sync(&batch(vec![
            json!({ "id": "U2", "v": i64::MIN }),
            json!({ "id": "U3", "v": 0 }),
        ]))
        .await;
    assert_eq!(acks(&report), vec![Ack::Retry, Ack::Ack]);
    assert_eq!(report.replicated, vec!["U3"]);

    let row = store.user("U1").unwrap();
    assert_eq!(row.v, 0);
    assert_eq!(row.username.as_deref(), Some("a"));
    assert!(store.user("U2").is_none());
}

// =========================================================================
// Batches
// =========================================================================

#[tokio::test]
async fn each_message_in_a_batch_settles_independently() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.links());

    let report = consumer
        .sync(&batch(vec![
            json!({ "id": "L1", "v": 0, "short": "one" }),
            json!({ "id": "L2", "v": 1, "short": "two" }),
            json!({ "id": "L3", "v": 0, "short": "three" }),
        ]))
        .await;

    assert_eq!(acks(&report), vec![Ack::Ack, Ack::Retry, Ack::Ack]);
    assert_eq!(report.acked(), 2);
    assert_eq!(report.retried(), 1);
    assert!(store.link("L1").is_some());
    assert!(store.link("L2").is_none());
    assert!(store.link("L3").is_some());
}

#[tokio::test]
async fn malformed_payload_is_retried() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.users());

    let report = consumer
        .sync(&batch(vec![
            json!({ "v": "zero" }),
            json!({ "id": "U1", "v": 0 }),
        ]))
        .await;

    assert_eq!(acks(&report), vec![Ack::Retry, Ack::Ack]);
}

#[tokio::test]
async fn replicated_lists_entities_in_place_once_each() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.users());
    consumer.apply(&user(json!({ "id": "U2", "v": 0 }))).await;

    let report = consumer
        .sync(&batch(vec![
            json!({ "id": "U1", "v": 0 }),
            json!({ "id": "U2", "v": 0 }),
            json!({ "id": "U1", "v": 1, "username": "x" }),
            json!({ "id": "U3", "v": 4 }),
        ]))
        .await;

    // U2 was a duplicate (still in place), U3 was not found.
    assert_eq!(report.replicated, vec!["U1", "U2"]);
    assert_eq!(
        acks(&report),
        vec![Ack::Ack, Ack::Ack, Ack::Ack, Ack::Retry]
    );
}

#[tokio::test]
async fn redelivering_a_whole_batch_changes_nothing() {
    let store = MemoryStore::new();
    let consumer = ChangeConsumer::new(store.users());
    let delivery = batch(vec![
        json!({ "id": "U1", "v": 0, "username": "a" }),
        json!({ "id": "U1", "v": 1, "username": "b" }),
    ]);

    consumer.sync(&delivery).await;
    let snapshot = store.user("U1").unwrap();

    let report = consumer.sync(&delivery).await;
    assert_eq!(report.acked(), 2);
    assert_eq!(store.user("U1").unwrap(), snapshot);
}

#[tokio::test]
async fn delivery_order_2_1_3_converges_with_in_order_delivery() {
    let updates = [
        json!({ "id": "U1", "v": 1, "username": "b" }),
        json!({ "id": "U1", "v": 2, "deletedAt": "2025-02-01T00:00:00Z" }),
        json!({ "id": "U1", "v": 3, "username": "d" }),
    ];

    let in_order = MemoryStore::new();
    let consumer = ChangeConsumer::new(in_order.users());
    consumer.apply(&user(json!({ "id": "U1", "v": 0, "username": "a" }))).await;
    for u in &updates {
        consumer.apply(&user(u.clone())).await;
    }

    let shuffled = MemoryStore::new();
    let consumer = ChangeConsumer::new(shuffled.users());
    consumer.apply(&user(json!({ "id": "U1", "v": 0, "username": "a" }))).await;

    let report = consumer
        .sync(&batch(vec![updates[1].clone(), updates[0].clone(), updates[2].clone()]))
        .await;
    assert_eq!(acks(&report), vec![Ack::Retry, Ack::Ack, Ack::Retry]);

    // Redelivery of the retried messages, in the order the transport returns them
    let report = consumer
        .sync(&batch(vec![updates[1].clone(), updates[2].clone()]))
        .await;
    assert_eq!(acks(&report), vec![Ack::Ack, Ack::Ack]);

    let expected = in_order.user("U1").unwrap();
    let actual = shuffled.user("U1").unwrap();
    assert_eq!(actual.v, 3);
    assert_eq!(actual.username, expected.username);
    assert_eq!(actual.deleted_at, expected.deleted_at);
}
