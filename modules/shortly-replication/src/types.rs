//! Core replication types. Entity-agnostic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A pending change as stored in a service's outbox table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChangeRecord {
    pub id: i64,
    pub topic: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    /// The body published on the transport for this record.
    pub fn to_message(&self) -> ChangeMessage {
        ChangeMessage {
            id: self.id,
            topic: self.topic.clone(),
            data: self.payload.clone(),
        }
    }
}

/// Wire envelope for a change record.
///
/// `id` is the origin outbox row. It travels with the message so that a
/// dead-lettered delivery can be correlated back to the row that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub id: i64,
    pub topic: String,
    pub data: serde_json::Value,
}

/// Optimistic-concurrency key: an entity id at one exact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub id: String,
    pub v: i64,
}

impl EntityKey {
    pub fn new(id: impl Into<String>, v: i64) -> Self {
        Self { id: id.into(), v }
    }
}

/// A decoded change payload. Every payload carries at least `id` and `v`.
pub trait Versioned {
    fn id(&self) -> &str;
    fn v(&self) -> i64;

    fn key(&self) -> EntityKey {
        EntityKey::new(self.id(), self.v())
    }
}

/// One dereference of a link. No identity beyond `(entity_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupFact {
    #[serde(alias = "linkId")]
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Rollup kept per entity by the lookup aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub entity_id: String,
    pub count: i64,
    pub last_fact_at: Option<DateTime<Utc>>,
    /// Soft-delete marker of the rolled-up entity, so fan-out can skip it.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Output of one committed aggregator group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateUpdate {
    pub aggregate: Aggregate,
    /// Up to five of the newest net-new timestamps, oldest first.
    pub recent_timestamps: Vec<DateTime<Utc>>,
}

/// Deserialize a field that distinguishes "absent" from "null".
///
/// Use with `#[serde(default, deserialize_with = "double_option")]`:
/// absent → `None`, `null` → `Some(None)`, value → `Some(Some(v))`.
pub fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
