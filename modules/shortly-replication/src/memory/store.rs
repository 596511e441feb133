use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::{LookupStore, Recorded};
use crate::consumer::SyncTarget;
use crate::entities::{LinkChange, LinkRow, UserChange, UserRow};
use crate::error::ApplyError;
use crate::outbox::{OutboxStore, OutboxTable};
use crate::topics::LINK_UPDATE_TOPICS;
use crate::types::{Aggregate, ChangeRecord, EntityKey};

#[derive(Default)]
struct MemoryState {
    users: BTreeMap<String, UserRow>,
    links: BTreeMap<String, LinkRow>,
    outboxes: BTreeMap<&'static str, Vec<ChangeRecord>>,
    lookups: BTreeSet<(String, DateTime<Utc>)>,
    next_record_id: i64,
    /// Entity ids (or outbox table names) whose writes fail.
    failing: HashSet<String>,
}

impl MemoryState {
    fn check_writable(&self, key: &str) -> Result<()> {
        if self.failing.contains(key) {
            return Err(anyhow!("simulated write failure for {key}"));
        }
        Ok(())
    }

    fn append(&mut self, table: OutboxTable, topic: &str, payload: serde_json::Value) -> i64 {
        self.next_record_id += 1;
        let id = self.next_record_id;
        self.outboxes.entry(table.name()).or_default().push(ChangeRecord {
            id,
            topic: topic.to_string(),
            payload,
            created_at: Utc::now(),
            sent_at: None,
            failed_at: None,
        });
        id
    }
}

/// In-memory stand-in for one service's database.
///
/// Every operation takes the single state lock for its whole duration, so
/// each call is atomic the way a database transaction would be. Cheap to
/// clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn users(&self) -> MemoryUsers {
        MemoryUsers {
            store: self.clone(),
            cascade: None,
        }
    }

    pub fn links(&self) -> MemoryLinks {
        MemoryLinks {
            store: self.clone(),
        }
    }

    pub fn outbox(&self, table: OutboxTable) -> MemoryOutbox {
        MemoryOutbox {
            store: self.clone(),
            table,
        }
    }

    pub fn lookups(&self) -> MemoryLookups {
        MemoryLookups {
            store: self.clone(),
        }
    }

    /// Make writes touching `key` (an entity id or outbox table name) fail.
    pub fn fail_writes(&self, key: &str) {
        self.state().failing.insert(key.to_string());
    }

    pub fn heal_writes(&self, key: &str) {
        self.state().failing.remove(key);
    }

    pub fn user(&self, id: &str) -> Option<UserRow> {
        self.state().users.get(id).cloned()
    }

    pub fn link(&self, id: &str) -> Option<LinkRow> {
        self.state().links.get(id).cloned()
    }

    /// Seed a link row directly, as the origin service would own it.
    pub fn insert_link(&self, link: LinkRow) {
        self.state().links.insert(link.id.clone(), link);
    }

    pub fn records(&self, table: OutboxTable) -> Vec<ChangeRecord> {
        self.state()
            .outboxes
            .get(table.name())
            .cloned()
            .unwrap_or_default()
    }

    pub fn lookup_rows(&self, entity_id: &str) -> usize {
        self.state()
            .lookups
            .iter()
            .filter(|(id, _)| id == entity_id)
            .count()
    }

    /// Origin-side append: one record per topic, as a mutation would write.
    pub fn append_change<T: Serialize + ?Sized>(
        &self,
        table: OutboxTable,
        topics: &[&str],
        payload: &T,
    ) -> Result<Vec<i64>> {
        let payload = serde_json::to_value(payload)?;
        let mut state = self.state();
        state.check_writable(table.name())?;
        Ok(topics
            .iter()
            .map(|topic| state.append(table, topic, payload.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Sync targets
// ---------------------------------------------------------------------------

pub struct MemoryUsers {
    store: MemoryStore,
    cascade: Option<OutboxTable>,
}

impl MemoryUsers {
    pub fn cascade_links(mut self, outbox: OutboxTable) -> Self {
        self.cascade = Some(outbox);
        self
    }
}

#[async_trait]
impl SyncTarget for MemoryUsers {
    type Change = UserChange;
    type Row = UserRow;

    fn entity(&self) -> &'static str {
        "user"
    }

    async fn create_entity(&self, data: &UserChange) -> Result<UserRow, ApplyError> {
        let mut state = self.store.state();
        state.check_writable(&data.id)?;
        if state.users.contains_key(&data.id) {
            return Err(ApplyError::UniqueViolation);
        }
        let row = UserRow::from_change(data);
        state.users.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn update_entity(
        &self,
        expected: &EntityKey,
        data: &UserChange,
    ) -> Result<UserRow, ApplyError> {
        let mut state = self.store.state();
        state.check_writable(&expected.id)?;

        let mut user = state
            .users
            .get(&expected.id)
            .filter(|u| u.v == expected.v)
            .cloned()
            .ok_or(ApplyError::NotFound)?;
        user.patch(data);

        // Stage the cascade completely before touching state.
        let mut cascaded = Vec::new();
        if let (Some(outbox), Some(deleted_at)) = (self.cascade, user.deleted_at) {
            state.check_writable(outbox.name())?;
            for link in state.links.values() {
                if link.user_id.as_deref() == Some(user.id.as_str()) && link.deleted_at.is_none()
                {
                    let mut link = link.clone();
                    link.deleted_at = Some(deleted_at);
                    link.v += 1;
                    let payload = serde_json::to_value(link.to_change())
                        .map_err(|e| ApplyError::Persistence(e.into()))?;
                    cascaded.push((outbox, link, payload));
                }
            }
        }

        for (outbox, link, payload) in cascaded {
            for topic in LINK_UPDATE_TOPICS {
                state.append(outbox, topic, payload.clone());
            }
            state.links.insert(link.id.clone(), link);
        }
        state.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn find_entity(&self, key: &EntityKey) -> Result<Option<UserRow>, ApplyError> {
        Ok(self
            .store
            .state()
            .users
            .get(&key.id)
            .filter(|u| u.v == key.v)
            .cloned())
    }

    async fn current_version(&self, id: &str) -> Result<Option<i64>, ApplyError> {
        Ok(self.store.state().users.get(id).map(|u| u.v))
    }
}

pub struct MemoryLinks {
    store: MemoryStore,
}

#[async_trait]
impl SyncTarget for MemoryLinks {
    type Change = LinkChange;
    type Row = LinkRow;

    fn entity(&self) -> &'static str {
        "link"
    }

    async fn create_entity(&self, data: &LinkChange) -> Result<LinkRow, ApplyError> {
        let mut state = self.store.state();
        state.check_writable(&data.id)?;
        if state.links.contains_key(&data.id) {
            return Err(ApplyError::UniqueViolation);
        }
        let row = LinkRow::from_change(data);
        state.links.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn update_entity(
        &self,
        expected: &EntityKey,
        data: &LinkChange,
    ) -> Result<LinkRow, ApplyError> {
        let mut state = self.store.state();
        state.check_writable(&expected.id)?;
        let link = state
            .links
            .get_mut(&expected.id)
            .filter(|l| l.v == expected.v)
            .ok_or(ApplyError::NotFound)?;
        link.patch(data);
        Ok(link.clone())
    }

    async fn find_entity(&self, key: &EntityKey) -> Result<Option<LinkRow>, ApplyError> {
        Ok(self
            .store
            .state()
            .links
            .get(&key.id)
            .filter(|l| l.v == key.v)
            .cloned())
    }

    async fn current_version(&self, id: &str) -> Result<Option<i64>, ApplyError> {
        Ok(self.store.state().links.get(id).map(|l| l.v))
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

pub struct MemoryOutbox {
    store: MemoryStore,
    table: OutboxTable,
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
    async fn unsent(&self, after: i64, limit: usize) -> Result<Vec<ChangeRecord>> {
        Ok(self
            .store
            .state()
            .outboxes
            .get(self.table.name())
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.sent_at.is_none() && r.id > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_sent(&self, ids: &[i64]) -> Result<u64> {
        let mut state = self.store.state();
        state.check_writable(self.table.name())?;
        let now = Utc::now();
        let mut marked = 0;
        for record in state.outboxes.entry(self.table.name()).or_default() {
            if ids.contains(&record.id) {
                record.sent_at = Some(now);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn mark_failed(&self, ids: &[i64]) -> Result<u64> {
        let mut state = self.store.state();
        state.check_writable(self.table.name())?;
        let now = Utc::now();
        let mut marked = 0;
        for record in state.outboxes.entry(self.table.name()).or_default() {
            if ids.contains(&record.id) {
                record.failed_at = Some(now);
                marked += 1;
            }
        }
        Ok(marked)
    }
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

pub struct MemoryLookups {
    store: MemoryStore,
}

#[async_trait]
impl LookupStore for MemoryLookups {
    async fn recorded(
        &self,
        entity_id: &str,
        timestamps: &[DateTime<Utc>],
    ) -> Result<Vec<DateTime<Utc>>> {
        let state = self.store.state();
        Ok(timestamps
            .iter()
            .filter(|ts| state.lookups.contains(&(entity_id.to_string(), **ts)))
            .copied()
            .collect())
    }

    async fn record(&self, entity_id: &str, new_facts: &[DateTime<Utc>]) -> Result<Recorded> {
        let mut state = self.store.state();
        state.check_writable(entity_id)?;
        if !state.links.contains_key(entity_id) {
            return Err(anyhow!("link {entity_id} not replicated yet"));
        }

        let mut inserted: Vec<DateTime<Utc>> = new_facts
            .iter()
            .filter(|ts| state.lookups.insert((entity_id.to_string(), **ts)))
            .copied()
            .collect();
        inserted.sort();

        let link = state
            .links
            .get_mut(entity_id)
            .ok_or_else(|| anyhow!("link {entity_id} not replicated yet"))?;
        link.lookup_count += inserted.len() as i64;
        link.last_lookup_at = link.last_lookup_at.max(inserted.last().copied());

        Ok(Recorded {
            aggregate: Aggregate {
                entity_id: link.id.clone(),
                count: link.lookup_count,
                last_fact_at: link.last_lookup_at,
                deleted_at: link.deleted_at,
            },
            inserted,
        })
    }
}
