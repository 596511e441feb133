//! Versioned change consumer.
//!
//! One generic engine applies change records for any entity type that
//! implements [`SyncTarget`]. The version number is the only ordering
//! mechanism: an update at `v` is applied only against a local row at
//! `v - 1`, so an update whose predecessor has not arrived is refused and
//! left to transport redelivery. Other entities keep flowing meanwhile.
//!
//! | incoming | hook result                       | outcome          | ack   |
//! |----------|-----------------------------------|------------------|-------|
//! | v == 0   | created                           | Created          | ack   |
//! | v == 0   | unique violation                  | DuplicateApply   | ack   |
//! | v > 0    | updated at v-1                    | Updated          | ack   |
//! | v > 0    | miss, row found at v              | DuplicateApply   | ack   |
//! | v > 0    | miss, local version > v           | StaleApply       | ack   |
//! | v > 0    | miss, local version < v-1         | OutOfOrderApply  | retry |
//! | v > 0    | miss, no local row at all         | NotFound         | retry |
//! | any      | other failure                     | Failed           | retry |

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::ApplyError;
use crate::transport::{Ack, Batch, Disposition};
use crate::types::{ChangeMessage, EntityKey, Versioned};

/// Capability hooks a concrete entity type supplies to the consumer.
///
/// Implementations that cascade (e.g. a user replica that soft-deletes the
/// user's links) must do so inside the transaction of `update_entity`, and
/// append the dependents' change records to their own outbox in that same
/// transaction.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    type Change: DeserializeOwned + Versioned + Send + Sync;
    type Row: Send;

    /// Entity name for logs.
    fn entity(&self) -> &'static str;

    /// Insert the replica at version 0. A duplicate id must surface as
    /// [`ApplyError::UniqueViolation`].
    async fn create_entity(&self, data: &Self::Change) -> Result<Self::Row, ApplyError>;

    /// Compare-and-swap: apply `data` only if the local row is exactly at
    /// `expected`. A miss must surface as [`ApplyError::NotFound`].
    async fn update_entity(
        &self,
        expected: &EntityKey,
        data: &Self::Change,
    ) -> Result<Self::Row, ApplyError>;

    /// The local row at exactly `key`, if any.
    async fn find_entity(&self, key: &EntityKey) -> Result<Option<Self::Row>, ApplyError>;

    /// The local row's current version, if the row exists.
    ///
    /// Only consulted after a CAS miss and an exact-version miss, to tell a
    /// stale delivery apart from a missing predecessor. The default reports
    /// nothing, which makes every such miss a retry.
    async fn current_version(&self, _id: &str) -> Result<Option<i64>, ApplyError> {
        Ok(None)
    }
}

/// Result of applying one change.
#[derive(Debug)]
pub enum ApplyOutcome<R> {
    Created(R),
    Updated(R),
    /// Already applied; nothing written.
    DuplicateApply,
    /// Local row is already past this version; nothing written.
    StaleApply { local_v: i64 },
    /// The predecessor version has not been applied yet.
    OutOfOrderApply { local_v: i64 },
    /// No local row at all; the create has not arrived yet.
    NotFound,
    Failed(ApplyError),
}

impl<R> ApplyOutcome<R> {
    pub fn ack(&self) -> Ack {
        match self {
            ApplyOutcome::Created(_)
            | ApplyOutcome::Updated(_)
            | ApplyOutcome::DuplicateApply
            | ApplyOutcome::StaleApply { .. } => Ack::Ack,
            ApplyOutcome::OutOfOrderApply { .. }
            | ApplyOutcome::NotFound
            | ApplyOutcome::Failed(_) => Ack::Retry,
        }
    }

    /// The change is reflected locally (applied now or earlier).
    pub fn is_in_place(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Created(_) | ApplyOutcome::Updated(_) | ApplyOutcome::DuplicateApply
        )
    }

    pub fn row(&self) -> Option<&R> {
        match self {
            ApplyOutcome::Created(row) | ApplyOutcome::Updated(row) => Some(row),
            _ => None,
        }
    }
}

/// Result of one sync pass over a batch.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub dispositions: Vec<Disposition>,
    /// Ids of entities whose change is in place after this pass, in batch
    /// order, without repeats. Feeds cache invalidation upstream.
    pub replicated: Vec<String>,
}

impl SyncReport {
    pub fn acked(&self) -> usize {
        self.dispositions.iter().filter(|d| d.is_ack()).count()
    }

    pub fn retried(&self) -> usize {
        self.dispositions.len() - self.acked()
    }
}

/// Generic consumer over one entity type.
pub struct ChangeConsumer<T: SyncTarget> {
    target: T,
}

impl<T: SyncTarget> ChangeConsumer<T> {
    pub fn new(target: T) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Apply one decoded change. A soft delete is an update carrying
    /// `deletedAt`; there is no separate delete path.
    ///
    /// A negative version is malformed and fails without touching the store.
    pub async fn apply(&self, change: &T::Change) -> ApplyOutcome<T::Row> {
        match change.v() {
            0 => self.create(change).await,
            v if v > 0 => self.update(change).await,
            v => ApplyOutcome::Failed(ApplyError::InvalidVersion(v)),
        }
    }

    async fn create(&self, change: &T::Change) -> ApplyOutcome<T::Row> {
        match self.target.create_entity(change).await {
            Ok(row) => ApplyOutcome::Created(row),
            Err(ApplyError::UniqueViolation) => ApplyOutcome::DuplicateApply,
            Err(e) => ApplyOutcome::Failed(e),
        }
    }

    async fn update(&self, change: &T::Change) -> ApplyOutcome<T::Row> {
        let Some(previous) = change.v().checked_sub(1) else {
            return ApplyOutcome::Failed(ApplyError::InvalidVersion(change.v()));
        };
        let expected = EntityKey::new(change.id(), previous);

        match self.target.update_entity(&expected, change).await {
            Ok(row) => ApplyOutcome::Updated(row),
            Err(ApplyError::NotFound) => self.resolve_miss(change).await,
            Err(e) => ApplyOutcome::Failed(e),
        }
    }

    /// The CAS missed. Decide between duplicate, stale, out-of-order and
    /// absent.
    async fn resolve_miss(&self, change: &T::Change) -> ApplyOutcome<T::Row> {
        match self.target.find_entity(&change.key()).await {
            Ok(Some(_)) => return ApplyOutcome::DuplicateApply,
            Ok(None) => {}
            Err(e) => return ApplyOutcome::Failed(e),
        }

        match self.target.current_version(change.id()).await {
            Ok(Some(local_v)) if local_v > change.v() => ApplyOutcome::StaleApply { local_v },
            // Equal would have been found above; a concurrent apply may have
            // landed in between, which is a duplicate as well.
            Ok(Some(local_v)) if local_v == change.v() => ApplyOutcome::DuplicateApply,
            Ok(Some(local_v)) => ApplyOutcome::OutOfOrderApply { local_v },
            Ok(None) => ApplyOutcome::NotFound,
            Err(e) => ApplyOutcome::Failed(e),
        }
    }

    /// Apply every message of a batch, sequentially and independently.
    ///
    /// Each message gets its own ack/retry decision; one failure never
    /// affects another message. Undecodable payloads are retried so they
    /// eventually reach the dead-letter queue.
    pub async fn sync(&self, batch: &Batch<ChangeMessage>) -> SyncReport {
        let mut report = SyncReport::default();

        for message in &batch.messages {
            let change = match serde_json::from_value::<T::Change>(message.body.data.clone()) {
                Ok(change) => change,
                Err(e) => {
                    warn!(
                        queue = batch.queue.as_str(),
                        record_id = message.body.id,
                        entity = self.target.entity(),
                        error = %e,
                        "Malformed change payload"
                    );
                    report.dispositions.push(Disposition::retry(&message.id));
                    continue;
                }
            };

            let outcome = self.apply(&change).await;
            self.log_outcome(&batch.queue, &change, &outcome);

            if outcome.is_in_place() && !report.replicated.iter().any(|id| id == change.id()) {
                report.replicated.push(change.id().to_string());
            }
            report.dispositions.push(Disposition {
                message_id: message.id.clone(),
                ack: outcome.ack(),
            });
        }

        info!(
            queue = batch.queue.as_str(),
            entity = self.target.entity(),
            acked = report.acked(),
            retried = report.retried(),
            "Sync pass complete"
        );
        report
    }

    fn log_outcome(&self, queue: &str, change: &T::Change, outcome: &ApplyOutcome<T::Row>) {
        let entity = self.target.entity();
        let id = change.id();
        let v = change.v();
        match outcome {
            ApplyOutcome::Created(_) | ApplyOutcome::Updated(_) => {
                debug!(queue, entity, id, v, "Applied change");
            }
            ApplyOutcome::DuplicateApply => {
                debug!(queue, entity, id, v, "Duplicate delivery, already applied");
            }
            ApplyOutcome::StaleApply { local_v } => {
                info!(queue, entity, id, v, local_v, "Stale change, local row is ahead");
            }
            ApplyOutcome::OutOfOrderApply { local_v } => {
                info!(queue, entity, id, v, local_v, "Predecessor missing, retrying");
            }
            ApplyOutcome::NotFound => {
                info!(queue, entity, id, v, "Entity not replicated yet, retrying");
            }
            ApplyOutcome::Failed(e) => {
                warn!(queue, entity, id, v, error = %e, "Apply failed, retrying");
            }
        }
    }
}
