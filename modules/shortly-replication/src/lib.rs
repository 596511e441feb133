//! Asynchronous replication between Shortly services.
//!
//! A mutation and its change records commit together in the origin's
//! outbox; the dispatcher publishes them at least once; remote services
//! apply them through a versioned, idempotent consumer. Lookup facts
//! travel on a separate, unversioned stream into a deduplicating
//! aggregator. Exhausted deliveries end at the dead-letter handler.
//!
//! Nothing here blocks across services. Convergence comes from retries,
//! idempotent application and version-ordered admission.

pub mod aggregator;
pub mod consumer;
pub mod dead_letter;
pub mod dispatcher;
pub mod entities;
pub mod error;
pub mod memory;
pub mod notify;
pub mod outbox;
pub mod postgres;
pub mod topics;
pub mod transport;
pub mod types;

pub use aggregator::{AggregationReport, LookupAggregator, LookupStore, Recorded};
pub use consumer::{ApplyOutcome, ChangeConsumer, SyncReport, SyncTarget};
pub use dead_letter::DeadLetterHandler;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use entities::{LinkChange, LinkRow, UserChange, UserRow};
pub use error::{ApplyError, PublishError};
pub use notify::{LookupNotifier, NoopNotifier, TopicNotifier};
pub use outbox::{OutboxStore, OutboxTable, PgOutbox};
pub use topics::{Route, Service};
pub use transport::{Ack, Batch, Disposition, Message, Publisher};
pub use types::{
    Aggregate, AggregateUpdate, ChangeMessage, ChangeRecord, EntityKey, LookupFact, Versioned,
};
