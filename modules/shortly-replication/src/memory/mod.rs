//! In-memory backends for tests. No database or queue required.

mod store;
mod transport;

pub use store::{MemoryLinks, MemoryLookups, MemoryOutbox, MemoryStore, MemoryUsers};
pub use transport::MemoryTransport;
