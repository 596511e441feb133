//! Postgres-backed sync targets and lookup store.

pub mod links;
pub mod lookups;
pub mod users;

pub use links::PgLinkReplica;
pub use lookups::PgLookupStore;
pub use users::PgUserReplica;

use sqlx::PgPool;

/// Apply the embedded migrations. Idempotent.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
