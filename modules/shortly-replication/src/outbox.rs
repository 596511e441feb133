//! Outbox store: a durable log of pending change records, backed by Postgres.
//!
//! Records are appended inside the transaction that mutates the entity they
//! describe. The dispatcher is the only writer of `sent_at`; the dead-letter
//! handler is the only writer of `failed_at`. Rows are never deleted.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;

use crate::types::ChangeRecord;

/// Reader/marker side of an outbox, shared by the dispatcher and the
/// dead-letter handler.
///
/// Implemented by `PgOutbox` (postgres) and `MemoryOutbox` (tests).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unsent records with an id above `after`, in append order, at most
    /// `limit`.
    async fn unsent(&self, after: i64, limit: usize) -> Result<Vec<ChangeRecord>>;

    /// Stamp `sent_at` on the given records. Returns the number of rows touched.
    async fn mark_sent(&self, ids: &[i64]) -> Result<u64>;

    /// Stamp `failed_at` on the given records. Returns the number of rows touched.
    async fn mark_failed(&self, ids: &[i64]) -> Result<u64>;
}

#[async_trait]
impl<O: OutboxStore + ?Sized> OutboxStore for Arc<O> {
    async fn unsent(&self, after: i64, limit: usize) -> Result<Vec<ChangeRecord>> {
        (**self).unsent(after, limit).await
    }

    async fn mark_sent(&self, ids: &[i64]) -> Result<u64> {
        (**self).mark_sent(ids).await
    }

    async fn mark_failed(&self, ids: &[i64]) -> Result<u64> {
        (**self).mark_failed(ids).await
    }
}

// ---------------------------------------------------------------------------
// OutboxTable: one outbox per entity kind
// ---------------------------------------------------------------------------

/// Names the outbox table for one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxTable {
    name: &'static str,
}

impl OutboxTable {
    pub const USERS: OutboxTable = OutboxTable {
        name: "user_change_records",
    };
    pub const LINKS: OutboxTable = OutboxTable {
        name: "link_change_records",
    };

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append one change record per topic for a single mutation.
    ///
    /// Must run on the connection of the transaction that performed the
    /// mutation; the records commit or roll back with it.
    pub async fn append_change<T: Serialize + ?Sized>(
        &self,
        conn: &mut PgConnection,
        topics: &[&str],
        payload: &T,
    ) -> Result<Vec<i64>> {
        let payload = serde_json::to_value(payload)?;
        let sql = format!(
            "INSERT INTO {} (topic, payload) VALUES ($1, $2) RETURNING id",
            self.name
        );

        let mut ids = Vec::with_capacity(topics.len());
        for topic in topics {
            let id = sqlx::query_scalar::<_, i64>(&sql)
                .bind(*topic)
                .bind(&payload)
                .fetch_one(&mut *conn)
                .await?;
            ids.push(id);
        }

        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// PgOutbox
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgOutbox {
    pool: PgPool,
    table: OutboxTable,
}

impl PgOutbox {
    pub fn new(pool: PgPool, table: OutboxTable) -> Self {
        Self { pool, table }
    }

    pub fn table(&self) -> OutboxTable {
        self.table
    }

    /// Read a single record by id.
    pub async fn read_record(&self, id: i64) -> Result<Option<ChangeRecord>> {
        let sql = format!(
            "SELECT id, topic, payload, created_at, sent_at, failed_at FROM {} WHERE id = $1",
            self.table.name
        );
        let row = sqlx::query_as::<_, ChangeRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }
}

#[async_trait]
impl OutboxStore for PgOutbox {
    async fn unsent(&self, after: i64, limit: usize) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            r#"
            SELECT id, topic, payload, created_at, sent_at, failed_at
            FROM {}
            WHERE sent_at IS NULL AND id > $1
            ORDER BY id ASC
            LIMIT $2
            "#,
            self.table.name
        );
        let rows = sqlx::query_as::<_, ChangeRecord>(&sql)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn mark_sent(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET sent_at = now() WHERE id = ANY($1)",
            self.table.name
        );
        let result = sqlx::query(&sql).bind(ids).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    async fn mark_failed(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET failed_at = now() WHERE id = ANY($1)",
            self.table.name
        );
        let result = sqlx::query(&sql).bind(ids).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }
}
