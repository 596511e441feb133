//! Lookup rows and the link rollup they feed.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::aggregator::{LookupStore, Recorded};
use crate::types::Aggregate;

#[derive(Clone)]
pub struct PgLookupStore {
    pool: PgPool,
}

impl PgLookupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LookupStore for PgLookupStore {
    async fn recorded(
        &self,
        entity_id: &str,
        timestamps: &[DateTime<Utc>],
    ) -> Result<Vec<DateTime<Utc>>> {
        let rows = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT ts FROM lookups WHERE link_id = $1 AND ts = ANY($2)",
        )
        .bind(entity_id)
        .bind(timestamps)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn record(&self, entity_id: &str, new_facts: &[DateTime<Utc>]) -> Result<Recorded> {
        let mut tx = self.pool.begin().await?;

        // A concurrent pass may have recorded some of these since they were
        // checked; count only what this transaction actually inserted.
        let mut inserted = Vec::with_capacity(new_facts.len());
        for ts in new_facts {
            let result = sqlx::query(
                "INSERT INTO lookups (link_id, ts) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(entity_id)
            .bind(ts)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                inserted.push(*ts);
            }
        }
        inserted.sort();
        let newest = inserted.last().copied();

        let row = sqlx::query_as::<_, (String, i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(
            r#"
            UPDATE links
            SET lookup_count = lookup_count + $2,
                last_lookup_at = GREATEST(last_lookup_at, $3)
            WHERE id = $1
            RETURNING id, lookup_count, last_lookup_at, deleted_at
            "#,
        )
        .bind(entity_id)
        .bind(inserted.len() as i64)
        .bind(newest)
        .fetch_optional(&mut *tx)
        .await?
        // The link itself has not been replicated yet. Rolling back leaves the
        // facts unacked until it arrives.
        .ok_or_else(|| anyhow!("link {entity_id} not replicated yet"))?;

        tx.commit().await?;

        let (entity_id, count, last_fact_at, deleted_at) = row;
        Ok(Recorded {
            aggregate: Aggregate {
                entity_id,
                count,
                last_fact_at,
                deleted_at,
            },
            inserted,
        })
    }
}
