use async_trait::async_trait;
use sqlx::PgPool;

use crate::consumer::SyncTarget;
use crate::entities::{LinkChange, LinkRow};
use crate::error::ApplyError;
use crate::types::EntityKey;

pub(crate) const LINK_COLUMNS: &str = "id, v, short, long, user_id, expires_at, created_at, \
     deleted_at, lookup_count, last_lookup_at";

/// Link replica. Rollup columns (`lookup_count`, `last_lookup_at`) are owned
/// by the lookup store and never written from change payloads.
#[derive(Clone)]
pub struct PgLinkReplica {
    pool: PgPool,
}

impl PgLinkReplica {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncTarget for PgLinkReplica {
    type Change = LinkChange;
    type Row = LinkRow;

    fn entity(&self) -> &'static str {
        "link"
    }

    async fn create_entity(&self, data: &LinkChange) -> Result<LinkRow, ApplyError> {
        let row = LinkRow::from_change(data);
        let sql = format!(
            r#"
            INSERT INTO links (id, v, short, long, user_id, expires_at, created_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {LINK_COLUMNS}
            "#
        );
        let created = sqlx::query_as::<_, LinkRow>(&sql)
            .bind(&row.id)
            .bind(row.v)
            .bind(&row.short)
            .bind(&row.long)
            .bind(&row.user_id)
            .bind(row.expires_at)
            .bind(row.created_at)
            .bind(row.deleted_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(created)
    }

    async fn update_entity(
        &self,
        expected: &EntityKey,
        data: &LinkChange,
    ) -> Result<LinkRow, ApplyError> {
        let sql = format!(
            r#"
            UPDATE links
            SET v = $3,
                short = COALESCE($4, short),
                long = COALESCE($5, long),
                user_id = COALESCE($6, user_id),
                expires_at = COALESCE($7, expires_at),
                deleted_at = CASE WHEN $8 THEN $9 ELSE deleted_at END
            WHERE id = $1 AND v = $2
            RETURNING {LINK_COLUMNS}
            "#
        );
        sqlx::query_as::<_, LinkRow>(&sql)
            .bind(&expected.id)
            .bind(expected.v)
            .bind(data.v)
            .bind(&data.short)
            .bind(&data.long)
            .bind(&data.user_id)
            .bind(data.expires_at)
            .bind(data.deleted_at.is_some())
            .bind(data.deleted_at.flatten())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ApplyError::NotFound)
    }

    async fn find_entity(&self, key: &EntityKey) -> Result<Option<LinkRow>, ApplyError> {
        let sql = format!("SELECT {LINK_COLUMNS} FROM links WHERE id = $1 AND v = $2");
        let row = sqlx::query_as::<_, LinkRow>(&sql)
            .bind(&key.id)
            .bind(key.v)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn current_version(&self, id: &str) -> Result<Option<i64>, ApplyError> {
        let v = sqlx::query_scalar::<_, i64>("SELECT v FROM links WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(v)
    }
}
