//! User replica with optional cascade onto the links this service owns.

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use tracing::info;

use crate::consumer::SyncTarget;
use crate::entities::{LinkRow, UserChange, UserRow};
use crate::error::ApplyError;
use crate::outbox::OutboxTable;
use crate::topics::LINK_UPDATE_TOPICS;
use crate::types::EntityKey;

use super::links::LINK_COLUMNS;

const USER_COLUMNS: &str = "id, v, username, created_at, deleted_at";

#[derive(Clone)]
pub struct PgUserReplica {
    pool: PgPool,
    cascade: Option<OutboxTable>,
}

impl PgUserReplica {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cascade: None,
        }
    }

    /// On a user soft delete, soft-delete the user's live links and append
    /// their change records to `outbox`, all in the apply transaction.
    pub fn cascade_links(mut self, outbox: OutboxTable) -> Self {
        self.cascade = Some(outbox);
        self
    }
}

#[async_trait]
impl SyncTarget for PgUserReplica {
    type Change = UserChange;
    type Row = UserRow;

    fn entity(&self) -> &'static str {
        "user"
    }

    async fn create_entity(&self, data: &UserChange) -> Result<UserRow, ApplyError> {
        let row = UserRow::from_change(data);
        let sql = format!(
            r#"
            INSERT INTO users (id, v, username, created_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {USER_COLUMNS}
            "#
        );
        let created = sqlx::query_as::<_, UserRow>(&sql)
            .bind(&row.id)
            .bind(row.v)
            .bind(&row.username)
            .bind(row.created_at)
            .bind(row.deleted_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(created)
    }

    async fn update_entity(
        &self,
        expected: &EntityKey,
        data: &UserChange,
    ) -> Result<UserRow, ApplyError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE users
            SET v = $3,
                username = COALESCE($4, username),
                deleted_at = CASE WHEN $5 THEN $6 ELSE deleted_at END
            WHERE id = $1 AND v = $2
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, UserRow>(&sql)
            .bind(&expected.id)
            .bind(expected.v)
            .bind(data.v)
            .bind(&data.username)
            .bind(data.deleted_at.is_some())
            .bind(data.deleted_at.flatten())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ApplyError::NotFound)?;

        if let (Some(outbox), Some(_)) = (self.cascade, user.deleted_at) {
            let links = cascade_soft_delete(&mut *tx, &user, outbox).await?;
            if links > 0 {
                info!(user_id = user.id.as_str(), links, "Cascaded user delete to links");
            }
        }

        tx.commit().await?;
        Ok(user)
    }

    async fn find_entity(&self, key: &EntityKey) -> Result<Option<UserRow>, ApplyError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND v = $2");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(&key.id)
            .bind(key.v)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn current_version(&self, id: &str) -> Result<Option<i64>, ApplyError> {
        let v = sqlx::query_scalar::<_, i64>("SELECT v FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(v)
    }
}

/// Soft-delete every live link owned by `user`, bumping each link's version,
/// and append one change record per link per link topic. Runs on the caller's
/// transaction so the cascade commits with the user's own update.
async fn cascade_soft_delete(
    conn: &mut PgConnection,
    user: &UserRow,
    outbox: OutboxTable,
) -> Result<usize, ApplyError> {
    let sql = format!(
        r#"
        UPDATE links
        SET deleted_at = $2, v = v + 1
        WHERE user_id = $1 AND deleted_at IS NULL
        RETURNING {LINK_COLUMNS}
        "#
    );
    let links = sqlx::query_as::<_, LinkRow>(&sql)
        .bind(&user.id)
        .bind(user.deleted_at)
        .fetch_all(&mut *conn)
        .await?;

    for link in &links {
        outbox
            .append_change(&mut *conn, LINK_UPDATE_TOPICS, &link.to_change())
            .await
            .map_err(ApplyError::Persistence)?;
    }

    Ok(links.len())
}
