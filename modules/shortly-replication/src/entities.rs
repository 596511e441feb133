//! User and link change payloads and their replica rows.
//!
//! Payloads are partial: a create carries the full field set, an update
//! carries `id`, `v` and whatever changed. Absent fields keep their local
//! value. `deletedAt: null` clears a soft delete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{double_option, Versioned};

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserChange {
    pub id: String,
    pub v: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub deleted_at: Option<Option<DateTime<Utc>>>,
}

impl Versioned for UserChange {
    fn id(&self) -> &str {
        &self.id
    }

    fn v(&self) -> i64 {
        self.v
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserRow {
    pub id: String,
    pub v: i64,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl UserRow {
    /// A replica row built from a create payload.
    pub fn from_change(change: &UserChange) -> Self {
        Self {
            id: change.id.clone(),
            v: change.v,
            username: change.username.clone(),
            created_at: change.created_at.unwrap_or_else(Utc::now),
            deleted_at: change.deleted_at.flatten(),
        }
    }

    /// Apply the fields present in `change` and take its version.
    pub fn patch(&mut self, change: &UserChange) {
        self.v = change.v;
        if let Some(username) = &change.username {
            self.username = Some(username.clone());
        }
        if let Some(deleted_at) = change.deleted_at {
            self.deleted_at = deleted_at;
        }
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkChange {
    pub id: String,
    pub v: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub deleted_at: Option<Option<DateTime<Utc>>>,
}

impl Versioned for LinkChange {
    fn id(&self) -> &str {
        &self.id
    }

    fn v(&self) -> i64 {
        self.v
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LinkRow {
    pub id: String,
    pub v: i64,
    pub short: Option<String>,
    pub long: Option<String>,
    pub user_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub lookup_count: i64,
    pub last_lookup_at: Option<DateTime<Utc>>,
}

impl LinkRow {
    pub fn from_change(change: &LinkChange) -> Self {
        Self {
            id: change.id.clone(),
            v: change.v,
            short: change.short.clone(),
            long: change.long.clone(),
            user_id: change.user_id.clone(),
            expires_at: change.expires_at,
            created_at: change.created_at.unwrap_or_else(Utc::now),
            deleted_at: change.deleted_at.flatten(),
            lookup_count: 0,
            last_lookup_at: None,
        }
    }

    pub fn patch(&mut self, change: &LinkChange) {
        self.v = change.v;
        if let Some(short) = &change.short {
            self.short = Some(short.clone());
        }
        if let Some(long) = &change.long {
            self.long = Some(long.clone());
        }
        if let Some(user_id) = &change.user_id {
            self.user_id = Some(user_id.clone());
        }
        if let Some(expires_at) = change.expires_at {
            self.expires_at = Some(expires_at);
        }
        if let Some(deleted_at) = change.deleted_at {
            self.deleted_at = deleted_at;
        }
    }

    /// Full-field change payload for this row at its current version.
    /// Rollup columns are local and never replicated.
    pub fn to_change(&self) -> LinkChange {
        LinkChange {
            id: self.id.clone(),
            v: self.v,
            created_at: Some(self.created_at),
            short: self.short.clone(),
            long: self.long.clone(),
            user_id: self.user_id.clone(),
            expires_at: self.expires_at,
            deleted_at: Some(self.deleted_at),
        }
    }
}
