use thiserror::Error;

/// Failure of a capability hook while applying a change.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// A row with this identity already exists.
    #[error("unique constraint violated")]
    UniqueViolation,

    /// No row matched the expected key.
    #[error("no row matched the expected key")]
    NotFound,

    /// The change carries a version no origin ever writes.
    #[error("invalid version {0}")]
    InvalidVersion(i64),

    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl From<sqlx::Error> for ApplyError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => ApplyError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => ApplyError::UniqueViolation,
            _ => ApplyError::Persistence(err.into()),
        }
    }
}

/// Failure to hand a message to the transport.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("transport rejected message for {topic}: {message}")]
    Rejected { topic: String, message: String },

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}
