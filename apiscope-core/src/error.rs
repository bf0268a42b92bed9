use thiserror::Error;

/// Postgres SQLSTATE codes the engine reacts to.
pub const UNIQUE_VIOLATION: &str = "23505";
pub const SERIALIZATION_FAILURE: &str = "40001";
pub const DEADLOCK_DETECTED: &str = "40P01";
pub const LOCK_NOT_AVAILABLE: &str = "55P03";

#[derive(Error, Debug)]
pub enum ApiscopeError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid context: {0}")]
    InvalidContext(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl ApiscopeError {
    /// True for store failures worth re-running the same statement for.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiscopeError::Database(e) => is_transient(e),
            _ => false,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        match self {
            ApiscopeError::Database(e) => is_unique_violation(e),
            _ => false,
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        match self {
            ApiscopeError::Database(e) => is_connection_lost(e),
            _ => false,
        }
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// Serialization failures, deadlocks, lock timeouts, pool timeouts and IO.
/// Uniqueness violations are not transient; the resolver re-reads on them.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(_) => matches!(
            sqlstate(err).as_deref(),
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) | Some(LOCK_NOT_AVAILABLE)
        ),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(UNIQUE_VIOLATION)
}

/// The connection can no longer be used and must be replaced.
pub fn is_connection_lost(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::PoolClosed | sqlx::Error::Tls(_)
    )
}
