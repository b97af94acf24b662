//! Database primitives: pooled connections and the grant/group store.

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub mod store;

pub use store::PolicySnapshot;

/// Shared Postgres pool alias built on SeaORM.
pub type DbPool = DatabaseConnection;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database url missing")]
    MissingUrl,
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error(transparent)]
    SeaOrm(#[from] DbErr),
}

impl DbError {
    /// Connection-level failures worth an internal retry; everything else is
    /// either caller error or a real server fault.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SeaOrm(DbErr::Conn(_) | DbErr::ConnectionAcquire(_))
        )
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Basic environment-driven settings.
#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseSettings {
    database_uri: Option<String>,
    #[serde(default = "default_max_connections")]
    max_connections: u32,
}

const fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            database_uri: std::env::var("DATABASE_URI").ok(),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or_else(default_max_connections),
        }
    }
}

impl DatabaseSettings {
    /// Construct settings from environment variables (DATABASE_URI).
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Override the connection string (useful in tests).
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.database_uri = Some(uri.into());
        self
    }

    pub fn database_uri(&self) -> DbResult<&str> {
        self.database_uri.as_deref().ok_or(DbError::MissingUrl)
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }
}

/// Initialize a Postgres connection pool using SeaORM (rustls TLS).
pub async fn connect(settings: &DatabaseSettings) -> DbResult<DbPool> {
    let uri = settings.database_uri()?;
    let mut opts = ConnectOptions::new(uri.to_owned());
    opts.max_connections(settings.max_connections());
    opts.sqlx_logging(false);
    Database::connect(opts).await.map_err(DbError::from)
}

const RETRY_BACKOFFS: [Duration; 2] = [Duration::from_millis(200), Duration::from_millis(800)];

/// Run `op`, retrying transient connection failures with a short backoff.
/// Intended for read paths; mutations run exactly once.
pub async fn with_transient_retry<T, F, Fut>(op: F) -> DbResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < RETRY_BACKOFFS.len() => {
                warn!(%err, attempt, "transient store failure; retrying");
                tokio::time::sleep(RETRY_BACKOFFS[attempt]).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
