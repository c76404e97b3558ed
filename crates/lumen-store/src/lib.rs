//! Per-tenant SQLite persistence for Lumen.
//!
//! Each tenant gets one database file at `{db_root}/{tenant}.db`, opened in
//! WAL mode with foreign keys enforced. The store provides:
//!
//! - `Db::open` with additive versioned migrations
//! - `Db::with_tx`, the all-or-nothing transaction scope used by repositories
//! - `Db::retry`, bounded exponential backoff for writer contention
//! - a statement cache that pins one generated SQL string per query shape
//! - row repositories for projects, photos and public access hashes
//!
//! Jobs and job items have their own repository in `lumen-jobs`; that crate
//! is the only writer of job state.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

pub mod cache;
pub mod photos;
pub mod projects;
pub mod public;

pub use cache::{CacheStats, StatementCache};
pub use photos::{DerivativeStatus, PhotoRecord, PhotoRepo, Visibility};
pub use projects::{ProjectRecord, ProjectRepo, ProjectStatus};
pub use public::{HashCheck, PublicHashRecord, PublicHashRepo};

/// Attempt cap for writer-contention retries.
const MAX_BUSY_ATTEMPTS: u32 = 5;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("statement cache key {key:?} bound to different SQL")]
    StatementCacheConflict { key: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid value: {0}")]
    Invalid(String),

    #[error("database busy after {attempts} attempts")]
    Contended { attempts: u32 },
}

/// Current epoch seconds. All persisted timestamps use this resolution.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A tenant-scoped database handle.
///
/// Cheap to clone; the pool and statement cache are shared.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
    tenant: String,
    statements: Arc<StatementCache>,
}

impl Db {
    /// Open (or create) the database file for `tenant` under `db_root` and
    /// run pending migrations.
    pub async fn open(db_root: &Path, tenant: &str) -> Result<Self> {
        tokio::fs::create_dir_all(db_root)
            .await
            .map_err(|e| StoreError::Invalid(format!("cannot create db root: {e}")))?;
        let path = db_root.join(format!("{tenant}.db"));

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!(tenant, path = %path.display(), "opened tenant database");

        Ok(Self {
            pool,
            tenant: tenant.to_string(),
            statements: Arc::new(StatementCache::new()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    /// Run `op` inside a transaction. Commits on `Ok`, rolls back on `Err`.
    ///
    /// SQLite gives us a single writer, so the unit of work is strictly
    /// isolated from other writers for its whole duration.
    pub async fn with_tx<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut sqlx::SqliteConnection) -> BoxFuture<'t, Result<T>>,
    {
        let mut tx = self.pool.begin().await?;
        let out = op(&mut *tx).await?;
        tx.commit().await?;
        Ok(out)
    }

    /// Retry `op` on writer contention with exponential backoff, capped at
    /// [`MAX_BUSY_ATTEMPTS`]. Non-busy errors propagate immediately.
    pub async fn retry<T, Fut, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_millis(20);
        for attempt in 1..=MAX_BUSY_ATTEMPTS {
            match op().await {
                Err(StoreError::Sqlx(e)) if is_busy(&e) => {
                    if attempt == MAX_BUSY_ATTEMPTS {
                        tracing::error!(attempt, "database still busy, giving up");
                        return Err(StoreError::Contended { attempts: attempt });
                    }
                    tracing::debug!(attempt, "database busy, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
        Err(StoreError::Contended {
            attempts: MAX_BUSY_ATTEMPTS,
        })
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5" | "6" | "261" | "517"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

/// Parse a TEXT enum column, surfacing bad values as [`StoreError::Invalid`].
pub(crate) fn parse_column<T: FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| StoreError::Invalid(format!("bad {what} value: {raw}")))
}
