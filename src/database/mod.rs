//! Persistence layer: SQLite via sqlx.
//!
//! Connection pooling follows a split design: a read pool sized to the
//! machine, and a serialized write pool (`max_connections = 1`) through which
//! every `BEGIN IMMEDIATE` transaction flows, so only one connection ever
//! contends for the SQLite write lock.

pub mod executor;
pub mod models;
pub mod retry;
pub mod sqlite;

pub use executor::{Executor, JobInsertParams, JobTransition};
pub use models::{AttemptError, JobRow, JobState};
pub use sqlite::SqliteExecutor;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Serialized write pool type alias (max_connections = 1).
pub type WritePool = Pool<Sqlite>;

const DEFAULT_READ_POOL_SIZE: u32 = 10;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Negative value means KB of page cache (32MB).
const DEFAULT_CACHE_SIZE_KB: i32 = -32000;

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(&format!("PRAGMA cache_size = {}", DEFAULT_CACHE_SIZE_KB))
        .execute(&mut *conn)
        .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

fn connect_options(database_url: &str) -> std::result::Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true))
}

/// Read pool size based on available cores, capped where SQLite readers stop
/// benefiting.
pub fn default_read_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    (cores * 2).min(DEFAULT_READ_POOL_SIZE)
}

/// Initialize the read pool with WAL mode.
pub async fn init_pool(database_url: &str) -> std::result::Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, default_read_pool_size()).await
}

/// Initialize the read pool with an explicit size.
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> std::result::Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    tracing::info!(
        "Database pool initialized with WAL mode, {} max connections",
        max_connections
    );

    Ok(pool)
}

/// Initialize the serialized write pool.
///
/// All `BEGIN IMMEDIATE` transactions go through this pool. Writes queue on
/// its single connection, so the acquire timeout is longer than the read
/// pool's.
pub async fn init_write_pool(database_url: &str) -> std::result::Result<WritePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(60))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    tracing::info!("Write pool initialized with 1 max connection (serialized writes)");

    Ok(pool)
}

/// Run embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Open a manual immediate transaction on the write pool.
///
/// `BEGIN IMMEDIATE` takes the write lock up front, preventing the deadlock
/// that deferred transactions hit when multiple readers try to upgrade to
/// writers at once.
pub async fn begin_immediate(
    pool: &WritePool,
) -> std::result::Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction {
        conn,
        finished: false,
    })
}

/// Wrapper for a manual immediate transaction.
///
/// If dropped without an explicit commit or rollback, the underlying
/// connection is closed rather than returned to the pool. Closing the
/// connection aborts the transaction without issuing a ROLLBACK that could
/// itself fail on an already-broken connection, so callers never have to
/// classify rollback error strings.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    pub async fn commit(mut self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}
