pub mod schema;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::error::LedgerError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite-backed storage shared by the ledger and the voting components.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    timeout: Duration,
}

impl Database {
    pub async fn connect(config: &LedgerConfig) -> Result<Self, LedgerError> {
        Self::new(
            &config.database_url,
            config.max_connections,
            config.storage_timeout(),
        )
        .await
    }

    pub async fn new(
        database_url: &str,
        max_connections: u32,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| LedgerError::ConfigError(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect_with(options)
            .await?;

        info!("Connected to ledger database");
        Ok(Self { pool, timeout })
    }

    /// In-memory database for tests and dry runs.
    ///
    /// Every SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn new_in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| LedgerError::ConfigError(format!("Invalid database URL: {}", e)))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(DEFAULT_TIMEOUT)
            .connect_with(options)
            .await?;

        let database = Self {
            pool,
            timeout: DEFAULT_TIMEOUT,
        };
        database.run_migrations().await?;
        Ok(database)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run_migrations(&self) -> Result<(), LedgerError> {
        for (name, sql) in schema::MIGRATIONS {
            self.timed("migration", sqlx::raw_sql(sql).execute(&self.pool))
                .await?;
            debug!("Applied migration {}", name);
        }
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, LedgerError> {
        self.timed("begin transaction", self.pool.begin()).await
    }

    /// Transaction that holds the write lock from its first statement.
    ///
    /// A deferred transaction that reads before it writes fails at once with
    /// SQLITE_BUSY when another connection commits in between; the busy
    /// timeout only applies while waiting to start.
    pub async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>, LedgerError> {
        self.timed(
            "begin write transaction",
            self.pool.begin_with("BEGIN IMMEDIATE"),
        )
        .await
    }

    /// Bound any storage future by the configured timeout.
    pub async fn deadline<F: Future>(
        &self,
        operation: &str,
        fut: F,
    ) -> Result<F::Output, LedgerError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| LedgerError::StorageTimeout(operation.to_string()))
    }

    /// Bound a query by the configured timeout and convert its error.
    pub async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        self.deadline(operation, fut).await?.map_err(|e| match e {
            sqlx::Error::PoolTimedOut => LedgerError::StorageTimeout(operation.to_string()),
            e => LedgerError::DatabaseError(format!("{} failed: {}", operation, e)),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Current time at the precision timestamps are persisted with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::DatabaseError(format!("Invalid stored timestamp {}: {}", value, e)))
}

pub fn parse_uuid(value: &str) -> Result<Uuid, LedgerError> {
    Uuid::parse_str(value)
        .map_err(|e| LedgerError::DatabaseError(format!("Invalid stored UUID {}: {}", value, e)))
}
