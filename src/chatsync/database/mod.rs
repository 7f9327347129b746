//! SQLite store behind every session's durable tier.
//!
//! The schema is a single `kv_store` table, so everything a session persists
//! (anchor, pending list, chunks, message bodies, membership, tokens) is a
//! JSON value under an address-prefixed key.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use sqlx::migrate::{MigrateDatabase, Migrator};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool};
use thiserror::Error;

pub mod kv_store;

pub use kv_store::SqliteStorage;

pub static MIGRATOR: LazyLock<Migrator> = LazyLock::new(|| sqlx::migrate!("./db_migrations"));

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 10;
const BUSY_TIMEOUT_MS: u32 = 5000;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Clone, Debug)]
pub struct Database {
    pub pool: SqlitePool,
    pub path: PathBuf,
    pub last_connected: SystemTime,
}

impl Database {
    /// Opens (creating if needed) the store at `db_path` and brings the
    /// schema up to date.
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db_url = format!("sqlite://{}", db_path.display());
        Self::ensure_exists(&db_url).await?;

        let pool = Self::connect(&db_url).await?;
        MIGRATOR.run(&pool).await?;

        tracing::debug!(
            target: "chatsync::database::new",
            "Opened store at {}",
            db_path.display()
        );
        Ok(Self {
            pool,
            path: db_path,
            last_connected: SystemTime::now(),
        })
    }

    async fn ensure_exists(db_url: &str) -> Result<(), DatabaseError> {
        let exists = match Sqlite::database_exists(db_url).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(
                    target: "chatsync::database::ensure_exists",
                    "Could not check for {}: {:?}, attempting to create",
                    db_url,
                    e
                );
                false
            }
        };
        if !exists {
            tracing::debug!(target: "chatsync::database::ensure_exists", "Creating {}", db_url);
            Sqlite::create_database(db_url).await.map_err(|e| {
                tracing::error!(
                    target: "chatsync::database::ensure_exists",
                    "Error creating {}: {:?}",
                    db_url,
                    e
                );
                DatabaseError::Sqlx(e)
            })?;
        }
        Ok(())
    }

    async fn connect(db_url: &str) -> Result<SqlitePool, DatabaseError> {
        let pool = SqlitePoolOptions::new()
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .max_connections(MAX_CONNECTIONS)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    // Deferred cache flushes write concurrently with foreground reads
                    sqlx::query("PRAGMA journal_mode=WAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("{db_url}?mode=rwc"))
            .await?;
        Ok(pool)
    }

    /// Applies pending migrations. Safe to call repeatedly.
    pub async fn migrate_up(&self) -> Result<(), DatabaseError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Number of stored keys starting with `prefix`; an empty prefix counts
    /// every row.
    pub async fn count_keys(&self, prefix: &str) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM kv_store WHERE key LIKE ? || '%' ESCAPE '\\'")
                .bind(escape_like(prefix))
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Removes every key of one session namespace (`"{prefix}."`).
    pub async fn delete_namespace(&self, prefix: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key LIKE ? || '%' ESCAPE '\\'")
            .bind(escape_like(&format!("{prefix}.")))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Empties the store, keeping the schema.
    pub async fn delete_all_data(&self) -> Result<(), DatabaseError> {
        let mut txn = self.pool.begin().await?;
        sqlx::query("DELETE FROM kv_store").execute(&mut *txn).await?;
        txn.commit().await?;
        Ok(())
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
