use async_trait::async_trait;
use chrono::Utc;

use super::{Database, DatabaseError};
use crate::chatsync::error::Result;
use crate::chatsync::storage::StorageAdapter;

/// Durable [`StorageAdapter`] backed by the `kv_store` table.
#[derive(Clone, Debug)]
pub struct SqliteStorage {
    database: Database,
}

impl SqliteStorage {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.database.pool)
            .await
            .map_err(DatabaseError::from)?;
        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.database.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.database.pool)
            .await
            .map_err(DatabaseError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_storage() -> (SqliteStorage, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let database = Database::new(temp_dir.path().join("kv.sqlite"))
            .await
            .expect("Failed to create test database");
        (SqliteStorage::new(database), temp_dir)
    }

    #[tokio::test]
    async fn test_missing_key_returns_none() {
        let (storage, _temp_dir) = create_test_storage().await;
        assert_eq!(storage.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_overwrites_existing_value() {
        let (storage, _temp_dir) = create_test_storage().await;

        storage.set("anchor", "\"c1\"").await.unwrap();
        storage.set("anchor", "\"c2\"").await.unwrap();

        assert_eq!(storage.get("anchor").await.unwrap().as_deref(), Some("\"c2\""));
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM kv_store")
            .fetch_one(&storage.database().pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_remove_missing_key_is_noop() {
        let (storage, _temp_dir) = create_test_storage().await;

        storage.remove("never-written").await.unwrap();

        storage.set("k", "1").await.unwrap();
        storage.remove("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }
}
