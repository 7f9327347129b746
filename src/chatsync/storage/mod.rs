//! Two-tier storage
//!
//! A bounded in-memory [`LruCache`] in front of a host-supplied durable
//! [`StorageAdapter`]. [`CombinedStorage`] ties the two together and scopes
//! every key to one session.

mod cache;
mod combined;

pub use cache::LruCache;
pub use combined::CombinedStorage;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::chatsync::error::Result;

/// Durable key-value store supplied by the host environment.
///
/// Values are JSON strings. A missing key reads as `None` and removing a
/// missing key is a no-op.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-process [`StorageAdapter`], for tests and hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|value| value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
