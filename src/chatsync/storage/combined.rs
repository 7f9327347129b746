use std::sync::Arc;

use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{mpsc, oneshot};

use super::{LruCache, StorageAdapter};
use crate::chatsync::error::{ChatSyncError, Result};

enum DeferredWrite {
    Set { key: String, value: String },
    Flush(oneshot::Sender<()>),
}

/// Cache-fronted view of the durable store, scoped to one session namespace.
///
/// The durable store stays the source of truth for [`CombinedStorage::set`].
/// [`CombinedStorage::set_single_threaded`] trades that for read-after-write
/// consistency through the cache: the durable write is queued and a crash
/// before it lands loses the update. Queued writes are applied in order by a
/// single writer task.
///
/// Until the writer has applied it, a queued value also sits in an overlay
/// that reads consult before the adapter, so an LRU eviction never exposes
/// the older durable value.
pub struct CombinedStorage {
    adapter: Arc<dyn StorageAdapter>,
    namespace: String,
    deferred: mpsc::UnboundedSender<DeferredWrite>,
    unflushed: Arc<DashMap<String, String>>,
}

impl CombinedStorage {
    /// Must be called from within a tokio runtime; spawns the deferred writer.
    pub fn new(adapter: Arc<dyn StorageAdapter>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let (deferred, receiver) = mpsc::unbounded_channel();
        let unflushed = Arc::new(DashMap::new());
        tokio::spawn(Self::run_deferred_writer(
            adapter.clone(),
            receiver,
            unflushed.clone(),
        ));
        Self {
            adapter,
            namespace,
            deferred,
            unflushed,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}.{}", self.namespace, key)
    }

    pub async fn get<V>(&self, key: &str, cache: &LruCache<V>) -> Result<Option<V>>
    where
        V: DeserializeOwned + Clone,
    {
        if let Some(value) = cache.get(key) {
            return Ok(Some(value));
        }
        let Some(value) = self.get_uncached::<V>(key).await? else {
            return Ok(None);
        };
        cache.put(key, value.clone());
        Ok(Some(value))
    }

    /// Durable write, then invalidates the cache entry.
    pub async fn set<V>(&self, key: &str, value: &V, cache: &LruCache<V>) -> Result<()>
    where
        V: Serialize + Clone,
    {
        self.set_uncached(key, value).await?;
        cache.delete(key);
        Ok(())
    }

    /// Updates the cache synchronously and queues the durable write.
    pub fn set_single_threaded<V>(&self, key: &str, value: V, cache: &LruCache<V>) -> Result<()>
    where
        V: Serialize + Clone,
    {
        let serialized = serde_json::to_string(&value)?;
        let full_key = self.full_key(key);
        // Visible in the overlay before the writer can apply and clear it
        self.unflushed.insert(full_key.clone(), serialized.clone());
        let queued = self.deferred.send(DeferredWrite::Set {
            key: full_key.clone(),
            value: serialized,
        });
        if queued.is_err() {
            self.unflushed.remove(&full_key);
            return Err(ChatSyncError::Storage("deferred writer stopped".to_string()));
        }
        cache.put(key, value);
        Ok(())
    }

    /// Number of queued writes the writer task has not applied yet.
    pub fn unflushed_len(&self) -> usize {
        self.unflushed.len()
    }

    pub async fn remove<V>(&self, key: &str, cache: &LruCache<V>) -> Result<()>
    where
        V: Clone,
    {
        // A queued write must not land after the removal
        self.flush_deferred().await?;
        cache.delete(key);
        let full_key = self.full_key(key);
        self.unflushed.remove(&full_key);
        self.adapter.remove(&full_key).await
    }

    pub async fn get_uncached<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let full_key = self.full_key(key);
        let queued = self.unflushed.get(&full_key).map(|entry| entry.value().clone());
        if let Some(raw) = queued {
            return Ok(Some(serde_json::from_str(&raw)?));
        }
        match self.adapter.get(&full_key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_uncached<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let serialized = serde_json::to_string(value)?;
        self.adapter.set(&self.full_key(key), &serialized).await
    }

    /// Waits until every write queued before this call has been attempted.
    pub async fn flush_deferred(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.deferred
            .send(DeferredWrite::Flush(done))
            .map_err(|_| ChatSyncError::Storage("deferred writer stopped".to_string()))?;
        wait.await
            .map_err(|_| ChatSyncError::Storage("deferred writer stopped".to_string()))
    }

    async fn run_deferred_writer(
        adapter: Arc<dyn StorageAdapter>,
        mut receiver: mpsc::UnboundedReceiver<DeferredWrite>,
        unflushed: Arc<DashMap<String, String>>,
    ) {
        while let Some(write) = receiver.recv().await {
            match write {
                DeferredWrite::Set { key, value } => match adapter.set(&key, &value).await {
                    // A newer queued value for the key stays in the overlay
                    Ok(()) => {
                        unflushed.remove_if(&key, |_, queued| queued == &value);
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "chatsync::storage::combined::run_deferred_writer",
                            "Deferred write for {} failed: {}",
                            key,
                            e
                        );
                    }
                },
                DeferredWrite::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!(
            target: "chatsync::storage::combined::run_deferred_writer",
            "Deferred writer exiting"
        );
    }
}

impl std::fmt::Debug for CombinedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedStorage")
            .field("namespace", &self.namespace)
            .field("adapter", &"<REDACTED>")
            .finish()
    }
}
