use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;

pub mod channel;
pub mod conversation;
pub mod database;
pub mod error;
pub mod event_source;
pub mod group_member;
pub mod notifications;
pub mod output_sending;
pub mod session;
pub mod storage;
pub mod thread;
pub mod types;
pub mod upstream;

#[cfg(any(test, feature = "integration-tests"))]
pub mod test_utils;

use crate::init_tracing;

use conversation::ConversationConfig;
use database::{Database, SqliteStorage};
use error::{ChatSyncError, Result};
use event_source::EventSourceConfig;
use group_member::GroupMemberConfig;
use output_sending::OutputSendingConfig;
use session::SessionContext;
use thread::SchedulerConfig;
use types::Address;
use upstream::SessionServices;

#[derive(Clone, Debug)]
pub struct ChatSyncConfig {
    /// Directory for application data
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    pub scheduler: SchedulerConfig,
    pub event_source: EventSourceConfig,
    pub conversation: ConversationConfig,
    pub group_member: GroupMemberConfig,
    pub output_sending: OutputSendingConfig,
}

impl ChatSyncConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            data_dir: data_dir.join(env_suffix),
            logs_dir: logs_dir.join(env_suffix),
            scheduler: SchedulerConfig::default(),
            event_source: EventSourceConfig::default(),
            conversation: ConversationConfig::default(),
            group_member: GroupMemberConfig::default(),
            output_sending: OutputSendingConfig::default(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("chatsync.sqlite")
    }
}

/// Top-level orchestrator. Owns the durable store and the one active
/// session; switching addresses tears the old session down completely
/// before the new one is built.
pub struct ChatSync {
    pub config: ChatSyncConfig,
    storage: Option<Arc<SqliteStorage>>,
    active: Mutex<Option<Arc<SessionContext>>>,
}

impl std::fmt::Debug for ChatSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSync")
            .field("config", &self.config)
            .field("storage", &"<REDACTED>")
            .finish()
    }
}

impl ChatSync {
    /// An orchestrator without a durable store of its own. Sessions use
    /// whatever storage their [`SessionServices`] carry.
    pub fn new(config: ChatSyncConfig) -> Self {
        Self {
            config,
            storage: None,
            active: Mutex::new(None),
        }
    }

    /// Creates the data and log directories, starts logging and opens the
    /// SQLite store under `data_dir`.
    pub async fn initialize(config: ChatSyncConfig) -> Result<Self> {
        let data_dir = &config.data_dir;
        let logs_dir = &config.logs_dir;

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))
            .map_err(ChatSyncError::from)?;
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))
            .map_err(ChatSyncError::from)?;

        // Only initialize tracing once
        init_tracing(logs_dir)?;

        tracing::debug!(
            target: "chatsync::initialize",
            "Logging initialized in directory: {:?}",
            logs_dir
        );

        let database = Database::new(config.database_path()).await?;
        Ok(Self {
            config,
            storage: Some(Arc::new(SqliteStorage::new(database))),
            active: Mutex::new(None),
        })
    }

    /// The SQLite store opened by [`ChatSync::initialize`], for use in
    /// [`SessionServices::storage`].
    pub fn durable_storage(&self) -> Option<Arc<SqliteStorage>> {
        self.storage.clone()
    }

    /// Makes `address` the active session, destroying the previous one.
    /// Switching to the already active address returns its session.
    pub async fn switch_address(
        &self,
        address: Address,
        services: SessionServices,
    ) -> Result<Arc<SessionContext>> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            if current.address() == &address {
                return Ok(current.clone());
            }
        }

        if let Some(previous) = active.take() {
            tracing::info!(
                target: "chatsync::switch_address",
                "Switching from {} to {}",
                previous.address(),
                address
            );
            if let Err(e) = previous.destroy().await {
                tracing::error!(
                    target: "chatsync::switch_address",
                    "Teardown of session {} failed: {}",
                    previous.address(),
                    e
                );
            }
        }

        let session = Arc::new(SessionContext::new(address, &self.config, services));
        session.bootstrap().await?;
        session.resume().await?;
        *active = Some(session.clone());
        Ok(session)
    }

    pub async fn active_session(&self) -> Option<Arc<SessionContext>> {
        self.active.lock().await.clone()
    }

    pub async fn session(&self, address: &Address) -> Result<Arc<SessionContext>> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|session| session.address() == address)
            .cloned()
            .ok_or_else(|| ChatSyncError::SessionNotFound(address.to_string()))
    }

    pub async fn pause(&self) -> Result<()> {
        match self.active_session().await {
            Some(session) => session.pause().await,
            None => Ok(()),
        }
    }

    pub async fn resume(&self) -> Result<()> {
        match self.active_session().await {
            Some(session) => session.resume().await,
            None => Ok(()),
        }
    }

    /// Destroys the active session, if any.
    pub async fn shutdown(&self) -> Result<()> {
        let previous = self.active.lock().await.take();
        if let Some(session) = previous {
            session.destroy().await?;
        }
        Ok(())
    }

    /// Deletes everything stored for `address`. Its session is destroyed
    /// first if it is the active one.
    pub async fn forget_address(&self, address: &Address) -> Result<u64> {
        let mut active = self.active.lock().await;
        if active
            .as_ref()
            .is_some_and(|session| session.address() == address)
        {
            if let Some(session) = active.take() {
                session.destroy().await?;
            }
        }
        drop(active);

        let removed = match &self.storage {
            Some(storage) => storage.database().delete_namespace(address.as_str()).await?,
            None => 0,
        };
        tracing::info!(
            target: "chatsync::forget_address",
            "Removed {} stored keys for {}",
            removed,
            address
        );
        Ok(removed)
    }

    /// Shuts down and wipes every row of the durable store.
    pub async fn delete_all_data(&self) -> Result<()> {
        self.shutdown().await?;
        if let Some(storage) = &self.storage {
            storage.database().delete_all_data().await?;
        }
        tracing::info!(target: "chatsync::delete_all_data", "All data deleted");
        Ok(())
    }
}
