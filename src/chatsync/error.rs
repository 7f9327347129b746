use thiserror::Error;

use crate::chatsync::database::DatabaseError;

pub type Result<T> = core::result::Result<T, ChatSyncError>;

#[derive(Error, Debug)]
pub enum ChatSyncError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Upstream fetch failed: {0}")]
    Upstream(String),

    #[error("Message resolution failed: {0}")]
    Resolve(String),

    #[error("Outbound command failed: {0}")]
    Outbound(String),

    /// A caller broke an API contract. Never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Thread {name} cannot {action} while {state}")]
    InvalidThreadState {
        name: &'static str,
        action: &'static str,
        state: String,
    },

    #[error("No session for address {0}")]
    SessionNotFound(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<Box<dyn std::error::Error + Send + Sync>> for ChatSyncError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        ChatSyncError::Other(anyhow::anyhow!(err.to_string()))
    }
}

impl ChatSyncError {
    /// Failures of the store or a collaborator that a later tick may not see
    /// again. The scheduler logs them at `warn`, anything else at `error`.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChatSyncError::Filesystem(_)
                | ChatSyncError::Database(_)
                | ChatSyncError::Storage(_)
                | ChatSyncError::Upstream(_)
                | ChatSyncError::Resolve(_)
                | ChatSyncError::Outbound(_)
        )
    }
}
