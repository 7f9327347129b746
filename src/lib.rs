use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

pub mod chatsync;

pub use crate::chatsync::channel::{ChannelReceiver, ChannelSender, channel};
pub use crate::chatsync::conversation::{ChunkRef, MessageListPage, MessageListParams};
pub use crate::chatsync::error::{ChatSyncError, Result};
pub use crate::chatsync::notifications::{Notification, Notifications, Scope, Subscription};
pub use crate::chatsync::session::{SessionContext, SessionState};
pub use crate::chatsync::storage::{CombinedStorage, LruCache, MemoryStorage, StorageAdapter};
pub use crate::chatsync::thread::{Thread, ThreadHandler, ThreadState, ThreadWaker};
pub use crate::chatsync::types::{
    Address, Anchor, GroupId, GroupMember, GroupMembership, GroupMinMaxToken, Message, OutputId,
    PendingMessageRecord, RawItem,
};
pub use crate::chatsync::upstream::{
    BatchResolveOutcome, GroupDataSource, MessageResolver, MuteFilter, OutboundClient,
    SessionServices, UpstreamSource,
};
pub use crate::chatsync::{ChatSync, ChatSyncConfig};

static TRACING_GUARDS: OnceCell<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs stdout and daily-rolling file logging. Later calls are no-ops.
pub fn init_tracing(logs_dir: &std::path::Path) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("chatsync")
            .filename_suffix("log")
            .build(logs_dir)
            .map_err(|e| {
                ChatSyncError::Configuration(format!("Failed to create file appender: {e}"))
            })?;

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        // Another subscriber may already be installed by the host or a test harness
        Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .ok();
        Ok::<(), ChatSyncError>(())
    })?;
    Ok(())
}
