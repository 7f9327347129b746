//! Interfaces to the collaborators a session depends on.
//!
//! The host supplies implementations; the engine only relies on these shapes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::chatsync::channel::ChannelSender;
use crate::chatsync::error::Result;
use crate::chatsync::storage::StorageAdapter;
use crate::chatsync::types::{Address, Anchor, FetchPage, GroupId, GroupMember, Message, OutputId, RawItem};

/// The remote, append-only event feed.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Pulls the page after `cursor` (from the beginning when `None`).
    async fn fetch(&self, cursor: Option<&Anchor>) -> Result<FetchPage>;

    /// Starts pushing realtime items into `sink`.
    async fn subscribe(&self, sink: ChannelSender<RawItem>) -> Result<()>;

    async fn unsubscribe(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResolveOutcome {
    pub failed_ids: Vec<OutputId>,
}

/// Resolves message references into full messages, best effort per item.
#[async_trait]
pub trait MessageResolver: Send + Sync {
    /// Calls `on_resolved` once per reference resolved; ids that could not be
    /// resolved are reported in the outcome. No atomicity across the batch:
    /// items reported before an error still count as resolved.
    async fn batch_resolve(
        &self,
        output_ids: &[OutputId],
        on_resolved: &mut (dyn FnMut(OutputId, Message) + Send),
    ) -> Result<BatchResolveOutcome>;
}

/// Read access to group state held upstream.
#[async_trait]
pub trait GroupDataSource: Send + Sync {
    async fn fetch_group_members(&self, group_id: &GroupId) -> Result<Vec<GroupMember>>;
}

/// State-changing writes issued on behalf of the session.
#[async_trait]
pub trait OutboundClient: Send + Sync {
    /// The session's published public key, if any.
    async fn fetch_public_key(&self, address: &Address) -> Result<Option<String>>;

    /// Sends the self-directed probe that publishes the session's public key.
    async fn send_public_key_probe(&self, address: &Address) -> Result<()>;

    async fn join_group(&self, address: &Address, group_id: &GroupId) -> Result<()>;
}

/// Decides whether a resolved message should be hidden from the session.
#[async_trait]
pub trait MuteFilter: Send + Sync {
    async fn is_muted(&self, group_id: &GroupId, sender: &Address) -> Result<bool>;
}

/// Everything one session needs from its host.
#[derive(Clone)]
pub struct SessionServices {
    pub storage: Arc<dyn StorageAdapter>,
    pub upstream: Arc<dyn UpstreamSource>,
    pub resolver: Arc<dyn MessageResolver>,
    pub group_data: Arc<dyn GroupDataSource>,
    pub outbound: Arc<dyn OutboundClient>,
    pub mute_filter: Option<Arc<dyn MuteFilter>>,
}

impl std::fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServices")
            .field("storage", &"<REDACTED>")
            .field("upstream", &"<REDACTED>")
            .field("resolver", &"<REDACTED>")
            .field("group_data", &"<REDACTED>")
            .field("outbound", &"<REDACTED>")
            .field("mute_filter", &self.mute_filter.is_some())
            .finish()
    }
}
