//! Scripted collaborators for unit and integration tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::chatsync::channel::ChannelSender;
use crate::chatsync::error::{ChatSyncError, Result};
use crate::chatsync::storage::{MemoryStorage, StorageAdapter};
use crate::chatsync::types::{
    Address, Anchor, FetchPage, GroupId, GroupMember, Message, OutputId, RawItem,
};
use crate::chatsync::upstream::{
    BatchResolveOutcome, GroupDataSource, MessageResolver, MuteFilter, OutboundClient,
    SessionServices, UpstreamSource,
};

pub fn message_ref(output_id: &str, group_id: &str) -> RawItem {
    RawItem::NewMessageRef {
        output_id: OutputId::from(output_id),
        group_id: GroupId::from(group_id),
        payload: serde_json::Value::Null,
    }
}

pub fn member_changed(group_id: &str, address: &str) -> RawItem {
    RawItem::MemberChanged {
        group_id: GroupId::from(group_id),
        address: Address::from(address),
        is_new_member: true,
        timestamp: 1_700_000_000,
    }
}

pub fn token_update(group_id: &str, min: Option<&str>, max: Option<&str>) -> RawItem {
    RawItem::MinMaxTokenUpdate {
        group_id: GroupId::from(group_id),
        min: min.map(str::to_string),
        max: max.map(str::to_string),
    }
}

pub fn test_message(id: &str, group_id: &str, sender: &str, timestamp: u64) -> Message {
    Message {
        message_id: id.to_string(),
        group_id: GroupId::from(group_id),
        sender: Address::from(sender),
        message: format!("body of {id}"),
        timestamp,
        token: format!("{timestamp:x}"),
    }
}

/// Pull feed that replays queued pages, then serves empty pages.
#[derive(Default)]
pub struct ScriptedUpstream {
    pages: Mutex<VecDeque<Result<FetchPage>>>,
    pub cursors_seen: Mutex<Vec<Option<Anchor>>>,
    pub sink: Mutex<Option<ChannelSender<RawItem>>>,
    pub unsubscribed: AtomicBool,
    pub fetch_delay: Mutex<Option<Duration>>,
}

impl ScriptedUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_page(&self, items: Vec<RawItem>, next_cursor: Option<&str>) {
        self.pages.lock().push_back(Ok(FetchPage {
            items,
            next_cursor: next_cursor.map(|c| Anchor(c.to_string())),
        }));
    }

    pub fn push_error(&self) {
        self.pages
            .lock()
            .push_back(Err(ChatSyncError::Upstream("connection reset".to_string())));
    }

    pub fn fetch_count(&self) -> usize {
        self.cursors_seen.lock().len()
    }

    pub fn is_subscribed(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Delivers `item` through the push subscription, as the realtime feed would.
    pub fn deliver(&self, item: RawItem) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.push(item),
            None => false,
        }
    }
}

#[async_trait]
impl UpstreamSource for ScriptedUpstream {
    async fn fetch(&self, cursor: Option<&Anchor>) -> Result<FetchPage> {
        self.cursors_seen.lock().push(cursor.cloned());
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.pages.lock().pop_front();
        next.unwrap_or_else(|| Ok(FetchPage::default()))
    }

    async fn subscribe(&self, sink: ChannelSender<RawItem>) -> Result<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.sink.lock().take();
        self.unsubscribed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Resolves ids from a fixed table; unknown ids fail.
#[derive(Default)]
pub struct ScriptedResolver {
    pub messages: Mutex<HashMap<OutputId, Message>>,
    pub fail_next_call: AtomicBool,
    pub calls: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, output_id: &str, message: Message) {
        self.messages.lock().insert(OutputId::from(output_id), message);
    }
}

#[async_trait]
impl MessageResolver for ScriptedResolver {
    async fn batch_resolve(
        &self,
        output_ids: &[OutputId],
        on_resolved: &mut (dyn FnMut(OutputId, Message) + Send),
    ) -> Result<BatchResolveOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_call.swap(false, Ordering::SeqCst) {
            return Err(ChatSyncError::Resolve("resolver unavailable".to_string()));
        }
        let mut failed_ids = Vec::new();
        for output_id in output_ids {
            let found = self.messages.lock().get(output_id).cloned();
            match found {
                Some(message) => on_resolved(output_id.clone(), message),
                None => failed_ids.push(output_id.clone()),
            }
        }
        Ok(BatchResolveOutcome { failed_ids })
    }
}

#[derive(Default)]
pub struct ScriptedGroupData {
    pub members: Mutex<HashMap<GroupId, Vec<GroupMember>>>,
    pub calls: Mutex<Vec<GroupId>>,
    pub fail_next_call: AtomicBool,
}

impl ScriptedGroupData {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_members(&self, group_id: &str, addresses: &[&str]) {
        let members = addresses
            .iter()
            .map(|address| GroupMember {
                address: Address::from(*address),
                public_key: Some(format!("pk-{address}")),
            })
            .collect();
        self.members.lock().insert(GroupId::from(group_id), members);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl GroupDataSource for ScriptedGroupData {
    async fn fetch_group_members(&self, group_id: &GroupId) -> Result<Vec<GroupMember>> {
        self.calls.lock().push(group_id.clone());
        if self.fail_next_call.swap(false, Ordering::SeqCst) {
            return Err(ChatSyncError::Upstream("group data unavailable".to_string()));
        }
        Ok(self.members.lock().get(group_id).cloned().unwrap_or_default())
    }
}

/// Outbound client whose public key appears after a configurable number of probes.
#[derive(Default)]
pub struct ScriptedOutbound {
    pub public_key: Mutex<Option<String>>,
    pub probes: AtomicUsize,
    pub key_checks: AtomicUsize,
    pub key_check_failures: AtomicUsize,
    pub joined: Mutex<Vec<GroupId>>,
    pub join_failures: AtomicUsize,
    pub publish_key_on_probe: AtomicBool,
}

impl ScriptedOutbound {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_public_key(&self, key: Option<&str>) {
        *self.public_key.lock() = key.map(str::to_string);
    }
}

#[async_trait]
impl OutboundClient for ScriptedOutbound {
    async fn fetch_public_key(&self, _address: &Address) -> Result<Option<String>> {
        self.key_checks.fetch_add(1, Ordering::SeqCst);
        let remaining = self.key_check_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.key_check_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ChatSyncError::Outbound("key lookup timed out".to_string()));
        }
        Ok(self.public_key.lock().clone())
    }

    async fn send_public_key_probe(&self, _address: &Address) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.publish_key_on_probe.load(Ordering::SeqCst) {
            self.set_public_key(Some("pk-self"));
        }
        Ok(())
    }

    async fn join_group(&self, _address: &Address, group_id: &GroupId) -> Result<()> {
        let remaining = self.join_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.join_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ChatSyncError::Outbound("join rejected".to_string()));
        }
        self.joined.lock().push(group_id.clone());
        Ok(())
    }
}

/// Mutes a fixed set of senders in every group.
#[derive(Default)]
pub struct StaticMuteFilter {
    pub muted: Mutex<HashSet<Address>>,
}

impl StaticMuteFilter {
    pub fn muting(addresses: &[&str]) -> Arc<Self> {
        let filter = Self::default();
        filter
            .muted
            .lock()
            .extend(addresses.iter().map(|a| Address::from(*a)));
        Arc::new(filter)
    }
}

#[async_trait]
impl MuteFilter for StaticMuteFilter {
    async fn is_muted(&self, _group_id: &GroupId, sender: &Address) -> Result<bool> {
        Ok(self.muted.lock().contains(sender))
    }
}

pub struct TestServices {
    pub storage: Arc<MemoryStorage>,
    pub upstream: Arc<ScriptedUpstream>,
    pub resolver: Arc<ScriptedResolver>,
    pub group_data: Arc<ScriptedGroupData>,
    pub outbound: Arc<ScriptedOutbound>,
}

impl TestServices {
    pub fn new() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            upstream: ScriptedUpstream::new(),
            resolver: ScriptedResolver::new(),
            group_data: ScriptedGroupData::new(),
            outbound: ScriptedOutbound::new(),
        }
    }

    pub fn services(&self) -> SessionServices {
        let storage: Arc<dyn StorageAdapter> = self.storage.clone();
        SessionServices {
            storage,
            upstream: self.upstream.clone(),
            resolver: self.resolver.clone(),
            group_data: self.group_data.clone(),
            outbound: self.outbound.clone(),
            mute_filter: None,
        }
    }
}

impl Default for TestServices {
    fn default() -> Self {
        Self::new()
    }
}
