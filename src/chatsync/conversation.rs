//! Per-group message log.
//!
//! Each group's log is a chain of chunks. The newest chunk, the head, is the
//! only mutable one and lives under a fixed per-group key. When it grows past
//! the split threshold its oldest entries are carved into an immutable chunk
//! stored under the content hash of its own serialized form, and the head
//! links to it through `next_key`. Chunks link oldest-ward, so every read
//! starts from the head or from a chunk key handed out by a previous page.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chatsync::channel::ChannelReceiver;
use crate::chatsync::error::{ChatSyncError, Result};
use crate::chatsync::notifications::{Notification, Notifications};
use crate::chatsync::storage::{CombinedStorage, LruCache};
use crate::chatsync::thread::ThreadHandler;
use crate::chatsync::types::{GroupId, Message, content_hash};

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Head length above which the head is split
    pub split_threshold: usize,
    /// Number of oldest entries moved out of the head on a split
    pub split_size: usize,
    pub chunk_cache_capacity: usize,
    pub message_cache_capacity: usize,
    /// Resolved messages appended per tick
    pub drain_limit: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            split_threshold: 150,
            split_size: 100,
            chunk_cache_capacity: 200,
            message_cache_capacity: 500,
            drain_limit: 100,
        }
    }
}

/// A run of message ids ordered by ascending timestamp.
///
/// Field order is part of the chunk's identity: stored chunks are keyed by
/// the hash of this exact serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationChunk {
    pub group_id: GroupId,
    pub message_ids: Vec<String>,
    pub timestamps: Vec<u64>,
    pub next_key: Option<String>,
}

impl ConversationChunk {
    fn empty(group_id: &GroupId) -> Self {
        Self {
            group_id: group_id.clone(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.message_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }

    fn position(&self, message_id: &str) -> Option<usize> {
        self.message_ids.iter().position(|id| id == message_id)
    }

    /// Inserts after every entry with a timestamp at or below `timestamp`.
    fn insert(&mut self, message_id: String, timestamp: u64) {
        let mut index = self.timestamps.len();
        while index > 0 && self.timestamps[index - 1] > timestamp {
            index -= 1;
        }
        self.message_ids.insert(index, message_id);
        self.timestamps.insert(index, timestamp);
    }

    /// Removes the oldest `count` entries into a new chunk that inherits this
    /// chunk's link.
    fn split_off_oldest(&mut self, count: usize) -> ConversationChunk {
        let count = count.min(self.len());
        ConversationChunk {
            group_id: self.group_id.clone(),
            message_ids: self.message_ids.drain(..count).collect(),
            timestamps: self.timestamps.drain(..count).collect(),
            next_key: self.next_key.take(),
        }
    }
}

/// Address of a chunk within one group's chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkRef {
    Head,
    Stored(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Newest first, or strictly before `until_message_id`
    Backward { until_message_id: Option<String> },
    /// Strictly after `start_message_id`
    Forward { start_message_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageListParams {
    pub group_id: GroupId,
    /// Chunk to start in; the head when `None`
    pub key: Option<ChunkRef>,
    pub start_message_id: Option<String>,
    pub until_message_id: Option<String>,
    pub size: usize,
}

impl MessageListParams {
    pub fn latest(group_id: impl Into<GroupId>, size: usize) -> Self {
        Self {
            group_id: group_id.into(),
            size,
            ..Default::default()
        }
    }

    fn direction(&self) -> Result<Direction> {
        match (&self.start_message_id, &self.until_message_id) {
            (Some(_), Some(_)) => Err(ChatSyncError::InvalidArgument(
                "start_message_id and until_message_id are mutually exclusive".to_string(),
            )),
            (Some(start), None) => Ok(Direction::Forward {
                start_message_id: start.clone(),
            }),
            (None, until) => Ok(Direction::Backward {
                until_message_id: until.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageListPage {
    /// Ascending by timestamp
    pub message_ids: Vec<String>,
    pub earliest_message_id: Option<String>,
    /// Chunk holding `earliest_message_id`; pass it back with
    /// `until_message_id = earliest_message_id` to keep paging backward
    pub earliest_key: Option<ChunkRef>,
    /// Nothing older than `earliest_message_id` exists
    pub reached_start: bool,
}

pub struct ConversationDomain {
    config: ConversationConfig,
    storage: Arc<CombinedStorage>,
    chunks: LruCache<ConversationChunk>,
    messages: LruCache<Message>,
    inbox: parking_lot::Mutex<ChannelReceiver<Message>>,
    retry: parking_lot::Mutex<VecDeque<Message>>,
    append_lock: tokio::sync::Mutex<()>,
    notifications: Arc<Notifications>,
}

impl ConversationDomain {
    pub fn new(
        config: ConversationConfig,
        storage: Arc<CombinedStorage>,
        inbox: ChannelReceiver<Message>,
        notifications: Arc<Notifications>,
    ) -> Self {
        Self {
            chunks: LruCache::new("conversation_chunks", config.chunk_cache_capacity),
            messages: LruCache::new("conversation_messages", config.message_cache_capacity),
            config,
            storage,
            inbox: parking_lot::Mutex::new(inbox),
            retry: parking_lot::Mutex::new(VecDeque::new()),
            append_lock: tokio::sync::Mutex::new(()),
            notifications,
        }
    }

    fn head_key(group_id: &GroupId) -> String {
        format!("conversation.{group_id}.head")
    }

    fn stored_key(hash: &str) -> String {
        format!("conversation.chunk.{hash}")
    }

    fn message_key(message_id: &str) -> String {
        format!("conversation.message.{message_id}")
    }

    fn storage_key(group_id: &GroupId, chunk: &ChunkRef) -> String {
        match chunk {
            ChunkRef::Head => Self::head_key(group_id),
            ChunkRef::Stored(hash) => Self::stored_key(hash),
        }
    }

    /// Loads a chunk. Missing chunks and chunks that fail to parse read as
    /// empty with no link.
    pub async fn load_chunk(
        &self,
        group_id: &GroupId,
        chunk: &ChunkRef,
    ) -> Result<ConversationChunk> {
        let key = Self::storage_key(group_id, chunk);
        match self.storage.get(&key, &self.chunks).await {
            Ok(Some(loaded)) => Ok(loaded),
            Ok(None) => Ok(ConversationChunk::empty(group_id)),
            Err(ChatSyncError::Serialization(e)) => {
                tracing::error!(
                    target: "chatsync::conversation::load_chunk",
                    "Chunk {} of group {} is corrupt, reading as empty: {}",
                    key,
                    group_id,
                    e
                );
                Ok(ConversationChunk::empty(group_id))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn head(&self, group_id: &GroupId) -> Result<ConversationChunk> {
        self.load_chunk(group_id, &ChunkRef::Head).await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        self.storage
            .get(&Self::message_key(message_id), &self.messages)
            .await
    }

    /// Appends `message` to its group's log. Returns `false` if the message
    /// id was already appended.
    pub async fn append(&self, message: &Message) -> Result<bool> {
        let _guard = self.append_lock.lock().await;

        if self.get_message(&message.message_id).await?.is_some() {
            return Ok(false);
        }

        let group_id = &message.group_id;
        let mut head = self.head(group_id).await?;
        if head.position(&message.message_id).is_some() {
            return Ok(false);
        }
        head.insert(message.message_id.clone(), message.timestamp);

        if head.len() > self.config.split_threshold {
            let chunk = head.split_off_oldest(self.config.split_size);
            let hash = content_hash(&chunk)?;
            // The older chunk must be durable before the head points at it
            self.storage
                .set(&Self::stored_key(&hash), &chunk, &self.chunks)
                .await?;
            tracing::debug!(
                target: "chatsync::conversation::append",
                "Split {} entries of group {} into chunk {}",
                chunk.len(),
                group_id,
                hash
            );
            head.next_key = Some(hash);
        }

        self.storage
            .set_single_threaded(&Self::head_key(group_id), head, &self.chunks)?;
        self.storage.set_single_threaded(
            &Self::message_key(&message.message_id),
            message.clone(),
            &self.messages,
        )?;
        Ok(true)
    }

    /// Walks the chain from the head until the chunk holding `message_id`
    /// is found. `None` if the chain ends first.
    pub async fn resolve_key_for_message_id(
        &self,
        group_id: &GroupId,
        message_id: &str,
    ) -> Result<Option<ChunkRef>> {
        let mut visited = HashSet::new();
        let mut current = ChunkRef::Head;
        loop {
            let chunk = self.load_chunk(group_id, &current).await?;
            if chunk.position(message_id).is_some() {
                return Ok(Some(current));
            }
            match chunk.next_key {
                Some(next) if visited.insert(next.clone()) => current = ChunkRef::Stored(next),
                _ => return Ok(None),
            }
        }
    }

    /// Chunk refs from newest to oldest.
    async fn chain(&self, group_id: &GroupId) -> Result<Vec<ChunkRef>> {
        let mut refs = vec![ChunkRef::Head];
        let mut visited = HashSet::new();
        let mut chunk = self.head(group_id).await?;
        while let Some(next) = chunk.next_key.take() {
            if !visited.insert(next.clone()) {
                break;
            }
            let next_ref = ChunkRef::Stored(next);
            chunk = self.load_chunk(group_id, &next_ref).await?;
            refs.push(next_ref);
        }
        Ok(refs)
    }

    pub async fn get_message_list(&self, params: &MessageListParams) -> Result<MessageListPage> {
        let direction = params.direction()?;
        if params.size == 0 {
            return Ok(MessageListPage::default());
        }
        match direction {
            Direction::Backward { until_message_id } => {
                self.read_backward(params, until_message_id.as_deref()).await
            }
            Direction::Forward { start_message_id } => {
                self.read_forward(params, &start_message_id).await
            }
        }
    }

    async fn locate(
        &self,
        params: &MessageListParams,
        message_id: &str,
    ) -> Result<Option<(ChunkRef, ConversationChunk, usize)>> {
        if let Some(key) = &params.key {
            let chunk = self.load_chunk(&params.group_id, key).await?;
            if let Some(index) = chunk.position(message_id) {
                return Ok(Some((key.clone(), chunk, index)));
            }
        }
        let Some(key) = self
            .resolve_key_for_message_id(&params.group_id, message_id)
            .await?
        else {
            return Ok(None);
        };
        let chunk = self.load_chunk(&params.group_id, &key).await?;
        Ok(chunk.position(message_id).map(|index| (key, chunk, index)))
    }

    async fn read_backward(
        &self,
        params: &MessageListParams,
        until_message_id: Option<&str>,
    ) -> Result<MessageListPage> {
        let (mut key, mut chunk, mut end) = match until_message_id {
            Some(until) => match self.locate(params, until).await? {
                Some(found) => found,
                None => {
                    return Ok(MessageListPage {
                        reached_start: true,
                        ..Default::default()
                    });
                }
            },
            None => {
                let key = params.key.clone().unwrap_or(ChunkRef::Head);
                let chunk = self.load_chunk(&params.group_id, &key).await?;
                let end = chunk.len();
                (key, chunk, end)
            }
        };

        // Slices collected newest first, reversed at the end
        let mut slices: Vec<Vec<String>> = Vec::new();
        let mut collected = 0;
        let mut earliest_key = None;
        let mut visited = HashSet::new();
        loop {
            let take = (params.size - collected).min(end);
            if take > 0 {
                slices.push(chunk.message_ids[end - take..end].to_vec());
                collected += take;
                earliest_key = Some(key.clone());
            }
            let exhausted_chunk = take == end;
            if collected == params.size && !(exhausted_chunk && chunk.next_key.is_none()) {
                break;
            }
            match chunk.next_key.take() {
                Some(next) if visited.insert(next.clone()) => {
                    key = ChunkRef::Stored(next);
                    chunk = self.load_chunk(&params.group_id, &key).await?;
                    end = chunk.len();
                }
                _ => return Ok(Self::backward_page(slices, earliest_key, true)),
            }
        }
        Ok(Self::backward_page(slices, earliest_key, false))
    }

    fn backward_page(
        slices: Vec<Vec<String>>,
        earliest_key: Option<ChunkRef>,
        reached_start: bool,
    ) -> MessageListPage {
        let message_ids: Vec<String> = slices.into_iter().rev().flatten().collect();
        MessageListPage {
            earliest_message_id: message_ids.first().cloned(),
            earliest_key: earliest_key.filter(|_| !message_ids.is_empty()),
            message_ids,
            reached_start,
        }
    }

    async fn read_forward(
        &self,
        params: &MessageListParams,
        start_message_id: &str,
    ) -> Result<MessageListPage> {
        let Some((key, chunk, index)) = self.locate(params, start_message_id).await? else {
            return Ok(MessageListPage::default());
        };

        let mut message_ids: Vec<String> = chunk
            .message_ids
            .iter()
            .skip(index + 1)
            .take(params.size)
            .cloned()
            .collect();
        let mut earliest_key = key.clone();

        if message_ids.len() < params.size && key != ChunkRef::Head {
            // Newer chunks are only reachable from the head
            let chain = self.chain(&params.group_id).await?;
            if let Some(position) = chain.iter().position(|r| *r == key) {
                for newer in chain[..position].iter().rev() {
                    let newer_chunk = self.load_chunk(&params.group_id, newer).await?;
                    let wanted = params.size - message_ids.len();
                    if message_ids.is_empty() && !newer_chunk.is_empty() {
                        earliest_key = newer.clone();
                    }
                    message_ids.extend(newer_chunk.message_ids.into_iter().take(wanted));
                    if message_ids.len() == params.size {
                        break;
                    }
                }
            }
        }

        // The start message itself is older than anything returned here
        Ok(MessageListPage {
            earliest_message_id: message_ids.first().cloned(),
            earliest_key: (!message_ids.is_empty()).then_some(earliest_key),
            message_ids,
            reached_start: false,
        })
    }

    /// Appends messages waiting in the inbox, retrying earlier failures first.
    pub async fn drain_inbox(&self) -> usize {
        let mut batch: Vec<Message> = self.retry.lock().drain(..).collect();
        let room = self.config.drain_limit.saturating_sub(batch.len());
        batch.extend(self.inbox.lock().drain(room));

        let mut processed = 0;
        let mut failed = Vec::new();
        for message in batch {
            match self.append(&message).await {
                Ok(true) => {
                    processed += 1;
                    self.notifications.emit(Notification::GroupDataUpdated {
                        group_id: message.group_id.clone(),
                        message,
                    });
                }
                Ok(false) => processed += 1,
                Err(e) => {
                    tracing::warn!(
                        target: "chatsync::conversation::drain_inbox",
                        "Append of {} to group {} failed, retrying next tick: {}",
                        message.message_id,
                        message.group_id,
                        e
                    );
                    failed.push(message);
                }
            }
        }
        self.retry.lock().extend(failed);
        processed
    }

    pub fn clear_caches(&self) {
        self.chunks.clear();
        self.messages.clear();
    }
}

#[async_trait]
impl ThreadHandler for ConversationDomain {
    fn name(&self) -> &'static str {
        "conversation"
    }

    async fn poll(&self) -> Result<bool> {
        Ok(self.drain_inbox().await == 0)
    }

    async fn on_stop(&self) -> Result<()> {
        self.storage.flush_deferred().await
    }
}
