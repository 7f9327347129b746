//! Ingestion engine.
//!
//! Merges the cursor-paginated pull feed and the realtime push feed into one
//! deduplicated stream per session. Message references are queued as
//! [`PendingMessageRecord`]s and resolved in batches into [`Message`]s, which
//! are forwarded to the conversation log. Control events go to the group
//! member domain or straight to subscribers.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::chatsync::channel::{ChannelReceiver, ChannelSender, channel};
use crate::chatsync::error::{ChatSyncError, Result};
use crate::chatsync::notifications::{Notification, Notifications};
use crate::chatsync::storage::CombinedStorage;
use crate::chatsync::thread::{ThreadHandler, ThreadWaker};
use crate::chatsync::types::{Address, Anchor, Message, OutputId, PendingMessageRecord, RawItem};
use crate::chatsync::upstream::{MessageResolver, MuteFilter, UpstreamSource};

pub const ANCHOR_KEY: &str = "event_source.anchor";
pub const PENDING_KEY: &str = "event_source.pending";

#[derive(Debug, Clone)]
pub struct EventSourceConfig {
    /// Minimum quiet time after an empty page before pulling again
    pub empty_page_cooldown: Duration,
    /// Minimum time between throttled pending-list flushes
    pub flush_interval: Duration,
    /// Pending references handed to the resolver per tick
    pub resolve_batch_size: usize,
    /// Pushed items ingested per tick
    pub push_drain_limit: usize,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            empty_page_cooldown: Duration::from_secs(4),
            flush_interval: Duration::from_secs(3),
            resolve_batch_size: 20,
            push_drain_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Catching up through the pull feed only
    Pull,
    /// Caught up; realtime items arrive through the push subscription
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SyncDisabled,
    Cooldown,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpOutcome {
    Skipped(SkipReason),
    /// The page was empty; the anchor did not move
    Empty,
    /// A non-empty page was ingested
    Progress { items: usize, new_items: usize },
    /// The fetch failed; nothing changed
    Failed,
}

/// Process-lifetime set of content-hash ids already delivered.
#[derive(Debug, Default)]
pub struct SeenEventIds {
    ids: parking_lot::Mutex<HashSet<String>>,
}

impl SeenEventIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id`, returning `false` if it was already present.
    pub fn insert(&self, id: impl Into<String>) -> bool {
        self.ids.lock().insert(id.into())
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.ids.lock().clear();
    }
}

/// Where the event source hands off what it ingests.
pub struct EventSourceSinks {
    pub messages: ChannelSender<Message>,
    pub membership_events: ChannelSender<RawItem>,
    pub notifications: Arc<Notifications>,
}

struct EventSourceState {
    anchor: Option<Anchor>,
    pending: Vec<PendingMessageRecord>,
    last_empty_page_at: Option<Instant>,
    mode: SyncMode,
    dirty: bool,
    last_flush_at: Option<Instant>,
}

/// Clears the in-flight flag however the catch-up ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct EventSourceDomain {
    address: Address,
    config: EventSourceConfig,
    storage: Arc<CombinedStorage>,
    upstream: Arc<dyn UpstreamSource>,
    resolver: Arc<dyn MessageResolver>,
    mute_filter: Option<Arc<dyn MuteFilter>>,
    sinks: EventSourceSinks,
    seen: SeenEventIds,
    allow_sync: AtomicBool,
    has_wallet: AtomicBool,
    catching_up: AtomicBool,
    state: Mutex<EventSourceState>,
    push_sender: ChannelSender<RawItem>,
    push_receiver: parking_lot::Mutex<ChannelReceiver<RawItem>>,
}

impl EventSourceDomain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address: Address,
        config: EventSourceConfig,
        storage: Arc<CombinedStorage>,
        upstream: Arc<dyn UpstreamSource>,
        resolver: Arc<dyn MessageResolver>,
        mute_filter: Option<Arc<dyn MuteFilter>>,
        sinks: EventSourceSinks,
        waker: ThreadWaker,
    ) -> Self {
        let (push_sender, push_receiver) = channel();
        Self {
            address,
            config,
            storage,
            upstream,
            resolver,
            mute_filter,
            sinks,
            seen: SeenEventIds::new(),
            allow_sync: AtomicBool::new(true),
            has_wallet: AtomicBool::new(false),
            catching_up: AtomicBool::new(false),
            state: Mutex::new(EventSourceState {
                anchor: None,
                pending: Vec::new(),
                last_empty_page_at: None,
                mode: SyncMode::Pull,
                dirty: false,
                last_flush_at: None,
            }),
            push_sender: push_sender.with_waker(waker),
            push_receiver: parking_lot::Mutex::new(push_receiver),
        }
    }

    /// Restores the persisted anchor and pending list.
    pub async fn bootstrap(&self) -> Result<()> {
        let anchor = self.load_or_reset::<Anchor>(ANCHOR_KEY).await?;
        let pending = self
            .load_or_reset::<Vec<PendingMessageRecord>>(PENDING_KEY)
            .await?
            .unwrap_or_default();

        let mut state = self.state.lock().await;
        state.anchor = anchor;
        state.pending = pending;
        dedupe_pending(&mut state.pending);
        for record in &state.pending {
            self.seen.insert(output_seen_key(&record.output_id));
        }

        tracing::debug!(
            target: "chatsync::event_source::bootstrap",
            "Event source for {} restored anchor={:?}, {} pending",
            self.address,
            state.anchor,
            state.pending.len()
        );
        Ok(())
    }

    async fn load_or_reset<V: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.storage.get_uncached::<V>(key).await {
            Ok(value) => Ok(value),
            Err(ChatSyncError::Serialization(e)) => {
                tracing::warn!(
                    target: "chatsync::event_source::bootstrap",
                    "Discarding unreadable {} for {}: {}",
                    key,
                    self.address,
                    e
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Sender the host's realtime callback pushes into.
    pub fn push_sender(&self) -> ChannelSender<RawItem> {
        self.push_sender.clone()
    }

    pub fn set_allow_sync(&self, allow: bool) {
        self.allow_sync.store(allow, Ordering::SeqCst);
    }

    /// Mute filtering only applies while a wallet session exists.
    pub fn set_has_wallet(&self, has_wallet: bool) {
        self.has_wallet.store(has_wallet, Ordering::SeqCst);
    }

    pub async fn anchor(&self) -> Option<Anchor> {
        self.state.lock().await.anchor.clone()
    }

    pub async fn mode(&self) -> SyncMode {
        self.state.lock().await.mode
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn pending(&self) -> Vec<PendingMessageRecord> {
        self.state.lock().await.pending.clone()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Pulls the next page if sync is allowed, the empty-page cooldown has
    /// passed and no other catch-up is running.
    pub async fn catch_up_from_api(&self) -> CatchUpOutcome {
        if !self.allow_sync.load(Ordering::SeqCst) {
            return CatchUpOutcome::Skipped(SkipReason::SyncDisabled);
        }
        {
            let state = self.state.lock().await;
            if let Some(at) = state.last_empty_page_at {
                if at.elapsed() <= self.config.empty_page_cooldown {
                    return CatchUpOutcome::Skipped(SkipReason::Cooldown);
                }
            }
        }
        if self
            .catching_up
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return CatchUpOutcome::Skipped(SkipReason::InFlight);
        }
        let _guard = InFlightGuard(&self.catching_up);

        let anchor = self.state.lock().await.anchor.clone();
        let page = match self.upstream.fetch(anchor.as_ref()).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(
                    target: "chatsync::event_source::catch_up_from_api",
                    "Fetch after {:?} failed for {}: {}",
                    anchor,
                    self.address,
                    e
                );
                return CatchUpOutcome::Failed;
            }
        };

        let mut state = self.state.lock().await;
        if page.items.is_empty() {
            let was_idle = state.last_empty_page_at.is_some();
            state.last_empty_page_at = Some(Instant::now());
            let enter_push = was_idle && state.mode == SyncMode::Pull;
            drop(state);
            if enter_push {
                self.enter_push_mode().await;
            }
            return CatchUpOutcome::Empty;
        }

        state.last_empty_page_at = None;
        let items = page.items.len();
        let new_items = self.ingest_items(&mut state, page.items);
        let next_anchor = page.next_cursor.or_else(|| state.anchor.clone());

        // Pending list and anchor land together before the anchor moves in memory
        let persisted = match self.storage.set_uncached(PENDING_KEY, &state.pending).await {
            Ok(()) => match &next_anchor {
                Some(next) => self.storage.set_uncached(ANCHOR_KEY, next).await,
                None => Ok(()),
            },
            Err(e) => Err(e),
        };
        match persisted {
            Ok(()) => {
                state.anchor = next_anchor;
                state.dirty = false;
                state.last_flush_at = Some(Instant::now());
            }
            Err(e) => {
                tracing::warn!(
                    target: "chatsync::event_source::catch_up_from_api",
                    "Could not persist progress for {}, anchor stays at {:?}: {}",
                    self.address,
                    state.anchor,
                    e
                );
            }
        }

        tracing::debug!(
            target: "chatsync::event_source::catch_up_from_api",
            "Ingested page of {} items ({} new) for {}",
            items,
            new_items,
            self.address
        );
        CatchUpOutcome::Progress { items, new_items }
    }

    async fn enter_push_mode(&self) {
        match self.upstream.subscribe(self.push_sender.clone()).await {
            Ok(()) => {
                self.state.lock().await.mode = SyncMode::Push;
                tracing::info!(
                    target: "chatsync::event_source::enter_push_mode",
                    "Caught up, listening for pushed items for {}",
                    self.address
                );
            }
            Err(e) => {
                tracing::warn!(
                    target: "chatsync::event_source::enter_push_mode",
                    "Push subscription failed for {}: {}",
                    self.address,
                    e
                );
            }
        }
    }

    /// Dedups and routes items. Returns how many were new.
    fn ingest_items(&self, state: &mut EventSourceState, items: Vec<RawItem>) -> usize {
        let mut new_items = 0;
        for item in items {
            let content_id = match item.content_id() {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(
                        target: "chatsync::event_source::ingest_items",
                        "Dropping item that cannot be hashed: {}",
                        e
                    );
                    continue;
                }
            };
            if !self.seen.insert(content_id) {
                continue;
            }

            match item {
                RawItem::NewMessageRef {
                    output_id,
                    group_id,
                    payload,
                } => {
                    if !self.seen.insert(output_seen_key(&output_id)) {
                        continue;
                    }
                    state.pending.push(PendingMessageRecord {
                        output_id,
                        group_id,
                        raw_payload: payload,
                    });
                    dedupe_pending(&mut state.pending);
                    state.dirty = true;
                }
                item if item.is_membership_event() => {
                    self.sinks.membership_events.push(item);
                }
                item => {
                    self.sinks
                        .notifications
                        .emit(Notification::ControlEvent { item });
                }
            }
            new_items += 1;
        }
        new_items
    }

    /// Ingests pushed items waiting in the push channel.
    pub async fn drain_pushed(&self) -> usize {
        let pushed = self.push_receiver.lock().drain(self.config.push_drain_limit);
        if pushed.is_empty() {
            return 0;
        }
        let mut state = self.state.lock().await;
        self.ingest_items(&mut state, pushed)
    }

    /// Resolves one batch of pending references. Returns how many left the queue.
    pub async fn resolve_pending(&self) -> usize {
        let batch: Vec<PendingMessageRecord> = {
            let state = self.state.lock().await;
            state
                .pending
                .iter()
                .take(self.config.resolve_batch_size)
                .cloned()
                .collect()
        };
        if batch.is_empty() {
            return 0;
        }

        let output_ids: Vec<OutputId> = batch.iter().map(|r| r.output_id.clone()).collect();
        let mut resolved: Vec<(OutputId, Message)> = Vec::new();
        let outcome = self
            .resolver
            .batch_resolve(&output_ids, &mut |output_id: OutputId, message: Message| {
                resolved.push((output_id, message))
            })
            .await;

        match &outcome {
            Ok(outcome) if !outcome.failed_ids.is_empty() => {
                tracing::debug!(
                    target: "chatsync::event_source::resolve_pending",
                    "{} references unresolved, keeping them queued",
                    outcome.failed_ids.len()
                );
            }
            Err(e) => {
                tracing::warn!(
                    target: "chatsync::event_source::resolve_pending",
                    "Batch resolve failed for {} ({} resolved before failure): {}",
                    self.address,
                    resolved.len(),
                    e
                );
            }
            _ => {}
        }
        if resolved.is_empty() {
            return 0;
        }

        let requested: HashSet<&OutputId> = output_ids.iter().collect();
        let mut done: HashSet<OutputId> = HashSet::new();
        for (output_id, message) in resolved {
            if !requested.contains(&output_id) || !done.insert(output_id) {
                continue;
            }
            if self.is_filtered(&message).await {
                tracing::debug!(
                    target: "chatsync::event_source::resolve_pending",
                    "Dropping message {} from muted sender",
                    message.message_id
                );
                continue;
            }
            self.sinks.messages.push(message);
        }

        let mut state = self.state.lock().await;
        state.pending.retain(|r| !done.contains(&r.output_id));
        dedupe_pending(&mut state.pending);
        state.dirty = true;
        done.len()
    }

    async fn is_filtered(&self, message: &Message) -> bool {
        if !self.has_wallet.load(Ordering::SeqCst) {
            return false;
        }
        let Some(filter) = &self.mute_filter else {
            return false;
        };
        match filter.is_muted(&message.group_id, &message.sender).await {
            Ok(muted) => muted,
            Err(e) => {
                tracing::warn!(
                    target: "chatsync::event_source::is_filtered",
                    "Mute check failed for {}, delivering: {}",
                    message.message_id,
                    e
                );
                false
            }
        }
    }

    /// Persists the pending list when dirty and a flush is due: the queue just
    /// drained, `force` is set, or the flush interval has passed.
    pub async fn flush(&self, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(());
        }
        let due = force
            || state.pending.is_empty()
            || state
                .last_flush_at
                .is_none_or(|at| at.elapsed() >= self.config.flush_interval);
        if !due {
            return Ok(());
        }
        self.storage.set_uncached(PENDING_KEY, &state.pending).await?;
        state.dirty = false;
        state.last_flush_at = Some(Instant::now());
        Ok(())
    }

    /// Drops every pending reference and persists the empty list.
    pub async fn clear_pending(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pending.clear();
        self.storage.set_uncached(PENDING_KEY, &state.pending).await?;
        state.dirty = false;
        state.last_flush_at = Some(Instant::now());
        Ok(())
    }

    /// Releases the push subscription and forgets delivered ids.
    pub async fn destroy(&self) {
        let was_push = {
            let mut state = self.state.lock().await;
            let was_push = state.mode == SyncMode::Push;
            state.mode = SyncMode::Pull;
            was_push
        };
        if was_push {
            if let Err(e) = self.upstream.unsubscribe().await {
                tracing::warn!(
                    target: "chatsync::event_source::destroy",
                    "Unsubscribe failed for {}: {}",
                    self.address,
                    e
                );
            }
        }
        self.seen.clear();
    }
}

#[async_trait]
impl ThreadHandler for EventSourceDomain {
    fn name(&self) -> &'static str {
        "event_source"
    }

    async fn poll(&self) -> Result<bool> {
        let mut did_work = self.drain_pushed().await > 0;

        if let CatchUpOutcome::Progress { .. } = self.catch_up_from_api().await {
            did_work = true;
        }

        if self.resolve_pending().await > 0 {
            did_work = true;
        }

        if let Err(e) = self.flush(false).await {
            tracing::warn!(
                target: "chatsync::event_source::poll",
                "Pending flush failed for {}: {}",
                self.address,
                e
            );
        }

        Ok(!did_work)
    }

    async fn on_stop(&self) -> Result<()> {
        self.flush(true).await
    }
}

fn output_seen_key(output_id: &OutputId) -> String {
    format!("output:{output_id}")
}

/// Keeps the first record per output id, preserving queue order.
fn dedupe_pending(pending: &mut Vec<PendingMessageRecord>) {
    let mut seen = HashSet::new();
    pending.retain(|record| seen.insert(record.output_id.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatsync::notifications::Scope;
    use crate::chatsync::storage::{MemoryStorage, StorageAdapter};
    use crate::chatsync::test_utils::*;
    use crate::chatsync::types::GroupId;

    struct Fixture {
        domain: Arc<EventSourceDomain>,
        storage: Arc<MemoryStorage>,
        upstream: Arc<ScriptedUpstream>,
        resolver: Arc<ScriptedResolver>,
        messages: ChannelReceiver<Message>,
        membership: ChannelReceiver<RawItem>,
        notifications: Arc<Notifications>,
    }

    fn fixture_with(mute_filter: Option<Arc<dyn MuteFilter>>) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let combined = Arc::new(CombinedStorage::new(storage.clone(), "0xme"));
        let upstream = ScriptedUpstream::new();
        let resolver = ScriptedResolver::new();
        let (message_tx, messages) = channel();
        let (membership_tx, membership) = channel();
        let notifications = Arc::new(Notifications::new());
        let domain = Arc::new(EventSourceDomain::new(
            Address::from("0xme"),
            EventSourceConfig::default(),
            combined,
            upstream.clone(),
            resolver.clone(),
            mute_filter,
            EventSourceSinks {
                messages: message_tx,
                membership_events: membership_tx,
                notifications: notifications.clone(),
            },
            ThreadWaker::new(),
        ));
        Fixture {
            domain,
            storage,
            upstream,
            resolver,
            messages,
            membership,
            notifications,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_is_split_into_pending_and_control_events() {
        let mut f = fixture();
        let mut global = f.notifications.subscribe(Scope::Global);
        let like = RawItem::LikeChanged {
            group_id: GroupId::from("g1"),
            address: Address::from("0xfriend"),
            is_liked: true,
        };
        f.upstream.push_page(
            vec![
                message_ref("o1", "g1"),
                member_changed("g1", "0xnew"),
                like.clone(),
                message_ref("o2", "g2"),
            ],
            Some("c1"),
        );

        let outcome = f.domain.catch_up_from_api().await;

        assert_eq!(outcome, CatchUpOutcome::Progress { items: 4, new_items: 4 });
        let pending = f.domain.pending().await;
        assert_eq!(
            pending.iter().map(|r| r.output_id.as_str()).collect::<Vec<_>>(),
            vec!["o1", "o2"]
        );
        assert_eq!(f.membership.drain(10), vec![member_changed("g1", "0xnew")]);
        assert_eq!(global.try_recv(), Some(Notification::ControlEvent { item: like }));
        assert!(f.messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_anchor_advances_and_persists_only_on_non_empty_page() {
        let f = fixture();
        f.upstream.push_page(vec![message_ref("o1", "g1")], Some("c1"));

        f.domain.catch_up_from_api().await;
        assert_eq!(f.domain.anchor().await, Some(Anchor("c1".to_string())));
        assert_eq!(
            f.storage.get("0xme.event_source.anchor").await.unwrap().as_deref(),
            Some("\"c1\"")
        );
        let persisted = f.storage.get("0xme.event_source.pending").await.unwrap().unwrap();
        assert!(persisted.contains("o1"));

        assert_eq!(f.domain.catch_up_from_api().await, CatchUpOutcome::Empty);
        assert_eq!(f.domain.anchor().await, Some(Anchor("c1".to_string())));
        assert_eq!(
            *f.upstream.cursors_seen.lock(),
            vec![None, Some(Anchor("c1".to_string()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_is_no_progress() {
        let f = fixture();
        f.upstream.push_page(vec![message_ref("o1", "g1")], Some("c1"));
        f.domain.catch_up_from_api().await;

        f.upstream.push_error();
        assert_eq!(f.domain.catch_up_from_api().await, CatchUpOutcome::Failed);
        assert_eq!(f.domain.anchor().await, Some(Anchor("c1".to_string())));
        assert_eq!(f.domain.pending_count().await, 1);
        // A failure does not start the empty-page cooldown
        f.upstream.push_page(vec![message_ref("o2", "g1")], Some("c2"));
        assert!(matches!(
            f.domain.catch_up_from_api().await,
            CatchUpOutcome::Progress { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pages_throttle_then_enter_push_mode() {
        let f = fixture();

        assert_eq!(f.domain.catch_up_from_api().await, CatchUpOutcome::Empty);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            f.domain.catch_up_from_api().await,
            CatchUpOutcome::Skipped(SkipReason::Cooldown)
        );
        assert_eq!(f.upstream.fetch_count(), 1);
        assert_eq!(f.domain.mode().await, SyncMode::Pull);

        tokio::time::advance(Duration::from_millis(2_100)).await;
        assert_eq!(f.domain.catch_up_from_api().await, CatchUpOutcome::Empty);
        assert_eq!(f.upstream.fetch_count(), 2);
        assert_eq!(f.domain.mode().await, SyncMode::Push);
        assert!(f.upstream.is_subscribed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_disabled_skips_fetch() {
        let f = fixture();
        f.domain.set_allow_sync(false);
        assert_eq!(
            f.domain.catch_up_from_api().await,
            CatchUpOutcome::Skipped(SkipReason::SyncDisabled)
        );
        assert_eq!(f.upstream.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_catch_up_is_rejected() {
        let f = fixture();
        *f.upstream.fetch_delay.lock() = Some(Duration::from_secs(1));
        f.upstream.push_page(vec![message_ref("o1", "g1")], Some("c1"));

        let (first, second) = tokio::join!(
            f.domain.catch_up_from_api(),
            f.domain.catch_up_from_api()
        );

        assert!(matches!(first, CatchUpOutcome::Progress { .. }));
        assert_eq!(second, CatchUpOutcome::Skipped(SkipReason::InFlight));
        assert_eq!(f.upstream.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_event_via_pull_and_push_has_one_effect() {
        let mut f = fixture();
        let event = member_changed("g1", "0xnew");
        f.upstream.push_page(vec![event.clone()], Some("c1"));
        f.domain.catch_up_from_api().await;

        f.domain.push_sender().push(event.clone());
        assert_eq!(f.domain.drain_pushed().await, 0);

        assert_eq!(f.membership.drain(10), vec![event]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_output_id_is_queued_once() {
        let f = fixture();
        let mut second = message_ref("o1", "g1");
        if let RawItem::NewMessageRef { payload, .. } = &mut second {
            *payload = serde_json::json!({ "retransmit": true });
        }
        f.upstream
            .push_page(vec![message_ref("o1", "g1"), second], Some("c1"));

        f.domain.catch_up_from_api().await;

        assert_eq!(f.domain.pending_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_forwards_messages_and_keeps_failures() {
        let mut f = fixture();
        f.resolver.add("o1", test_message("m1", "g1", "0xa", 10));
        f.upstream
            .push_page(vec![message_ref("o1", "g1"), message_ref("o2", "g1")], Some("c1"));
        f.domain.catch_up_from_api().await;

        assert_eq!(f.domain.resolve_pending().await, 1);

        let delivered = f.messages.drain(10);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message_id, "m1");
        let pending = f.domain.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].output_id, OutputId::from("o2"));

        // o2 resolves on a later tick
        f.resolver.add("o2", test_message("m2", "g1", "0xa", 11));
        assert_eq!(f.domain.resolve_pending().await, 1);
        assert_eq!(f.domain.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolver_error_leaves_queue_intact() {
        let mut f = fixture();
        f.resolver.add("o1", test_message("m1", "g1", "0xa", 10));
        f.upstream.push_page(vec![message_ref("o1", "g1")], Some("c1"));
        f.domain.catch_up_from_api().await;

        f.resolver
            .fail_next_call
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(f.domain.resolve_pending().await, 0);
        assert_eq!(f.domain.pending_count().await, 1);
        assert!(f.messages.is_empty());

        assert_eq!(f.domain.resolve_pending().await, 1);
        assert_eq!(f.messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_filter_applies_only_with_wallet() {
        let mut f = fixture_with(Some(StaticMuteFilter::muting(&["0xspam"])));
        f.resolver.add("o1", test_message("m1", "g1", "0xspam", 10));
        f.resolver.add("o2", test_message("m2", "g1", "0xspam", 11));

        f.domain.push_sender().push(message_ref("o1", "g1"));
        f.domain.drain_pushed().await;
        f.domain.resolve_pending().await;
        assert_eq!(f.messages.drain(10).len(), 1);

        f.domain.set_has_wallet(true);
        f.domain.push_sender().push(message_ref("o2", "g1"));
        f.domain.drain_pushed().await;
        assert_eq!(f.domain.resolve_pending().await, 1);
        assert!(f.messages.is_empty());
        assert_eq!(f.domain.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_flush_is_throttled() {
        let f = fixture();
        let key = "0xme.event_source.pending";

        f.domain.push_sender().push(message_ref("o1", "g1"));
        f.domain.drain_pushed().await;
        f.domain.flush(false).await.unwrap();
        assert!(f.storage.get(key).await.unwrap().unwrap().contains("o1"));

        f.domain.push_sender().push(message_ref("o2", "g1"));
        f.domain.drain_pushed().await;
        f.domain.flush(false).await.unwrap();
        assert!(!f.storage.get(key).await.unwrap().unwrap().contains("o2"));

        tokio::time::advance(Duration::from_secs(3)).await;
        f.domain.flush(false).await.unwrap();
        assert!(f.storage.get(key).await.unwrap().unwrap().contains("o2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_drain_flushes_immediately() {
        let f = fixture();
        f.resolver.add("o1", test_message("m1", "g1", "0xa", 10));
        f.domain.push_sender().push(message_ref("o1", "g1"));
        f.domain.drain_pushed().await;
        f.domain.flush(false).await.unwrap();

        f.domain.resolve_pending().await;
        f.domain.flush(false).await.unwrap();

        assert_eq!(
            f.storage.get("0xme.event_source.pending").await.unwrap().as_deref(),
            Some("[]")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_restores_persisted_state() {
        let f = fixture();
        f.upstream
            .push_page(vec![message_ref("o1", "g1"), message_ref("o2", "g1")], Some("c9"));
        f.domain.catch_up_from_api().await;

        let combined = Arc::new(CombinedStorage::new(f.storage.clone(), "0xme"));
        let (message_tx, _messages) = channel();
        let (membership_tx, _membership) = channel();
        let restored = EventSourceDomain::new(
            Address::from("0xme"),
            EventSourceConfig::default(),
            combined,
            f.upstream.clone(),
            f.resolver.clone(),
            None,
            EventSourceSinks {
                messages: message_tx,
                membership_events: membership_tx,
                notifications: Arc::new(Notifications::new()),
            },
            ThreadWaker::new(),
        );
        restored.bootstrap().await.unwrap();

        assert_eq!(restored.anchor().await, Some(Anchor("c9".to_string())));
        assert_eq!(restored.pending_count().await, 2);
        // Restored references are not queued twice when the page is redelivered
        restored.push_sender().push(message_ref("o1", "g1"));
        restored.drain_pushed().await;
        assert_eq!(restored.pending_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_discards_corrupt_state() {
        let f = fixture();
        f.storage
            .set("0xme.event_source.pending", "{ not json")
            .await
            .unwrap();

        f.domain.bootstrap().await.unwrap();
        assert_eq!(f.domain.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_pending_persists_empty_list() {
        let f = fixture();
        f.domain.push_sender().push(message_ref("o1", "g1"));
        f.domain.drain_pushed().await;

        f.domain.clear_pending().await.unwrap();

        assert_eq!(f.domain.pending_count().await, 0);
        assert_eq!(
            f.storage.get("0xme.event_source.pending").await.unwrap().as_deref(),
            Some("[]")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_reports_work_then_idle() {
        let mut f = fixture();
        f.resolver.add("o1", test_message("m1", "g1", "0xa", 10));
        f.upstream.push_page(vec![message_ref("o1", "g1")], Some("c1"));

        assert!(!f.domain.poll().await.unwrap());
        assert_eq!(f.messages.len(), 1);

        // Empty page, nothing pending
        assert!(f.domain.poll().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_unsubscribes_and_forgets_seen_ids() {
        let f = fixture();
        f.domain.catch_up_from_api().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        f.domain.catch_up_from_api().await;
        assert_eq!(f.domain.mode().await, SyncMode::Push);
        f.domain.push_sender().push(member_changed("g1", "0xa"));
        f.domain.drain_pushed().await;
        assert_eq!(f.domain.seen_count(), 1);

        f.domain.destroy().await;

        assert!(f.upstream.unsubscribed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(f.domain.seen_count(), 0);
    }
}
