//! Group membership and ordering watermarks.
//!
//! Membership is fetched wholesale from the group data service, at most a
//! few groups per tick, and cached per group. Min/max tokens are unsigned
//! hex watermarks that only widen; merged values are written back lazily.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;

use crate::chatsync::channel::ChannelReceiver;
use crate::chatsync::error::Result;
use crate::chatsync::event_source::SeenEventIds;
use crate::chatsync::notifications::{Notification, Notifications};
use crate::chatsync::storage::{CombinedStorage, LruCache};
use crate::chatsync::thread::{ThreadHandler, ThreadWaker};
use crate::chatsync::types::{Address, GroupId, GroupMembership, GroupMinMaxToken, RawItem};
use crate::chatsync::upstream::GroupDataSource;

#[derive(Debug, Clone)]
pub struct GroupMemberConfig {
    pub cache_capacity: usize,
    /// Membership refetches issued per tick
    pub refreshes_per_tick: usize,
    /// Control events consumed per tick
    pub drain_limit: usize,
}

impl Default for GroupMemberConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 100,
            refreshes_per_tick: 2,
            drain_limit: 200,
        }
    }
}

/// Canonical form of an unsigned hex token: no `0x` prefix, no leading
/// zeros, lowercase. `None` if `value` is not hex.
pub fn normalize_hex(value: &str) -> Option<String> {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let significant = digits.trim_start_matches('0');
    Some(if significant.is_empty() {
        "0".to_string()
    } else {
        significant.to_ascii_lowercase()
    })
}

/// Compares two hex tokens as unsigned integers of any width.
pub fn compare_hex(a: &str, b: &str) -> Option<Ordering> {
    let a = normalize_hex(a)?;
    let b = normalize_hex(b)?;
    Some(a.len().cmp(&b.len()).then_with(|| a.cmp(&b)))
}

/// Folds an incoming token update into the watermark. Returns whether anything moved.
fn merge_token(current: &mut GroupMinMaxToken, min: Option<&str>, max: Option<&str>) -> bool {
    let mut changed = false;
    if let Some(incoming) = min.filter(|v| normalize_hex(v).is_some()) {
        let lower = match &current.min {
            Some(existing) => compare_hex(incoming, existing) == Some(Ordering::Less),
            None => true,
        };
        if lower {
            current.min = Some(incoming.to_string());
            changed = true;
        }
    }
    if let Some(incoming) = max.filter(|v| normalize_hex(v).is_some()) {
        let higher = match &current.max {
            Some(existing) => compare_hex(incoming, existing) == Some(Ordering::Greater),
            None => true,
        };
        if higher {
            current.max = Some(incoming.to_string());
            changed = true;
        }
    }
    changed
}

#[derive(Default)]
struct RefreshQueue {
    order: VecDeque<GroupId>,
    /// Queued or in flight
    pending: HashSet<GroupId>,
}

/// Per-group membership and ordering-token watermark cache.
pub struct GroupMemberDomain {
    address: Address,
    config: GroupMemberConfig,
    storage: Arc<CombinedStorage>,
    group_data: Arc<dyn GroupDataSource>,
    inbox: parking_lot::Mutex<ChannelReceiver<RawItem>>,
    seen: SeenEventIds,
    memberships: LruCache<GroupMembership>,
    tokens: LruCache<GroupMinMaxToken>,
    dirty_tokens: parking_lot::Mutex<HashMap<GroupId, GroupMinMaxToken>>,
    refresh_queue: parking_lot::Mutex<RefreshQueue>,
    waker: ThreadWaker,
    notifications: Arc<Notifications>,
}

impl GroupMemberDomain {
    pub fn new(
        address: Address,
        config: GroupMemberConfig,
        storage: Arc<CombinedStorage>,
        group_data: Arc<dyn GroupDataSource>,
        inbox: ChannelReceiver<RawItem>,
        notifications: Arc<Notifications>,
        waker: ThreadWaker,
    ) -> Self {
        Self {
            address,
            memberships: LruCache::new("group_memberships", config.cache_capacity),
            tokens: LruCache::new("group_tokens", config.cache_capacity),
            config,
            storage,
            group_data,
            inbox: parking_lot::Mutex::new(inbox),
            seen: SeenEventIds::new(),
            dirty_tokens: parking_lot::Mutex::new(HashMap::new()),
            refresh_queue: parking_lot::Mutex::new(RefreshQueue::default()),
            waker,
            notifications,
        }
    }

    fn members_key(group_id: &GroupId) -> String {
        format!("group_member.{group_id}.members")
    }

    fn token_key(group_id: &GroupId) -> String {
        format!("group_member.{group_id}.token")
    }

    pub async fn get_group_members(&self, group_id: &GroupId) -> Result<Option<GroupMembership>> {
        self.storage
            .get(&Self::members_key(group_id), &self.memberships)
            .await
    }

    pub async fn get_min_max_token(&self, group_id: &GroupId) -> Result<Option<GroupMinMaxToken>> {
        let dirty = self.dirty_tokens.lock().get(group_id).cloned();
        if dirty.is_some() {
            return Ok(dirty);
        }
        self.storage
            .get(&Self::token_key(group_id), &self.tokens)
            .await
    }

    /// Queues a membership refetch. Returns `false` if one is already queued
    /// or in flight for the group.
    pub fn refresh_group_members(&self, group_id: &GroupId) -> bool {
        let queued = {
            let mut queue = self.refresh_queue.lock();
            if queue.pending.insert(group_id.clone()) {
                queue.order.push_back(group_id.clone());
                true
            } else {
                false
            }
        };
        if queued {
            self.waker.wake();
        } else {
            tracing::debug!(
                target: "chatsync::group_member::refresh_group_members",
                "Refresh for group {} already pending, dropping",
                group_id
            );
        }
        queued
    }

    pub fn pending_refreshes(&self) -> usize {
        self.refresh_queue.lock().order.len()
    }

    async fn apply_token_update(
        &self,
        group_id: &GroupId,
        min: Option<&str>,
        max: Option<&str>,
    ) -> Result<bool> {
        let mut token = self
            .get_min_max_token(group_id)
            .await?
            .unwrap_or_else(|| GroupMinMaxToken {
                group_id: group_id.clone(),
                min: None,
                max: None,
            });
        if !merge_token(&mut token, min, max) {
            return Ok(false);
        }
        self.tokens.put(Self::token_key(group_id), token.clone());
        self.dirty_tokens.lock().insert(group_id.clone(), token);
        Ok(true)
    }

    /// Consumes control events. Returns how many were new.
    pub async fn drain_inbox(&self) -> usize {
        let items = self.inbox.lock().drain(self.config.drain_limit);
        let mut handled = 0;
        for item in items {
            let content_id = match item.content_id() {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(
                        target: "chatsync::group_member::drain_inbox",
                        "Dropping control event that cannot be hashed: {}",
                        e
                    );
                    continue;
                }
            };
            if !self.seen.insert(content_id) {
                continue;
            }
            handled += 1;
            match item {
                RawItem::MemberChanged { group_id, .. } => {
                    self.refresh_group_members(&group_id);
                }
                RawItem::MinMaxTokenUpdate { group_id, min, max } => {
                    if let Err(e) = self
                        .apply_token_update(&group_id, min.as_deref(), max.as_deref())
                        .await
                    {
                        tracing::warn!(
                            target: "chatsync::group_member::drain_inbox",
                            "Token update for group {} failed: {}",
                            group_id,
                            e
                        );
                    }
                }
                other => {
                    tracing::debug!(
                        target: "chatsync::group_member::drain_inbox",
                        "Ignoring control event {:?}",
                        other
                    );
                }
            }
        }
        handled
    }

    /// Runs up to `refreshes_per_tick` queued refetches. Failed groups go to
    /// the back of the queue.
    pub async fn process_refreshes(&self) -> usize {
        let batch: Vec<GroupId> = {
            let mut queue = self.refresh_queue.lock();
            let count = self.config.refreshes_per_tick.min(queue.order.len());
            queue.order.drain(..count).collect()
        };

        let mut refreshed = 0;
        for group_id in batch {
            match self.refresh_now(&group_id).await {
                Ok(()) => {
                    self.refresh_queue.lock().pending.remove(&group_id);
                    refreshed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "chatsync::group_member::process_refreshes",
                        "Membership refresh for group {} failed, requeueing: {}",
                        group_id,
                        e
                    );
                    self.refresh_queue.lock().order.push_back(group_id);
                }
            }
        }
        refreshed
    }

    async fn refresh_now(&self, group_id: &GroupId) -> Result<()> {
        let members = self.group_data.fetch_group_members(group_id).await?;
        let membership = GroupMembership {
            group_id: group_id.clone(),
            members,
        };
        self.storage
            .set(&Self::members_key(group_id), &membership, &self.memberships)
            .await?;
        tracing::debug!(
            target: "chatsync::group_member::refresh_now",
            "Group {} of {} now has {} members",
            group_id,
            self.address,
            membership.members.len()
        );
        self.notifications.emit(Notification::MembershipChanged {
            group_id: group_id.clone(),
            membership,
        });
        Ok(())
    }

    /// Writes every dirty watermark. Entries that fail stay dirty unless a
    /// newer value replaced them meanwhile.
    pub async fn flush_tokens(&self) -> Result<()> {
        let dirty: Vec<(GroupId, GroupMinMaxToken)> = self.dirty_tokens.lock().drain().collect();
        let mut first_error = None;
        for (group_id, token) in dirty {
            if let Err(e) = self
                .storage
                .set_uncached(&Self::token_key(&group_id), &token)
                .await
            {
                self.dirty_tokens.lock().entry(group_id).or_insert(token);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn destroy(&self) {
        self.seen.clear();
        *self.refresh_queue.lock() = RefreshQueue::default();
        self.memberships.clear();
        self.tokens.clear();
    }
}

#[async_trait]
impl ThreadHandler for GroupMemberDomain {
    fn name(&self) -> &'static str {
        "group_member"
    }

    async fn poll(&self) -> Result<bool> {
        let handled = self.drain_inbox().await;
        let refreshed = self.process_refreshes().await;
        if let Err(e) = self.flush_tokens().await {
            tracing::warn!(
                target: "chatsync::group_member::poll",
                "Token flush failed for {}: {}",
                self.address,
                e
            );
        }
        Ok(handled == 0 && refreshed == 0)
    }

    async fn on_stop(&self) -> Result<()> {
        self.flush_tokens().await
    }
}
