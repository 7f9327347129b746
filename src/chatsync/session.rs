//! One wallet address's full component set.
//!
//! A [`SessionContext`] owns every domain and scheduler thread of a session
//! and wires them together with channels. Nothing is shared between
//! sessions: storage keys are namespaced by address and each session has its
//! own notification registry.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::chatsync::ChatSyncConfig;
use crate::chatsync::channel::channel;
use crate::chatsync::conversation::{ConversationDomain, MessageListPage, MessageListParams};
use crate::chatsync::error::{ChatSyncError, Result};
use crate::chatsync::event_source::{EventSourceDomain, EventSourceSinks};
use crate::chatsync::group_member::GroupMemberDomain;
use crate::chatsync::notifications::{Notifications, Scope, Subscription};
use crate::chatsync::output_sending::OutputSendingDomain;
use crate::chatsync::storage::CombinedStorage;
use crate::chatsync::thread::{Thread, ThreadState, ThreadWaker};
use crate::chatsync::types::{Address, GroupId, GroupMembership, GroupMinMaxToken, Message};
use crate::chatsync::upstream::SessionServices;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Bootstrapped,
    Running,
    Paused,
    Stopped,
    Destroyed,
}

struct SessionThreads {
    state: SessionState,
    /// Stop order: ingestion first so its pending list is flushed before
    /// the consumers drain
    threads: Vec<Thread>,
}

pub struct SessionContext {
    address: Address,
    storage: Arc<CombinedStorage>,
    notifications: Arc<Notifications>,
    event_source: Arc<EventSourceDomain>,
    conversation: Arc<ConversationDomain>,
    group_member: Arc<GroupMemberDomain>,
    output_sending: Arc<OutputSendingDomain>,
    threads: Mutex<SessionThreads>,
}

impl SessionContext {
    /// Builds the component set. Nothing runs until [`SessionContext::bootstrap`].
    pub fn new(address: Address, config: &ChatSyncConfig, services: SessionServices) -> Self {
        let storage = Arc::new(CombinedStorage::new(
            services.storage.clone(),
            address.as_str(),
        ));
        let notifications = Arc::new(Notifications::new());

        let event_source_waker = ThreadWaker::new();
        let conversation_waker = ThreadWaker::new();
        let group_member_waker = ThreadWaker::new();
        let output_waker = ThreadWaker::new();

        let (messages_tx, messages_rx) = channel::<Message>();
        let (membership_tx, membership_rx) = channel();

        let event_source = Arc::new(EventSourceDomain::new(
            address.clone(),
            config.event_source.clone(),
            storage.clone(),
            services.upstream.clone(),
            services.resolver.clone(),
            services.mute_filter.clone(),
            EventSourceSinks {
                messages: messages_tx.with_waker(conversation_waker.clone()),
                membership_events: membership_tx.with_waker(group_member_waker.clone()),
                notifications: notifications.clone(),
            },
            event_source_waker.clone(),
        ));
        let conversation = Arc::new(ConversationDomain::new(
            config.conversation.clone(),
            storage.clone(),
            messages_rx,
            notifications.clone(),
        ));
        let group_member = Arc::new(GroupMemberDomain::new(
            address.clone(),
            config.group_member.clone(),
            storage.clone(),
            services.group_data.clone(),
            membership_rx,
            notifications.clone(),
            group_member_waker.clone(),
        ));
        let output_sending = Arc::new(OutputSendingDomain::new(
            address.clone(),
            config.output_sending.clone(),
            services.outbound.clone(),
            notifications.clone(),
            output_waker.clone(),
        ));

        let threads = vec![
            Thread::with_waker(
                event_source.clone(),
                config.scheduler.clone(),
                event_source_waker,
            ),
            Thread::with_waker(
                conversation.clone(),
                config.scheduler.clone(),
                conversation_waker,
            ),
            Thread::with_waker(
                group_member.clone(),
                config.scheduler.clone(),
                group_member_waker,
            ),
            Thread::with_waker(
                output_sending.clone(),
                config.scheduler.clone(),
                output_waker,
            ),
        ];

        Self {
            address,
            storage,
            notifications,
            event_source,
            conversation,
            group_member,
            output_sending,
            threads: Mutex::new(SessionThreads {
                state: SessionState::Created,
                threads,
            }),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn state(&self) -> SessionState {
        self.threads.lock().await.state
    }

    pub async fn thread_states(&self) -> Vec<(&'static str, ThreadState)> {
        self.threads
            .lock()
            .await
            .threads
            .iter()
            .map(|thread| (thread.name(), thread.state()))
            .collect()
    }

    fn invalid(&self, action: &'static str, state: SessionState) -> ChatSyncError {
        ChatSyncError::InvalidArgument(format!(
            "cannot {action} session {} in state {state:?}",
            self.address
        ))
    }

    /// Restores persisted state and starts every thread paused.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut guard = self.threads.lock().await;
        match guard.state {
            SessionState::Created | SessionState::Stopped => {}
            state => return Err(self.invalid("bootstrap", state)),
        }

        self.event_source.bootstrap().await?;
        for thread in guard.threads.iter_mut() {
            thread.start()?;
        }
        self.output_sending.check_public_key();
        guard.state = SessionState::Bootstrapped;

        tracing::info!(
            target: "chatsync::session::bootstrap",
            "Session {} bootstrapped",
            self.address
        );
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let mut guard = self.threads.lock().await;
        match guard.state {
            SessionState::Bootstrapped | SessionState::Paused | SessionState::Running => {}
            state => return Err(self.invalid("resume", state)),
        }
        for thread in guard.threads.iter() {
            thread.resume()?;
        }
        guard.state = SessionState::Running;
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        let mut guard = self.threads.lock().await;
        match guard.state {
            SessionState::Running | SessionState::Paused | SessionState::Bootstrapped => {}
            state => return Err(self.invalid("pause", state)),
        }
        for thread in guard.threads.iter() {
            thread.pause()?;
        }
        guard.state = SessionState::Paused;
        Ok(())
    }

    /// Stops every thread, each draining for up to its grace period.
    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.threads.lock().await;
        match guard.state {
            SessionState::Destroyed => return Err(self.invalid("stop", guard.state)),
            SessionState::Created | SessionState::Stopped => return Ok(()),
            _ => {}
        }
        for thread in guard.threads.iter_mut() {
            thread.stop().await?;
        }
        if let Err(e) = self.storage.flush_deferred().await {
            tracing::warn!(
                target: "chatsync::session::stop",
                "Deferred writes for {} could not be flushed: {}",
                self.address,
                e
            );
        }
        guard.state = SessionState::Stopped;
        tracing::info!(target: "chatsync::session::stop", "Session {} stopped", self.address);
        Ok(())
    }

    /// Stops and releases everything. A destroyed session cannot be reused.
    pub async fn destroy(&self) -> Result<()> {
        if self.state().await == SessionState::Destroyed {
            return Ok(());
        }
        self.stop().await?;

        let mut guard = self.threads.lock().await;
        for thread in guard.threads.iter_mut() {
            thread.destroy().await?;
        }
        self.event_source.destroy().await;
        self.group_member.destroy();
        self.conversation.clear_caches();
        self.notifications.clear();
        guard.state = SessionState::Destroyed;

        tracing::info!(
            target: "chatsync::session::destroy",
            "Session {} destroyed",
            self.address
        );
        Ok(())
    }

    pub fn subscribe(&self, scope: Scope) -> Subscription {
        self.notifications.subscribe(scope)
    }

    pub fn notifications(&self) -> &Arc<Notifications> {
        &self.notifications
    }

    pub fn event_source(&self) -> &Arc<EventSourceDomain> {
        &self.event_source
    }

    pub fn conversation(&self) -> &Arc<ConversationDomain> {
        &self.conversation
    }

    pub fn group_member(&self) -> &Arc<GroupMemberDomain> {
        &self.group_member
    }

    pub fn output_sending(&self) -> &Arc<OutputSendingDomain> {
        &self.output_sending
    }

    pub async fn get_message_list(&self, params: &MessageListParams) -> Result<MessageListPage> {
        self.conversation.get_message_list(params).await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        self.conversation.get_message(message_id).await
    }

    pub async fn get_group_members(&self, group_id: &GroupId) -> Result<Option<GroupMembership>> {
        self.group_member.get_group_members(group_id).await
    }

    pub async fn get_min_max_token(&self, group_id: &GroupId) -> Result<Option<GroupMinMaxToken>> {
        self.group_member.get_min_max_token(group_id).await
    }

    pub fn join_group(&self, group_id: GroupId) -> bool {
        self.output_sending.join_group(group_id)
    }

    pub fn set_allow_sync(&self, allow: bool) {
        self.event_source.set_allow_sync(allow);
    }

    pub fn set_has_wallet(&self, has_wallet: bool) {
        self.event_source.set_has_wallet(has_wallet);
    }

    pub async fn clear_pending(&self) -> Result<()> {
        self.event_source.clear_pending().await
    }

    pub async fn pending_count(&self) -> usize {
        self.event_source.pending_count().await
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("address", &self.address)
            .field("storage", &self.storage)
            .field("notifications", &self.notifications)
            .finish_non_exhaustive()
    }
}
