//! Downstream notification registry.
//!
//! Consumers subscribe per group or globally and receive typed
//! [`Notification`]s over broadcast channels. Streams are created lazily on
//! subscribe and cleaned up on emit once every receiver is gone.

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::chatsync::types::{GroupId, GroupMembership, Message, RawItem};

const BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Group(GroupId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A resolved message was appended to a group's log.
    GroupDataUpdated { group_id: GroupId, message: Message },

    /// A group's member list was refreshed.
    MembershipChanged {
        group_id: GroupId,
        membership: GroupMembership,
    },

    /// The session's public key became available or was lost.
    PublicKeyAvailability { available: bool },

    /// A control event with no dedicated consumer inside the engine.
    ControlEvent { item: RawItem },
}

impl Notification {
    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            Notification::GroupDataUpdated { group_id, .. }
            | Notification::MembershipChanged { group_id, .. } => Some(group_id),
            Notification::ControlEvent { item } => item.group_id(),
            Notification::PublicKeyAvailability { .. } => None,
        }
    }
}

/// Handle returned by [`Notifications::subscribe`]. Dropping it, or calling
/// [`Subscription::unsubscribe`], ends the subscription.
pub struct Subscription {
    scope: Scope,
    receiver: broadcast::Receiver<Notification>,
}

impl Subscription {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Waits for the next notification. `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target: "chatsync::notifications::recv",
                        "Subscriber for {:?} lagged, skipped {} notifications",
                        self.scope,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.try_recv() {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {
        tracing::debug!(
            target: "chatsync::notifications::unsubscribe",
            "Unsubscribed from {:?}",
            self.scope
        );
    }
}

#[derive(Default)]
pub struct Notifications {
    streams: DashMap<Scope, broadcast::Sender<Notification>>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, scope: Scope) -> Subscription {
        let receiver = self
            .streams
            .entry(scope.clone())
            .or_insert_with(|| broadcast::channel(BUFFER_SIZE).0)
            .subscribe();
        Subscription { scope, receiver }
    }

    pub fn subscribe_group(&self, group_id: &GroupId) -> Subscription {
        self.subscribe(Scope::Group(group_id.clone()))
    }

    pub fn subscribe_global(&self) -> Subscription {
        self.subscribe(Scope::Global)
    }

    /// Delivers to the notification's group scope, if any, and to the global scope.
    pub fn emit(&self, notification: Notification) {
        if let Some(group_id) = notification.group_id() {
            self.emit_to(&Scope::Group(group_id.clone()), notification.clone());
        }
        self.emit_to(&Scope::Global, notification);
    }

    fn emit_to(&self, scope: &Scope, notification: Notification) {
        let mut drained = false;
        if let Some(sender) = self.streams.get(scope) {
            drained = sender.send(notification).is_err() && sender.receiver_count() == 0;
        }
        if drained {
            self.streams
                .remove_if(scope, |_, sender| sender.receiver_count() == 0);
        }
    }

    /// Drops every stream whose subscribers are all gone.
    pub fn prune(&self) {
        self.streams.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        self.streams
            .get(scope)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Closes every stream; pending `recv` calls return `None`.
    pub fn clear(&self) {
        self.streams.clear();
    }
}

impl std::fmt::Debug for Notifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifications")
            .field("streams", &self.streams.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatsync::types::Address;

    fn message(group: &str, id: &str) -> Message {
        Message {
            message_id: id.to_string(),
            group_id: GroupId::from(group),
            sender: Address::from("0xsender"),
            message: "hello".to_string(),
            timestamp: 1,
            token: "01".to_string(),
        }
    }

    fn updated(group: &str, id: &str) -> Notification {
        Notification::GroupDataUpdated {
            group_id: GroupId::from(group),
            message: message(group, id),
        }
    }

    #[test]
    fn test_group_subscription_only_sees_its_group() {
        let notifications = Notifications::new();
        let mut g1 = notifications.subscribe_group(&GroupId::from("g1"));

        notifications.emit(updated("g2", "m1"));
        notifications.emit(updated("g1", "m2"));

        assert_eq!(g1.try_recv(), Some(updated("g1", "m2")));
        assert_eq!(g1.try_recv(), None);
    }

    #[test]
    fn test_global_subscription_sees_everything() {
        let notifications = Notifications::new();
        let mut global = notifications.subscribe_global();

        notifications.emit(updated("g1", "m1"));
        notifications.emit(Notification::PublicKeyAvailability { available: true });

        assert_eq!(global.try_recv(), Some(updated("g1", "m1")));
        assert_eq!(
            global.try_recv(),
            Some(Notification::PublicKeyAvailability { available: true })
        );
    }

    #[test]
    fn test_unsubscribe_cleans_up_on_next_emit() {
        let notifications = Notifications::new();
        let scope = Scope::Group(GroupId::from("g1"));
        let subscription = notifications.subscribe(scope.clone());
        assert_eq!(notifications.subscriber_count(&scope), 1);

        subscription.unsubscribe();
        assert!(notifications.streams.contains_key(&scope));

        notifications.emit(updated("g1", "m1"));
        assert!(!notifications.streams.contains_key(&scope));
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let notifications = Notifications::new();
        notifications.emit(updated("g1", "m1"));
        assert!(notifications.streams.is_empty());
    }

    #[test]
    fn test_prune_removes_dead_streams() {
        let notifications = Notifications::new();
        let keep = notifications.subscribe_global();
        drop(notifications.subscribe_group(&GroupId::from("g1")));

        notifications.prune();

        assert_eq!(notifications.streams.len(), 1);
        assert_eq!(keep.scope(), &Scope::Global);
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_clear() {
        let notifications = Notifications::new();
        let mut subscription = notifications.subscribe_global();
        notifications.clear();
        assert_eq!(subscription.recv().await, None);
    }
}
