//! Serialized outbound commands.
//!
//! Commands run one at a time. Each processed command is followed by its
//! configured quiet period before the next is drained, which caps the
//! session's outbound write rate. Joining a group needs the session's public
//! key, so joins are parked until a key check finds one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::chatsync::channel::{ChannelReceiver, ChannelSender, channel};
use crate::chatsync::error::Result;
use crate::chatsync::notifications::{Notification, Notifications};
use crate::chatsync::thread::{ThreadHandler, ThreadWaker};
use crate::chatsync::types::{Address, GroupId, RetryInfo};
use crate::chatsync::upstream::OutboundClient;

#[derive(Debug, Clone)]
pub struct OutputSendingConfig {
    /// Delay before re-checking for a public key after a probe
    pub public_key_retry: Duration,
    pub check_public_key_sleep: Duration,
    pub join_group_sleep: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for OutputSendingConfig {
    fn default() -> Self {
        Self {
            public_key_retry: Duration::from_secs(9),
            check_public_key_sleep: Duration::from_secs(1),
            join_group_sleep: Duration::from_secs(2),
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    CheckPublicKey,
    JoinGroup { group_id: GroupId },
}

#[derive(Debug, Clone)]
struct QueuedCommand {
    command: OutboundCommand,
    retry: RetryInfo,
}

#[derive(Default)]
struct OutputState {
    public_key: Option<String>,
    /// Last availability published to subscribers
    announced: Option<bool>,
    retry_check_at: Option<Instant>,
    next_command_at: Option<Instant>,
    ready: VecDeque<QueuedCommand>,
    delayed: Vec<(Instant, QueuedCommand)>,
    deferred_joins: Vec<GroupId>,
}

pub struct OutputSendingDomain {
    address: Address,
    config: OutputSendingConfig,
    outbound: Arc<dyn OutboundClient>,
    notifications: Arc<Notifications>,
    commands: ChannelSender<OutboundCommand>,
    inbox: parking_lot::Mutex<ChannelReceiver<OutboundCommand>>,
    state: parking_lot::Mutex<OutputState>,
}

impl OutputSendingDomain {
    pub fn new(
        address: Address,
        config: OutputSendingConfig,
        outbound: Arc<dyn OutboundClient>,
        notifications: Arc<Notifications>,
        waker: ThreadWaker,
    ) -> Self {
        let (commands, inbox) = channel();
        Self {
            address,
            config,
            outbound,
            notifications,
            commands: commands.with_waker(waker),
            inbox: parking_lot::Mutex::new(inbox),
            state: parking_lot::Mutex::new(OutputState::default()),
        }
    }

    /// Requests a fresh public-key check, cancelling any scheduled re-check
    /// or backoff retry of an earlier one.
    pub fn check_public_key(&self) -> bool {
        {
            let mut state = self.state.lock();
            state.retry_check_at = None;
            state
                .delayed
                .retain(|(_, queued)| queued.command != OutboundCommand::CheckPublicKey);
        }
        self.commands.push(OutboundCommand::CheckPublicKey)
    }

    pub fn join_group(&self, group_id: GroupId) -> bool {
        self.commands.push(OutboundCommand::JoinGroup { group_id })
    }

    pub fn public_key(&self) -> Option<String> {
        self.state.lock().public_key.clone()
    }

    pub fn deferred_join_count(&self) -> usize {
        self.state.lock().deferred_joins.len()
    }

    /// Commands queued, delayed for retry, or parked waiting for a key.
    pub fn backlog_len(&self) -> usize {
        let state = self.state.lock();
        self.inbox.lock().len() + state.ready.len() + state.delayed.len() + state.deferred_joins.len()
    }

    /// Forgets the cached key, e.g. after the host reports it revoked.
    pub fn invalidate_public_key(&self) {
        let announce = {
            let mut state = self.state.lock();
            state.public_key = None;
            Self::transition(&mut state, false)
        };
        self.announce(announce);
        self.check_public_key();
    }

    fn transition(state: &mut OutputState, available: bool) -> Option<bool> {
        if state.announced == Some(available) {
            return None;
        }
        state.announced = Some(available);
        Some(available)
    }

    fn announce(&self, transition: Option<bool>) {
        if let Some(available) = transition {
            tracing::info!(
                target: "chatsync::output_sending::announce",
                "Public key for {} is {}",
                self.address,
                if available { "available" } else { "unavailable" }
            );
            self.notifications
                .emit(Notification::PublicKeyAvailability { available });
        }
    }

    /// Moves newly requested, due-for-retry and timer-driven commands into
    /// the ready queue.
    fn collect_ready(&self, state: &mut OutputState, now: Instant) {
        let fresh = self.inbox.lock().drain(usize::MAX);
        state.ready.extend(fresh.into_iter().map(|command| QueuedCommand {
            command,
            retry: RetryInfo::new(self.config.max_attempts, self.config.base_delay),
        }));

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        state.delayed = waiting;
        state.ready.extend(due.into_iter().map(|(_, queued)| queued));

        if state.retry_check_at.is_some_and(|at| at <= now) {
            state.retry_check_at = None;
            let already_queued = state
                .ready
                .iter()
                .any(|q| q.command == OutboundCommand::CheckPublicKey);
            if !already_queued {
                state.ready.push_back(QueuedCommand {
                    command: OutboundCommand::CheckPublicKey,
                    retry: RetryInfo::new(self.config.max_attempts, self.config.base_delay),
                });
            }
        }
    }

    fn schedule_retry(&self, queued: QueuedCommand, error: &dyn std::fmt::Display) {
        match queued.retry.next_attempt() {
            Some(retry) => {
                let delay = retry.delay();
                tracing::warn!(
                    target: "chatsync::output_sending::schedule_retry",
                    "{:?} failed for {} (attempt {}), retrying in {:?}: {}",
                    queued.command,
                    self.address,
                    retry.attempt,
                    delay,
                    error
                );
                self.state.lock().delayed.push((
                    Instant::now() + delay,
                    QueuedCommand {
                        command: queued.command,
                        retry,
                    },
                ));
            }
            None => {
                tracing::error!(
                    target: "chatsync::output_sending::schedule_retry",
                    "{:?} failed for {} after {} attempts, giving up: {}",
                    queued.command,
                    self.address,
                    queued.retry.attempt,
                    error
                );
                if queued.command == OutboundCommand::CheckPublicKey {
                    self.state.lock().retry_check_at =
                        Some(Instant::now() + self.config.public_key_retry);
                }
            }
        }
    }

    /// Runs one command. Returns the quiet period owed afterwards, or `None`
    /// when the command was parked without doing anything.
    async fn process(&self, queued: QueuedCommand) -> Option<Duration> {
        match queued.command.clone() {
            OutboundCommand::CheckPublicKey => {
                self.process_check(queued).await;
                Some(self.config.check_public_key_sleep)
            }
            OutboundCommand::JoinGroup { group_id } => {
                let has_key = {
                    let mut state = self.state.lock();
                    let has_key = state.public_key.is_some();
                    if !has_key && !state.deferred_joins.contains(&group_id) {
                        state.deferred_joins.push(group_id.clone());
                    }
                    has_key
                };
                if !has_key {
                    tracing::debug!(
                        target: "chatsync::output_sending::process",
                        "Deferring join of {} until {} has a public key",
                        group_id,
                        self.address
                    );
                    return None;
                }
                match self.outbound.join_group(&self.address, &group_id).await {
                    Ok(()) => {
                        tracing::info!(
                            target: "chatsync::output_sending::process",
                            "{} joined group {}",
                            self.address,
                            group_id
                        );
                    }
                    Err(e) => self.schedule_retry(queued, &e),
                }
                Some(self.config.join_group_sleep)
            }
        }
    }

    async fn process_check(&self, queued: QueuedCommand) {
        if self.state.lock().public_key.is_some() {
            return;
        }
        match self.outbound.fetch_public_key(&self.address).await {
            Ok(Some(key)) => {
                let announce = {
                    let mut state = self.state.lock();
                    state.public_key = Some(key);
                    state.retry_check_at = None;
                    let replay: Vec<GroupId> = state.deferred_joins.drain(..).collect();
                    for group_id in replay {
                        state.ready.push_back(QueuedCommand {
                            command: OutboundCommand::JoinGroup { group_id },
                            retry: RetryInfo::new(self.config.max_attempts, self.config.base_delay),
                        });
                    }
                    Self::transition(&mut state, true)
                };
                self.announce(announce);
            }
            Ok(None) => {
                if let Err(e) = self.outbound.send_public_key_probe(&self.address).await {
                    tracing::warn!(
                        target: "chatsync::output_sending::process_check",
                        "Public key probe for {} failed: {}",
                        self.address,
                        e
                    );
                }
                let announce = {
                    let mut state = self.state.lock();
                    state.retry_check_at = Some(Instant::now() + self.config.public_key_retry);
                    Self::transition(&mut state, false)
                };
                self.announce(announce);
            }
            Err(e) => self.schedule_retry(queued, &e),
        }
    }
}

#[async_trait]
impl ThreadHandler for OutputSendingDomain {
    fn name(&self) -> &'static str {
        "output_sending"
    }

    async fn poll(&self) -> Result<bool> {
        let now = Instant::now();
        let next = {
            let mut state = self.state.lock();
            self.collect_ready(&mut state, now);
            if state.next_command_at.is_some_and(|at| now < at) {
                return Ok(true);
            }
            state.ready.pop_front()
        };
        let Some(queued) = next else {
            return Ok(true);
        };

        if let Some(quiet) = self.process(queued).await {
            self.state.lock().next_command_at = Some(Instant::now() + quiet);
        }
        Ok(false)
    }
}
