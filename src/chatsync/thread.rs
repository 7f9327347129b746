//! Cooperative polling scheduler.
//!
//! A [`Thread`] drives one [`ThreadHandler`] on a tokio task. Each tick calls
//! [`ThreadHandler::poll`]: `true` means no work was found and the loop may
//! sleep for the configured interval, `false` means poll again immediately.
//! A sleep ends early when the [`ThreadWaker`] fires, which is how a pushed
//! event gets handled within milliseconds.
//!
//! Lifecycle: `Stopped -> start -> Paused <-> Running -> stop -> Stopping ->
//! Stopped -> destroy -> Destroyed`. Stopping keeps polling until the handler
//! reports no work or the grace period runs out.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::chatsync::error::{ChatSyncError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Stopped,
    Paused,
    Running,
    Stopping,
    Destroyed,
}

impl std::fmt::Display for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ThreadState::Stopped => "stopped",
            ThreadState::Paused => "paused",
            ThreadState::Running => "running",
            ThreadState::Stopping => "stopping",
            ThreadState::Destroyed => "destroyed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest sleep after an idle tick
    pub sleep_interval: Duration,
    /// How long `stop` lets the handler drain before aborting it
    pub stop_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sleep_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// Cuts a scheduler sleep short. A wake with no sleeper pending is remembered
/// and ends the next sleep immediately.
#[derive(Debug, Clone, Default)]
pub struct ThreadWaker {
    notify: Arc<Notify>,
}

impl ThreadWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[async_trait]
pub trait ThreadHandler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Runs one unit of work. `Ok(true)` when there was nothing to do.
    ///
    /// Errors are logged and treated as an idle tick.
    async fn poll(&self) -> Result<bool>;

    /// Called once after a stop has drained the handler.
    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }
}

pub struct Thread {
    name: &'static str,
    config: SchedulerConfig,
    handler: Option<Arc<dyn ThreadHandler>>,
    state: watch::Sender<ThreadState>,
    waker: ThreadWaker,
    task: Option<JoinHandle<()>>,
}

impl Thread {
    pub fn new(handler: Arc<dyn ThreadHandler>, config: SchedulerConfig) -> Self {
        Self::with_waker(handler, config, ThreadWaker::new())
    }

    /// Builds a thread around a waker handed out before the handler existed.
    pub fn with_waker(
        handler: Arc<dyn ThreadHandler>,
        config: SchedulerConfig,
        waker: ThreadWaker,
    ) -> Self {
        let (state, _) = watch::channel(ThreadState::Stopped);
        Self {
            name: handler.name(),
            config,
            handler: Some(handler),
            state,
            waker,
            task: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ThreadState {
        *self.state.borrow()
    }

    pub fn waker(&self) -> ThreadWaker {
        self.waker.clone()
    }

    fn invalid(&self, action: &'static str) -> ChatSyncError {
        ChatSyncError::InvalidThreadState {
            name: self.name,
            action,
            state: self.state().to_string(),
        }
    }

    /// Spawns the loop in the paused state.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != ThreadState::Stopped {
            return Err(self.invalid("start"));
        }
        let handler = self.handler.clone().ok_or_else(|| self.invalid("start"))?;

        self.state.send_replace(ThreadState::Paused);
        self.task = Some(tokio::spawn(run_loop(
            handler,
            self.state.subscribe(),
            self.waker.clone(),
            self.config.sleep_interval,
        )));

        tracing::debug!(target: "chatsync::thread::start", "Thread {} started", self.name);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        match self.state() {
            ThreadState::Running => Ok(()),
            ThreadState::Paused => {
                self.state.send_replace(ThreadState::Running);
                tracing::debug!(target: "chatsync::thread::resume", "Thread {} resumed", self.name);
                Ok(())
            }
            _ => Err(self.invalid("resume")),
        }
    }

    pub fn pause(&self) -> Result<()> {
        match self.state() {
            ThreadState::Paused => Ok(()),
            ThreadState::Running => {
                self.state.send_replace(ThreadState::Paused);
                tracing::debug!(target: "chatsync::thread::pause", "Thread {} paused", self.name);
                Ok(())
            }
            _ => Err(self.invalid("pause")),
        }
    }

    /// Ends the current sleep now instead of waiting out the interval.
    pub fn force_pause_resolve(&self) {
        self.waker.wake();
    }

    /// Drains outstanding work for up to the grace period, then terminates.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state() {
            ThreadState::Stopped => return Ok(()),
            ThreadState::Destroyed => return Err(self.invalid("stop")),
            _ => {}
        }

        self.state.send_replace(ThreadState::Stopping);
        self.waker.wake();

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.config.stop_grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        target: "chatsync::thread::stop",
                        "Thread {} task failed: {}",
                        self.name,
                        e
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        target: "chatsync::thread::stop",
                        "Thread {} did not drain within {:?}, aborting",
                        self.name,
                        self.config.stop_grace
                    );
                    task.abort();
                }
            }
        }

        self.state.send_replace(ThreadState::Stopped);
        tracing::debug!(target: "chatsync::thread::stop", "Thread {} stopped", self.name);
        Ok(())
    }

    /// Stops if needed and releases the handler. The thread cannot be restarted.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.state() == ThreadState::Destroyed {
            return Ok(());
        }
        self.stop().await?;
        self.handler = None;
        self.state.send_replace(ThreadState::Destroyed);
        tracing::debug!(target: "chatsync::thread::destroy", "Thread {} destroyed", self.name);
        Ok(())
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

async fn poll_once(handler: &Arc<dyn ThreadHandler>) -> bool {
    match AssertUnwindSafe(handler.poll()).catch_unwind().await {
        Ok(Ok(idle)) => idle,
        Ok(Err(e)) if e.is_transient() => {
            tracing::warn!(
                target: "chatsync::thread::poll",
                "Thread {} poll failed, retrying next tick: {}",
                handler.name(),
                e
            );
            true
        }
        Ok(Err(e)) => {
            tracing::error!(
                target: "chatsync::thread::poll",
                "Thread {} poll failed: {}",
                handler.name(),
                e
            );
            true
        }
        Err(_) => {
            tracing::error!(
                target: "chatsync::thread::poll",
                "Thread {} poll panicked",
                handler.name()
            );
            true
        }
    }
}

async fn run_loop(
    handler: Arc<dyn ThreadHandler>,
    mut state: watch::Receiver<ThreadState>,
    waker: ThreadWaker,
    sleep_interval: Duration,
) {
    loop {
        let current = *state.borrow_and_update();
        match current {
            ThreadState::Paused => {
                if state.changed().await.is_err() {
                    break;
                }
            }
            ThreadState::Running => {
                if poll_once(&handler).await {
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_interval) => {}
                        _ = waker.notified() => {}
                        changed = state.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                } else {
                    tokio::task::yield_now().await;
                }
            }
            ThreadState::Stopping => {
                if poll_once(&handler).await {
                    if let Err(e) = handler.on_stop().await {
                        tracing::warn!(
                            target: "chatsync::thread::run_loop",
                            "Thread {} on_stop failed: {}",
                            handler.name(),
                            e
                        );
                    }
                    break;
                }
            }
            ThreadState::Stopped | ThreadState::Destroyed => break,
        }
    }
    tracing::debug!(
        target: "chatsync::thread::run_loop",
        "Thread {} loop exited",
        handler.name()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        polls: AtomicUsize,
        work: AtomicUsize,
        stopped: AtomicBool,
        fail: AtomicBool,
        reject: AtomicBool,
        panic: AtomicBool,
        hang: AtomicBool,
    }

    #[async_trait]
    impl ThreadHandler for CountingHandler {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn poll(&self) -> Result<bool> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            if self.panic.swap(false, Ordering::SeqCst) {
                panic!("handler blew up");
            }
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(ChatSyncError::Upstream("boom".to_string()));
            }
            if self.reject.swap(false, Ordering::SeqCst) {
                return Err(ChatSyncError::InvalidArgument("bad cursor".to_string()));
            }
            let remaining = self.work.load(Ordering::SeqCst);
            if remaining == 0 {
                return Ok(true);
            }
            self.work.store(remaining - 1, Ordering::SeqCst);
            Ok(false)
        }

        async fn on_stop(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            sleep_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(3),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_thread_is_paused_until_resumed() {
        let handler = Arc::new(CountingHandler::default());
        let mut thread = Thread::new(handler.clone(), config());
        thread.start().unwrap();
        assert_eq!(thread.state(), ThreadState::Paused);

        settle().await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 0);

        thread.resume().unwrap();
        settle().await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_handler_is_polled_without_sleeping() {
        let handler = Arc::new(CountingHandler::default());
        handler.work.store(5, Ordering::SeqCst);
        let mut thread = Thread::new(handler.clone(), config());
        thread.start().unwrap();
        thread.resume().unwrap();

        settle().await;
        // five working polls plus the idle poll that started the sleep
        assert_eq!(handler.polls.load(Ordering::SeqCst), 6);
        assert_eq!(handler.work.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_handler_sleeps_for_interval() {
        let handler = Arc::new(CountingHandler::default());
        let mut thread = Thread::new(handler.clone(), config());
        thread.start().unwrap();
        thread.resume().unwrap();

        settle().await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(520)).await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_pause_resolve_cuts_sleep_short() {
        let handler = Arc::new(CountingHandler::default());
        let mut thread = Thread::new(handler.clone(), config());
        thread.start().unwrap();
        thread.resume().unwrap();
        settle().await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 1);

        thread.force_pause_resolve();
        settle().await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_and_panics_do_not_stop_the_loop() {
        let handler = Arc::new(CountingHandler::default());
        handler.fail.store(true, Ordering::SeqCst);
        let mut thread = Thread::new(handler.clone(), config());
        thread.start().unwrap();
        thread.resume().unwrap();
        settle().await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 1);

        handler.panic.store(true, Ordering::SeqCst);
        thread.force_pause_resolve();
        settle().await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 2);

        thread.force_pause_resolve();
        settle().await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 3);
        assert_eq!(thread.state(), ThreadState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_error_is_an_idle_tick() {
        let handler = Arc::new(CountingHandler::default());
        handler.reject.store(true, Ordering::SeqCst);
        handler.work.store(1, Ordering::SeqCst);
        let mut thread = Thread::new(handler.clone(), config());
        thread.start().unwrap();
        thread.resume().unwrap();

        settle().await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.work.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handler.work.load(Ordering::SeqCst), 0);
        assert_eq!(thread.state(), ThreadState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_stops_polling() {
        let handler = Arc::new(CountingHandler::default());
        let mut thread = Thread::new(handler.clone(), config());
        thread.start().unwrap();
        thread.resume().unwrap();
        settle().await;

        thread.pause().unwrap();
        settle().await;
        let polls = handler.polls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_outstanding_work() {
        let handler = Arc::new(CountingHandler::default());
        let mut thread = Thread::new(handler.clone(), config());
        thread.start().unwrap();

        handler.work.store(4, Ordering::SeqCst);
        thread.stop().await.unwrap();

        assert_eq!(handler.work.load(Ordering::SeqCst), 0);
        assert!(handler.stopped.load(Ordering::SeqCst));
        assert_eq!(thread.state(), ThreadState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_after_grace_period() {
        let handler = Arc::new(CountingHandler::default());
        handler.hang.store(true, Ordering::SeqCst);
        let mut thread = Thread::new(handler.clone(), config());
        thread.start().unwrap();
        thread.resume().unwrap();
        settle().await;

        let started = tokio::time::Instant::now();
        thread.stop().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(!handler.stopped.load(Ordering::SeqCst));
        assert_eq!(thread.state(), ThreadState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroyed_thread_cannot_restart() {
        let handler = Arc::new(CountingHandler::default());
        let mut thread = Thread::new(handler, config());
        thread.start().unwrap();
        thread.destroy().await.unwrap();
        assert_eq!(thread.state(), ThreadState::Destroyed);

        assert!(matches!(
            thread.start(),
            Err(ChatSyncError::InvalidThreadState { action: "start", .. })
        ));
        assert!(thread.resume().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_thread_can_start_again() {
        let handler = Arc::new(CountingHandler::default());
        let mut thread = Thread::new(handler.clone(), config());
        thread.start().unwrap();
        thread.stop().await.unwrap();

        thread.start().unwrap();
        thread.resume().unwrap();
        settle().await;
        assert!(handler.polls.load(Ordering::SeqCst) >= 2);
    }
}
