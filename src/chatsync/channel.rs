//! Unbounded FIFO hand-off between components.
//!
//! Non-blocking on both ends with no backpressure. A sender may carry the
//! consumer's [`ThreadWaker`] so a push cuts the consumer's sleep short.

use tokio::sync::mpsc;

use crate::chatsync::thread::ThreadWaker;

pub fn channel<T>() -> (ChannelSender<T>, ChannelReceiver<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ChannelSender {
            inner: sender,
            waker: None,
        },
        ChannelReceiver { inner: receiver },
    )
}

#[derive(Debug)]
pub struct ChannelSender<T> {
    inner: mpsc::UnboundedSender<T>,
    waker: Option<ThreadWaker>,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<T> ChannelSender<T> {
    /// Wakes `waker` on every successful push.
    pub fn with_waker(mut self, waker: ThreadWaker) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Returns `false` if the receiving side is gone and the value was dropped.
    pub fn push(&self, value: T) -> bool {
        if self.inner.send(value).is_err() {
            return false;
        }
        if let Some(waker) = &self.waker {
            waker.wake();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[derive(Debug)]
pub struct ChannelReceiver<T> {
    inner: mpsc::UnboundedReceiver<T>,
}

impl<T> ChannelReceiver<T> {
    pub fn poll(&mut self) -> Option<T> {
        self.inner.try_recv().ok()
    }

    /// Pops up to `max` values in FIFO order.
    pub fn drain(&mut self, max: usize) -> Vec<T> {
        let mut values = Vec::new();
        while values.len() < max {
            match self.poll() {
                Some(value) => values.push(value),
                None => break,
            }
        }
        values
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
