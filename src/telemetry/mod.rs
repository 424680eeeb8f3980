//! Telemetry subscriptions.
//!
//! A [`Transport`] opens a [`Subscription`] on a named topic. Incoming
//! messages land in a [`Mailbox`]; in conflated mode the mailbox keeps only
//! the newest snapshot, so a slow consumer always sees current data.
//!
//! - [`socket`] - newline-delimited JSON over a Unix socket
//! - [`procfs`] - local sampler that publishes `procLog` from `/proc`

pub mod procfs;
pub mod socket;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::Result;
use crate::snapshot::ProcessSnapshot;

pub use procfs::ProcfsTransport;
pub use socket::SocketTransport;

/// Topic carrying per-process CPU counters.
pub const PROC_LOG_TOPIC: &str = "procLog";

/// Queue depth for non-conflated subscriptions.
pub const DEFAULT_QUEUE_DEPTH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Keep only the most recent message.
    pub conflate: bool,
    /// Upper bound for a waiting [`Subscription::receive`].
    pub timeout: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            conflate: true,
            timeout: Duration::from_millis(2000),
        }
    }
}

pub trait Transport {
    /// Opens a subscription. Fails with `TransportUnavailable` if the
    /// topic cannot be reached.
    fn open(&self, topic: &str, options: SubscribeOptions) -> Result<Box<dyn Subscription>>;
}

pub trait Subscription: Send {
    /// Returns the next snapshot.
    ///
    /// With `wait`, blocks up to the subscription timeout. `None` means no
    /// data arrived in time, which callers must treat as a recoverable
    /// condition.
    fn receive(&mut self, wait: bool) -> Option<ProcessSnapshot>;
}

/// Single-consumer message slot shared with a producer thread.
pub struct Mailbox {
    state: Mutex<MailboxState>,
    changed: Condvar,
}

struct MailboxState {
    queue: VecDeque<ProcessSnapshot>,
    capacity: usize,
    closed: bool,
}

impl Mailbox {
    pub fn new(conflate: bool) -> Self {
        Self::with_capacity(if conflate { 1 } else { DEFAULT_QUEUE_DEPTH })
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MailboxState {
                queue: VecDeque::new(),
                capacity: capacity.max(1),
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a snapshot, dropping the oldest when full.
    pub fn push(&self, snapshot: ProcessSnapshot) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        while state.queue.len() >= state.capacity {
            state.queue.pop_front();
        }
        state.queue.push_back(snapshot);
        drop(state);
        self.changed.notify_all();
    }

    /// Takes the oldest queued snapshot, waiting up to `timeout` for one.
    ///
    /// Returns `None` on timeout, or immediately once the mailbox is closed
    /// and drained.
    pub fn pop(&self, timeout: Duration) -> Option<ProcessSnapshot> {
        let state = self.lock();
        let (mut state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| s.queue.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        state.queue.pop_front()
    }

    pub fn try_pop(&self) -> Option<ProcessSnapshot> {
        self.lock().queue.pop_front()
    }

    /// Marks the mailbox closed and wakes every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Blocks up to `timeout` or until the mailbox is closed.
    ///
    /// Returns `true` if closed. Producers use this as an interruptible sleep.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        state.closed
    }
}

/// A subscription fed by a background producer thread through a [`Mailbox`].
///
/// Dropping it closes the mailbox, runs the transport's shutdown hook and
/// joins the producer.
pub struct MailboxSubscription {
    mailbox: Arc<Mailbox>,
    timeout: Duration,
    producer: Option<JoinHandle<()>>,
    shutdown: Option<Box<dyn FnOnce() + Send>>,
}

impl MailboxSubscription {
    pub fn new(mailbox: Arc<Mailbox>, timeout: Duration, producer: JoinHandle<()>) -> Self {
        Self {
            mailbox,
            timeout,
            producer: Some(producer),
            shutdown: None,
        }
    }

    /// Registers a hook that unblocks the producer on drop.
    pub fn on_shutdown(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.shutdown = Some(Box::new(hook));
        self
    }
}

impl Subscription for MailboxSubscription {
    fn receive(&mut self, wait: bool) -> Option<ProcessSnapshot> {
        if wait {
            self.mailbox.pop(self.timeout)
        } else {
            self.mailbox.try_pop()
        }
    }
}

impl Drop for MailboxSubscription {
    fn drop(&mut self) {
        self.mailbox.close();
        if let Some(hook) = self.shutdown.take() {
            hook();
        }
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
    }
}
