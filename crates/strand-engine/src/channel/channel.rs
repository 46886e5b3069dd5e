//! The channel type

use super::queue::Buffer;
use super::{ChannelConfig, ChannelConfigError, OverflowPolicy, ReceiveError, Received, SendError, TrySendError};
use crate::fiber::{clear_wakeup, Fiber, Flow, Strand};
use crate::sync::ConditionSynchronizer;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Shared<T> {
    config: ChannelConfig,
    buffer: Buffer<T>,
    closed: AtomicBool,
    /// Serializes transfer-channel offers against the receiver count
    handoff: Mutex<()>,
    receivers: ConditionSynchronizer,
    senders: ConditionSynchronizer,
    producers: AtomicUsize,
    consumers: AtomicUsize,
}

impl<T> Shared<T> {
    fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            buffer: Buffer::new(config.capacity),
            closed: AtomicBool::new(false),
            handoff: Mutex::new(()),
            receivers: ConditionSynchronizer::new("channel-receive"),
            senders: ConditionSynchronizer::new("channel-send"),
            producers: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
        }
    }
}

/// A message channel shared by any number of handles.
///
/// Messages from one producer are received in send order. With capacity 0
/// (a transfer channel) a message is only accepted once a receiver is
/// waiting for it. Single-producer and single-consumer flags are promises by
/// the caller; with [`ChannelConfig::checked`] a broken promise panics
/// instead of silently misbehaving.
pub struct Channel<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.inner.config.capacity)
            .field("overflow", &self.inner.config.overflow)
            .field("length", &self.inner.buffer.len())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<T: Send> Channel<T> {
    /// Create a channel from a validated configuration
    pub fn new(config: ChannelConfig) -> Result<Self, ChannelConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Shared::new(config)),
        })
    }

    /// Bounded channel with the BLOCK policy
    pub fn bounded(capacity: usize) -> Result<Self, ChannelConfigError> {
        Self::new(ChannelConfig::bounded(capacity))
    }

    /// Transfer channel: capacity 0, BLOCK policy
    pub fn transfer_channel() -> Self {
        Self {
            inner: Arc::new(Shared::new(ChannelConfig::transfer())),
        }
    }

    /// Unbounded channel
    pub fn unbounded() -> Self {
        Self {
            inner: Arc::new(Shared::new(ChannelConfig::unbounded())),
        }
    }

    /// Send without waiting
    pub fn try_send(&self, message: T) -> Result<(), TrySendError<T>> {
        let _usage = self.enter(Role::Producer);
        if self.is_closed() {
            return Err(TrySendError::Closed(message));
        }
        if self.inner.config.overflow == OverflowPolicy::Displace {
            self.displace(message);
            return Ok(());
        }
        match self.offer(message) {
            Ok(()) => {
                self.inner.receivers.signal_all();
                Ok(())
            }
            Err(message) => Err(TrySendError::Full(message)),
        }
    }

    /// Send the message held in `message`.
    ///
    /// The slot is emptied once the message is queued. Under the BLOCK policy
    /// a full channel parks the caller; a fiber that suspends here keeps the
    /// message in the slot and retries when resumed. A closed channel yields
    /// [`SendError::Closed`] and leaves the message in the slot.
    pub fn send(&self, message: &mut Option<T>) -> Flow<Result<(), SendError>> {
        let _usage = self.enter(Role::Producer);
        let policy = self.inner.config.overflow;
        if policy == OverflowPolicy::Block {
            clear_wakeup();
        }
        let me = Strand::current();
        loop {
            let Some(pending) = message.take() else {
                return Flow::Complete(Ok(()));
            };
            if self.is_closed() {
                *message = Some(pending);
                self.inner.senders.unregister(&me);
                return Flow::Complete(Err(SendError::Closed));
            }
            if policy == OverflowPolicy::Displace {
                self.displace(pending);
                return Flow::Complete(Ok(()));
            }
            match self.offer(pending) {
                Ok(()) => {
                    if policy == OverflowPolicy::Block {
                        self.inner.senders.unregister(&me);
                    }
                    self.inner.receivers.signal_all();
                    return Flow::Complete(Ok(()));
                }
                Err(pending) => {
                    *message = Some(pending);
                    if policy == OverflowPolicy::Throw {
                        let capacity = self.inner.buffer.capacity().unwrap_or(usize::MAX);
                        return Flow::Complete(Err(SendError::CapacityExceeded(capacity)));
                    }
                    self.inner.senders.register(&me);
                    if self.has_room() || self.is_closed() {
                        continue;
                    }
                    crate::flow!(self.inner.senders.await_until(None));
                }
            }
        }
    }

    /// Send from a plain thread, blocking it while the channel is full
    pub fn send_blocking(&self, message: T) -> Result<(), SendError> {
        if Fiber::current().is_some() {
            return Err(SendError::InFiber);
        }
        let mut slot = Some(message);
        match self.send(&mut slot) {
            Flow::Complete(result) => result,
            Flow::Suspend(_) => Err(SendError::InFiber),
        }
    }

    /// Receive without waiting. `None` when empty or closed and drained.
    pub fn try_receive(&self) -> Option<T> {
        let _usage = self.enter(Role::Consumer);
        let message = self.inner.buffer.pop();
        if message.is_some() {
            self.inner.senders.signal_all();
        }
        message
    }

    /// Receive, parking while the channel is empty and open
    pub fn receive(&self) -> Flow<Received<T>> {
        self.receive_until(None)
    }

    /// Receive, parking until a message arrives, the channel closes, or
    /// `deadline` passes
    pub fn receive_until(&self, deadline: Option<Instant>) -> Flow<Received<T>> {
        let _usage = self.enter(Role::Consumer);
        clear_wakeup();
        let me = Strand::current();
        loop {
            if let Some(message) = self.inner.buffer.pop() {
                self.inner.receivers.unregister(&me);
                self.inner.senders.signal_all();
                return Flow::Complete(Received::Message(message));
            }
            if self.is_closed() {
                self.inner.receivers.unregister(&me);
                // a send may have landed between the pop and the close check
                return Flow::Complete(match self.inner.buffer.pop() {
                    Some(message) => Received::Message(message),
                    None => Received::Closed,
                });
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.inner.receivers.unregister(&me);
                return Flow::Complete(Received::TimedOut);
            }
            self.watch_receive(&me);
            if self.inner.buffer.len() > 0 || self.is_closed() {
                continue;
            }
            crate::flow!(self.inner.receivers.await_until(deadline));
        }
    }

    /// Receive from a plain thread, blocking it while the channel is empty
    pub fn receive_blocking(&self) -> Result<Received<T>, ReceiveError> {
        self.receive_on_thread(None)
    }

    /// Receive from a plain thread with a timeout
    pub fn receive_timeout_blocking(&self, timeout: Duration) -> Result<Received<T>, ReceiveError> {
        self.receive_on_thread(Some(Instant::now() + timeout))
    }

    fn receive_on_thread(&self, deadline: Option<Instant>) -> Result<Received<T>, ReceiveError> {
        if Fiber::current().is_some() {
            return Err(ReceiveError::InFiber);
        }
        match self.receive_until(deadline) {
            Flow::Complete(received) => Ok(received),
            Flow::Suspend(_) => Err(ReceiveError::InFiber),
        }
    }

    /// Stop accepting sends. Queued messages stay receivable. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::trace!(queued = self.len(), "channel closed");
            self.inner.receivers.signal_all();
            self.inner.senders.signal_all();
        }
    }

    /// Whether [`Channel::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Whether no message is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer bound, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.inner.buffer.capacity()
    }

    /// Construction parameters
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Whether two handles refer to the same channel
    pub fn same_channel(&self, other: &Channel<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether this is a capacity-0 transfer channel
    pub fn is_transfer(&self) -> bool {
        self.inner.buffer.is_transfer()
    }

    /// Receive step of a select: a message, or end-of-stream, if either is
    /// available now
    pub(super) fn poll_receive(&self) -> Option<Received<T>> {
        if let Some(message) = self.inner.buffer.pop() {
            self.inner.senders.signal_all();
            return Some(Received::Message(message));
        }
        if self.is_closed() {
            return Some(match self.inner.buffer.pop() {
                Some(message) => Received::Message(message),
                None => Received::Closed,
            });
        }
        None
    }

    /// Send step of a select. `None` when the message has to wait; the
    /// message then stays in `message`.
    pub(super) fn poll_send(&self, message: &mut Option<T>) -> Option<Result<(), SendError>> {
        let pending = message.take()?;
        if self.is_closed() {
            *message = Some(pending);
            return Some(Err(SendError::Closed));
        }
        if self.inner.config.overflow == OverflowPolicy::Displace {
            self.displace(pending);
            return Some(Ok(()));
        }
        match self.offer(pending) {
            Ok(()) => {
                self.inner.receivers.signal_all();
                Some(Ok(()))
            }
            Err(pending) => {
                *message = Some(pending);
                match self.inner.config.overflow {
                    OverflowPolicy::Throw => {
                        let capacity = self.inner.buffer.capacity().unwrap_or(usize::MAX);
                        Some(Err(SendError::CapacityExceeded(capacity)))
                    }
                    _ => None,
                }
            }
        }
    }

    /// Register `strand` as a waiting receiver. On a transfer channel this
    /// is what lets a sender hand a message over, so blocked senders are
    /// woken.
    pub(super) fn watch_receive(&self, strand: &Strand) {
        self.inner.receivers.register(strand);
        if self.is_transfer() {
            self.inner.senders.signal_all();
        }
    }

    pub(super) fn unwatch_receive(&self, strand: &Strand) {
        self.inner.receivers.unregister(strand);
    }

    pub(super) fn watch_send(&self, strand: &Strand) {
        self.inner.senders.register(strand);
    }

    pub(super) fn unwatch_send(&self, strand: &Strand) {
        self.inner.senders.unregister(strand);
    }

    /// Queue `message`. A transfer channel accepts it only while more
    /// receivers are waiting than messages are already handed over.
    fn offer(&self, message: T) -> Result<(), T> {
        if !self.is_transfer() {
            return self.inner.buffer.push(message);
        }
        let _handoff = self.inner.handoff.lock();
        if self.inner.receivers.waiter_count() > self.inner.buffer.len() {
            self.inner.buffer.push(message)
        } else {
            Err(message)
        }
    }

    fn has_room(&self) -> bool {
        if self.is_transfer() {
            self.inner.receivers.waiter_count() > self.inner.buffer.len()
        } else {
            !self.inner.buffer.is_full()
        }
    }

    fn displace(&self, message: T) {
        if self.inner.buffer.force_push(message).is_some() {
            tracing::trace!("channel full, oldest message displaced");
        }
        self.inner.receivers.signal_all();
    }

    fn enter(&self, role: Role) -> Usage<'_> {
        let config = &self.inner.config;
        let (counter, single) = match role {
            Role::Producer => (&self.inner.producers, config.single_producer),
            Role::Consumer => (&self.inner.consumers, config.single_consumer),
        };
        if !config.checked {
            return Usage { counter: None };
        }
        let active = counter.fetch_add(1, Ordering::AcqRel) + 1;
        if single && active > 1 {
            counter.fetch_sub(1, Ordering::AcqRel);
            panic!(
                "channel declared single-{} is used by {} strands concurrently",
                role.name(),
                active
            );
        }
        Usage { counter: Some(counter) }
    }
}

#[derive(Clone, Copy)]
enum Role {
    Producer,
    Consumer,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }
}

struct Usage<'a> {
    counter: Option<&'a AtomicUsize>,
}

impl Drop for Usage<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.counter {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
