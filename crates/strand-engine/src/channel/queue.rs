//! Lock-free message buffers backing a channel.

use super::Capacity;
use crossbeam::queue::{ArrayQueue, SegQueue};

pub(super) enum Buffer<T> {
    Bounded(ArrayQueue<T>),
    Unbounded(SegQueue<T>),
    /// Capacity 0; holds only messages already matched with a waiting receiver
    Transfer(SegQueue<T>),
}

impl<T> Buffer<T> {
    pub(super) fn new(capacity: Capacity) -> Self {
        match capacity {
            Capacity::Bounded(0) => Buffer::Transfer(SegQueue::new()),
            Capacity::Bounded(n) => Buffer::Bounded(ArrayQueue::new(n)),
            Capacity::Unbounded => Buffer::Unbounded(SegQueue::new()),
        }
    }

    /// Enqueue, handing the message back when full
    pub(super) fn push(&self, message: T) -> Result<(), T> {
        match self {
            Buffer::Bounded(q) => q.push(message),
            Buffer::Unbounded(q) | Buffer::Transfer(q) => {
                q.push(message);
                Ok(())
            }
        }
    }

    /// Enqueue, evicting and returning the oldest message when full
    pub(super) fn force_push(&self, message: T) -> Option<T> {
        match self {
            Buffer::Bounded(q) => q.force_push(message),
            Buffer::Unbounded(q) | Buffer::Transfer(q) => {
                q.push(message);
                None
            }
        }
    }

    pub(super) fn pop(&self) -> Option<T> {
        match self {
            Buffer::Bounded(q) => q.pop(),
            Buffer::Unbounded(q) | Buffer::Transfer(q) => q.pop(),
        }
    }

    pub(super) fn len(&self) -> usize {
        match self {
            Buffer::Bounded(q) => q.len(),
            Buffer::Unbounded(q) | Buffer::Transfer(q) => q.len(),
        }
    }

    pub(super) fn is_full(&self) -> bool {
        match self {
            Buffer::Bounded(q) => q.is_full(),
            Buffer::Unbounded(_) | Buffer::Transfer(_) => false,
        }
    }

    pub(super) fn capacity(&self) -> Option<usize> {
        match self {
            Buffer::Bounded(q) => Some(q.capacity()),
            Buffer::Unbounded(_) => None,
            Buffer::Transfer(_) => Some(0),
        }
    }

    pub(super) fn is_transfer(&self) -> bool {
        matches!(self, Buffer::Transfer(_))
    }
}
