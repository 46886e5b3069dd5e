//! Channels: message queues fibers and threads can block on
//!
//! A channel is configured once at construction with a capacity, an
//! overflow policy, and single-producer/single-consumer hints. Blocking
//! operations park the current strand, so the same channel connects fibers,
//! threads, or a mix of both. A capacity of 0 makes a transfer channel: a
//! send completes only once a waiting receiver has been matched with it.
//! [`Selector`] waits on several channels at once.

#[allow(clippy::module_inception)]
mod channel;
mod queue;
mod select;

pub use channel::Channel;
pub use select::{Selected, Selector};

use crate::fiber::StrandError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a send does when a bounded channel is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// The sender parks until space frees up or the channel closes
    #[default]
    Block,
    /// The send fails at once with [`SendError::CapacityExceeded`]
    Throw,
    /// The oldest queued message is evicted to make room
    Displace,
}

/// Buffer size of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capacity {
    /// At most this many queued messages; 0 is a synchronous transfer
    Bounded(usize),
    /// No limit; sends never wait
    Unbounded,
}

/// Channel construction parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Buffer size
    pub capacity: Capacity,
    /// Full-buffer behavior
    pub overflow: OverflowPolicy,
    /// Only one strand ever sends (caller's promise)
    pub single_producer: bool,
    /// Only one strand ever receives (caller's promise)
    pub single_consumer: bool,
    /// Detect broken single-producer/single-consumer promises at runtime
    pub checked: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: Capacity::Unbounded,
            overflow: OverflowPolicy::Block,
            single_producer: false,
            single_consumer: true,
            checked: false,
        }
    }
}

impl ChannelConfig {
    /// Bounded channel with the default policy
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Capacity::Bounded(capacity),
            ..Self::default()
        }
    }

    /// Unbounded channel
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Transfer (rendezvous) channel
    pub fn transfer() -> Self {
        Self::bounded(0)
    }

    /// Set the overflow policy
    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    /// Declare a single producer
    pub fn single_producer(mut self, single: bool) -> Self {
        self.single_producer = single;
        self
    }

    /// Declare a single consumer
    pub fn single_consumer(mut self, single: bool) -> Self {
        self.single_consumer = single;
        self
    }

    /// Enable concurrent-use detection
    pub fn checked(mut self, checked: bool) -> Self {
        self.checked = checked;
        self
    }

    /// Reject combinations the channel cannot honor
    pub fn validate(&self) -> Result<(), ChannelConfigError> {
        match (self.capacity, self.overflow) {
            (Capacity::Bounded(0), OverflowPolicy::Displace) => Err(ChannelConfigError::DisplaceTransfer),
            (Capacity::Unbounded, OverflowPolicy::Displace) => Err(ChannelConfigError::DisplaceUnbounded),
            (_, OverflowPolicy::Displace) if !self.single_consumer => {
                Err(ChannelConfigError::DisplaceMultipleConsumers)
            }
            _ => Ok(()),
        }
    }
}

/// Invalid channel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelConfigError {
    /// A transfer channel has no buffer to evict from
    #[error("the displace policy requires a capacity of at least 1")]
    DisplaceTransfer,

    /// Eviction needs a bound
    #[error("the displace policy requires a bounded channel")]
    DisplaceUnbounded,

    /// Eviction races with concurrent receivers
    #[error("the displace policy is only supported with a single consumer")]
    DisplaceMultipleConsumers,
}

/// Failed send
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The channel was closed, before or while the sender waited
    #[error("channel is closed")]
    Closed,

    /// THROW policy on a full channel
    #[error("channel capacity of {0} exceeded")]
    CapacityExceeded(usize),

    /// A thread-blocking call was made from inside a fiber
    #[error("thread-blocking channel operation called from inside a fiber")]
    InFiber,

    /// Park protocol violated
    #[error(transparent)]
    Strand(#[from] StrandError),
}

/// Failed non-blocking send; the message is handed back
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrySendError<T> {
    /// No room in the buffer
    #[error("channel is full")]
    Full(T),

    /// Channel closed
    #[error("channel is closed")]
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the message
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(m) | TrySendError::Closed(m) => m,
        }
    }
}

/// Thread-blocking receive refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReceiveError {
    /// A thread-blocking call was made from inside a fiber
    #[error("thread-blocking channel operation called from inside a fiber")]
    InFiber,
}

/// Outcome of a receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received<T> {
    /// A message
    Message(T),
    /// The channel is closed and drained
    Closed,
    /// The deadline passed with nothing to receive
    TimedOut,
}

impl<T> Received<T> {
    /// The message, if one was received
    pub fn message(self) -> Option<T> {
        match self {
            Received::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Whether this marks end-of-stream
    pub fn is_closed(&self) -> bool {
        matches!(self, Received::Closed)
    }

    /// Whether this marks a timeout
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Received::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(ChannelConfig::transfer().validate().is_ok());
        assert_eq!(
            ChannelConfig::transfer().overflow(OverflowPolicy::Displace).validate(),
            Err(ChannelConfigError::DisplaceTransfer)
        );
        assert_eq!(
            ChannelConfig::unbounded().overflow(OverflowPolicy::Displace).validate(),
            Err(ChannelConfigError::DisplaceUnbounded)
        );
        assert_eq!(
            ChannelConfig::bounded(3)
                .overflow(OverflowPolicy::Displace)
                .single_consumer(false)
                .validate(),
            Err(ChannelConfigError::DisplaceMultipleConsumers)
        );
        assert!(ChannelConfig::bounded(3).overflow(OverflowPolicy::Displace).validate().is_ok());
    }

    #[test]
    fn test_config_from_toml_like_json() {
        let config: ChannelConfig =
            serde_json::from_str(r#"{"capacity":{"bounded":8},"overflow":"throw"}"#).unwrap();
        assert_eq!(config.capacity, Capacity::Bounded(8));
        assert_eq!(config.overflow, OverflowPolicy::Throw);
        assert!(config.single_consumer);
    }
}
