//! Waiting on several channel operations at once
//!
//! A [`Selector`] holds a list of receive and send actions and performs
//! exactly one of them. Without priority the actions are tried from a random
//! starting point so that no channel starves the others.

use super::channel::Channel;
use super::{ReceiveError, Received, SendError};
use crate::fiber::{clear_wakeup, park_until, Fiber, Flow, Strand};
use rand::Rng;
use std::time::{Duration, Instant};

enum Action<T> {
    Receive(Channel<T>),
    Send(Channel<T>, Option<T>),
}

/// The action a select performed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selected<T> {
    /// Receive action `index` got a message or end-of-stream
    Received(usize, Received<T>),
    /// Send action `index` queued its message
    Sent(usize),
    /// Send action `index` failed; its message stays in the selector
    SendFailed(usize, SendError),
    /// The deadline passed before any action could complete
    TimedOut,
}

impl<T> Selected<T> {
    /// Index of the performed action, `None` on timeout
    pub fn index(&self) -> Option<usize> {
        match self {
            Selected::Received(i, _) | Selected::Sent(i) | Selected::SendFailed(i, _) => Some(*i),
            Selected::TimedOut => None,
        }
    }
}

/// Chooses one ready operation among several channels.
///
/// Keep the selector across resumptions of a fiber, like the slot passed to
/// [`Channel::send`]: a send action's message lives in the selector until it
/// is queued.
pub struct Selector<T> {
    actions: Vec<Action<T>>,
    priority: bool,
}

impl<T> Default for Selector<T> {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            priority: false,
        }
    }
}

impl<T> std::fmt::Debug for Selector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("actions", &self.actions.len())
            .field("priority", &self.priority)
            .finish()
    }
}

impl<T: Send> Selector<T> {
    /// Empty selector with random tie-breaking
    pub fn new() -> Self {
        Self::default()
    }

    /// When several actions are ready, perform the first one listed
    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Add a receive action
    pub fn receive(mut self, channel: &Channel<T>) -> Self {
        self.actions.push(Action::Receive(channel.clone()));
        self
    }

    /// Add a send action
    pub fn send(mut self, channel: &Channel<T>, message: T) -> Self {
        self.actions.push(Action::Send(channel.clone(), Some(message)));
        self
    }

    /// Number of actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no action was added
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Take back the message of send action `index` if it was not sent
    pub fn take_message(&mut self, index: usize) -> Option<T> {
        match self.actions.get_mut(index) {
            Some(Action::Send(_, message)) => message.take(),
            _ => None,
        }
    }

    /// Perform one ready action without waiting
    pub fn try_select(&mut self) -> Option<Selected<T>> {
        let n = self.actions.len();
        if n == 0 {
            return None;
        }
        let start = if self.priority { 0 } else { rand::thread_rng().gen_range(0..n) };
        for offset in 0..n {
            let index = (start + offset) % n;
            let selected = match &mut self.actions[index] {
                Action::Receive(channel) => channel
                    .poll_receive()
                    .map(|received| Selected::Received(index, received)),
                Action::Send(channel, message) => channel.poll_send(message).map(|result| match result {
                    Ok(()) => Selected::Sent(index),
                    Err(error) => Selected::SendFailed(index, error),
                }),
            };
            if selected.is_some() {
                return selected;
            }
        }
        None
    }

    /// Perform one action, parking until one is ready
    pub fn select(&mut self) -> Flow<Selected<T>> {
        self.select_until(None)
    }

    /// Perform one action, parking until one is ready or `deadline` passes
    pub fn select_until(&mut self, deadline: Option<Instant>) -> Flow<Selected<T>> {
        clear_wakeup();
        let me = Strand::current();
        loop {
            if let Some(selected) = self.try_select() {
                self.unwatch(&me);
                return Flow::Complete(selected);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.unwatch(&me);
                return Flow::Complete(Selected::TimedOut);
            }
            self.watch(&me);
            if let Some(selected) = self.try_select() {
                self.unwatch(&me);
                return Flow::Complete(selected);
            }
            crate::flow!(park_until("select", deadline));
        }
    }

    /// Select from a plain thread, blocking it until an action is ready
    pub fn select_blocking(&mut self) -> Result<Selected<T>, ReceiveError> {
        self.select_on_thread(None)
    }

    /// Select from a plain thread with a timeout
    pub fn select_timeout_blocking(&mut self, timeout: Duration) -> Result<Selected<T>, ReceiveError> {
        self.select_on_thread(Some(Instant::now() + timeout))
    }

    fn select_on_thread(&mut self, deadline: Option<Instant>) -> Result<Selected<T>, ReceiveError> {
        if Fiber::current().is_some() {
            return Err(ReceiveError::InFiber);
        }
        match self.select_until(deadline) {
            Flow::Complete(selected) => Ok(selected),
            Flow::Suspend(_) => Err(ReceiveError::InFiber),
        }
    }

    fn watch(&self, me: &Strand) {
        for action in &self.actions {
            match action {
                Action::Receive(channel) => channel.watch_receive(me),
                Action::Send(channel, Some(_)) => channel.watch_send(me),
                Action::Send(_, None) => {}
            }
        }
    }

    fn unwatch(&self, me: &Strand) {
        for action in &self.actions {
            match action {
                Action::Receive(channel) => channel.unwatch_receive(me),
                Action::Send(channel, _) => channel.unwatch_send(me),
            }
        }
    }
}
