//! Execution units
//!
//! A strand is either an OS thread or a fiber. Synchronizers talk to both
//! through [`ExecutionUnit`]: parking a thread blocks it, parking a fiber
//! suspends it and frees its worker.

use super::fiber::{Fiber, FiberId};
use super::flow::Flow;
use std::fmt;
use std::thread::{self, Thread, ThreadId};
use std::time::Instant;
use thiserror::Error;

/// Identity of a strand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrandId {
    /// An OS thread
    Thread(ThreadId),
    /// A fiber
    Fiber(FiberId),
}

impl fmt::Display for StrandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrandId::Thread(id) => write!(f, "thread {:?}", id),
            StrandId::Fiber(id) => write!(f, "fiber {}", id),
        }
    }
}

/// Strand protocol violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrandError {
    /// Only a strand can park itself
    #[error("{target} can only be parked by itself, not by {caller}")]
    NotCurrent {
        /// Strand asked to park
        target: StrandId,
        /// Strand that asked
        caller: StrandId,
    },

    /// A fiber-only primitive was called on a plain thread
    #[error("not running in a fiber")]
    NotInFiber,
}

/// Park/unpark capability shared by threads and fibers.
pub trait ExecutionUnit: Clone + Send + Sync + 'static {
    /// Identity
    fn strand_id(&self) -> StrandId;

    /// Wake the strand if parked, or let its next park return at once
    fn unpark(&self);

    /// Whether the strand can still make progress
    fn is_alive(&self) -> bool;

    /// Whether this is a fiber
    fn is_fiber(&self) -> bool;

    /// Park the calling strand, which must be `self`, until unparked or
    /// until `deadline`. Spurious returns are allowed; callers re-check
    /// their condition.
    fn park(&self, blocker: &str, deadline: Option<Instant>) -> Flow<Result<(), StrandError>>;
}

/// An OS thread as a strand
#[derive(Debug, Clone)]
pub struct ThreadStrand {
    thread: Thread,
}

impl ThreadStrand {
    /// The calling thread
    pub fn current() -> Self {
        Self { thread: thread::current() }
    }
}

impl ExecutionUnit for ThreadStrand {
    fn strand_id(&self) -> StrandId {
        StrandId::Thread(self.thread.id())
    }

    fn unpark(&self) {
        self.thread.unpark();
    }

    fn is_alive(&self) -> bool {
        true
    }

    fn is_fiber(&self) -> bool {
        false
    }

    fn park(&self, _blocker: &str, deadline: Option<Instant>) -> Flow<Result<(), StrandError>> {
        let caller = thread::current().id();
        if caller != self.thread.id() || Fiber::current().is_some() {
            return Flow::Complete(Err(StrandError::NotCurrent {
                target: self.strand_id(),
                caller: current_id(),
            }));
        }
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    thread::park_timeout(deadline - now);
                }
            }
            None => thread::park(),
        }
        Flow::Complete(Ok(()))
    }
}

impl ExecutionUnit for Fiber {
    fn strand_id(&self) -> StrandId {
        StrandId::Fiber(self.id())
    }

    fn unpark(&self) {
        Fiber::unpark(self);
    }

    fn is_alive(&self) -> bool {
        Fiber::is_alive(self)
    }

    fn is_fiber(&self) -> bool {
        true
    }

    fn park(&self, blocker: &str, deadline: Option<Instant>) -> Flow<Result<(), StrandError>> {
        match Fiber::current() {
            Some(current) if current.same_fiber(self) => self.park_current(blocker, deadline).map(Ok),
            _ => Flow::Complete(Err(StrandError::NotCurrent {
                target: self.strand_id(),
                caller: current_id(),
            })),
        }
    }
}

/// Either kind of execution unit
#[derive(Debug, Clone)]
pub enum Strand {
    /// An OS thread
    Thread(ThreadStrand),
    /// A fiber
    Fiber(Fiber),
}

impl Strand {
    /// The running fiber, or else the calling thread
    pub fn current() -> Self {
        match Fiber::current() {
            Some(fiber) => Strand::Fiber(fiber),
            None => Strand::Thread(ThreadStrand::current()),
        }
    }
}

impl ExecutionUnit for Strand {
    fn strand_id(&self) -> StrandId {
        match self {
            Strand::Thread(t) => t.strand_id(),
            Strand::Fiber(f) => f.strand_id(),
        }
    }

    fn unpark(&self) {
        match self {
            Strand::Thread(t) => t.unpark(),
            Strand::Fiber(f) => ExecutionUnit::unpark(f),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Strand::Thread(t) => t.is_alive(),
            Strand::Fiber(f) => ExecutionUnit::is_alive(f),
        }
    }

    fn is_fiber(&self) -> bool {
        matches!(self, Strand::Fiber(_))
    }

    fn park(&self, blocker: &str, deadline: Option<Instant>) -> Flow<Result<(), StrandError>> {
        match self {
            Strand::Thread(t) => t.park(blocker, deadline),
            Strand::Fiber(f) => ExecutionUnit::park(f, blocker, deadline),
        }
    }
}

impl From<Fiber> for Strand {
    fn from(fiber: Fiber) -> Self {
        Strand::Fiber(fiber)
    }
}

impl From<ThreadStrand> for Strand {
    fn from(thread: ThreadStrand) -> Self {
        Strand::Thread(thread)
    }
}

fn current_id() -> StrandId {
    Strand::current().strand_id()
}

/// Park the current strand until unparked.
///
/// On a fiber this suspends; the call returns once the fiber has been
/// resumed. On a thread it blocks.
pub fn park(blocker: &str) -> Flow<()> {
    park_until(blocker, None)
}

/// Park the current strand until unparked or `deadline` passes.
pub fn park_until(blocker: &str, deadline: Option<Instant>) -> Flow<()> {
    match Fiber::current() {
        Some(fiber) => fiber.park_current(blocker, deadline),
        None => {
            // the calling thread always parks itself
            let _ = crate::flow!(ThreadStrand::current().park(blocker, deadline));
            Flow::Complete(())
        }
    }
}

/// Let other fibers run. On a thread this is `std::thread::yield_now`.
pub fn yield_now() -> Flow<()> {
    match Fiber::current() {
        Some(fiber) => fiber.yield_current(),
        None => {
            thread::yield_now();
            Flow::Complete(())
        }
    }
}

/// Suspend the current fiber until `deadline`. Fails on a plain thread.
pub fn sleep_until(deadline: Instant) -> Flow<Result<(), StrandError>> {
    let Some(fiber) = Fiber::current() else {
        return Flow::Complete(Err(StrandError::NotInFiber));
    };
    fiber.take_wakeup();
    while Instant::now() < deadline {
        crate::flow!(fiber.park_current("sleep", Some(deadline)));
    }
    Flow::Complete(Ok(()))
}

/// Drop a pending resume token of the current fiber. Suspending loops call
/// this on entry so a token left by their own last suspension cannot make a
/// later park return early.
pub(crate) fn clear_wakeup() {
    if let Some(fiber) = Fiber::current() {
        fiber.take_wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_current_outside_fiber_is_thread() {
        let strand = Strand::current();
        assert!(!strand.is_fiber());
        assert_eq!(strand.strand_id(), StrandId::Thread(thread::current().id()));
    }

    #[test]
    fn test_thread_park_until_deadline_returns() {
        let start = Instant::now();
        let _ = park_until("timed", Some(start + Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[test]
    fn test_thread_unpark_wakes_parked_thread() {
        let woke = Arc::new(AtomicBool::new(false));
        let flag = woke.clone();
        let handle = thread::spawn(move || {
            let strand = ThreadStrand::current();
            let _ = strand.park("wait", Some(Instant::now() + Duration::from_secs(5)));
            flag.store(true, Ordering::SeqCst);
        });
        let strand = ThreadStrand { thread: handle.thread().clone() };
        strand.unpark();
        handle.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn test_foreign_thread_cannot_park_another() {
        let other = thread::spawn(ThreadStrand::current).join().unwrap();
        let outcome = other.park("nope", None).complete().unwrap();
        assert!(matches!(outcome, Err(StrandError::NotCurrent { .. })));
    }

    #[test]
    fn test_sleep_requires_fiber() {
        assert_eq!(
            sleep_until(Instant::now()).complete(),
            Some(Err(StrandError::NotInFiber))
        );
    }
}
