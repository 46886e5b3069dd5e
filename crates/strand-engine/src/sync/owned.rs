//! Single-owner synchronizer
//!
//! Only the owning strand may wait; anyone may signal. The owner kind
//! (thread, fiber, or either) is fixed by the type parameter chosen at
//! construction.

use crate::fiber::{ExecutionUnit, Flow, Strand, StrandError};
use std::time::Instant;

/// Condition owned by one strand.
#[derive(Debug, Clone)]
pub struct OwnedSynchronizer<S: ExecutionUnit = Strand> {
    owner: S,
}

impl<S: ExecutionUnit> OwnedSynchronizer<S> {
    /// Create a synchronizer owned by `owner`
    pub fn new(owner: S) -> Self {
        Self { owner }
    }

    /// The owning strand
    pub fn owner(&self) -> &S {
        &self.owner
    }

    /// Whether the caller is the owner
    pub fn verify_owner(&self) -> bool {
        Strand::current().strand_id() == self.owner.strand_id()
    }

    /// Whether the owner can still be woken
    pub fn is_owner_alive(&self) -> bool {
        self.owner.is_alive()
    }

    /// Wait for a signal. Must be called by the owner.
    pub fn await_signal(&self) -> Flow<Result<(), StrandError>> {
        self.await_until(None)
    }

    /// Wait for a signal or until `deadline`. Must be called by the owner.
    pub fn await_until(&self, deadline: Option<Instant>) -> Flow<Result<(), StrandError>> {
        if !self.verify_owner() {
            return Flow::Complete(Err(StrandError::NotCurrent {
                target: self.owner.strand_id(),
                caller: Strand::current().strand_id(),
            }));
        }
        self.owner.park("owned-synchronizer", deadline)
    }

    /// Wake the owner
    pub fn signal(&self) {
        self.owner.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{Fiber, FiberState, ThreadStrand};
    use crate::value::Value;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_thread_owned_signal() {
        let sync = Arc::new(OwnedSynchronizer::new(ThreadStrand::current()));
        let signaller = {
            let sync = sync.clone();
            thread::spawn(move || sync.signal())
        };
        signaller.join().unwrap();
        // the permit left by signal makes this return immediately
        let outcome = sync.await_until(Some(Instant::now() + Duration::from_secs(5)));
        assert_eq!(outcome.complete(), Some(Ok(())));
    }

    #[test]
    fn test_non_owner_cannot_wait() {
        let sync = Arc::new(OwnedSynchronizer::new(ThreadStrand::current()));
        let outcome = {
            let sync = sync.clone();
            thread::spawn(move || sync.await_signal().complete()).join().unwrap()
        };
        assert!(matches!(outcome, Some(Err(StrandError::NotCurrent { .. }))));
    }

    #[test]
    fn test_fiber_owned_suspends_until_signal() {
        let cell: Arc<parking_lot::Mutex<Option<OwnedSynchronizer<Fiber>>>> = Arc::default();
        let inner = cell.clone();
        let fiber = Fiber::new("owner", move |_| {
            let sync = inner.lock().clone();
            if let Some(sync) = sync {
                if let Err(e) = crate::flow!(sync.await_signal()) {
                    return Flow::Complete(Err(e.into()));
                }
            }
            Flow::Complete(Ok(Value::Int(1)))
        });
        let sync = OwnedSynchronizer::new(fiber.clone());
        *cell.lock() = Some(sync.clone());

        assert_eq!(fiber.exec().unwrap(), FiberState::Suspended);
        assert!(sync.is_owner_alive());
        sync.signal();
        assert_eq!(fiber.exec().unwrap(), FiberState::Finished);
        assert!(!sync.is_owner_alive());
    }
}
