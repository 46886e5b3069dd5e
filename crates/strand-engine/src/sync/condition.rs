//! Multi-waiter condition synchronizer
//!
//! Waiters register, re-check their condition, then park. A signal that
//! arrives between the re-check and the park is kept as the strand's permit,
//! so the waiter's park returns at once.

use crate::fiber::{park_until, ExecutionUnit, Flow, Strand};
use parking_lot::Mutex;
use std::time::Instant;

/// Condition gate that any number of strands can wait on.
pub struct ConditionSynchronizer {
    name: &'static str,
    waiters: Mutex<Vec<Strand>>,
}

impl ConditionSynchronizer {
    /// Create a synchronizer; `name` is recorded as the park blocker
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Add `strand` to the waiters (once)
    pub fn register(&self, strand: &Strand) {
        let id = strand.strand_id();
        let mut waiters = self.waiters.lock();
        if !waiters.iter().any(|w| w.strand_id() == id) {
            waiters.push(strand.clone());
        }
    }

    /// Remove `strand` from the waiters
    pub fn unregister(&self, strand: &Strand) {
        let id = strand.strand_id();
        self.waiters.lock().retain(|w| w.strand_id() != id);
    }

    /// Park the current strand until signalled or `deadline` passes
    pub fn await_until(&self, deadline: Option<Instant>) -> Flow<()> {
        park_until(self.name, deadline)
    }

    /// Wake the first registered waiter
    pub fn signal(&self) {
        let first = self.waiters.lock().first().cloned();
        if let Some(strand) = first {
            strand.unpark();
        }
    }

    /// Wake every registered waiter
    pub fn signal_all(&self) {
        let waiters: Vec<Strand> = self.waiters.lock().clone();
        for strand in waiters {
            strand.unpark();
        }
    }

    /// Number of registered waiters
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Blocker name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for ConditionSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionSynchronizer")
            .field("name", &self.name)
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_register_is_idempotent() {
        let sync = ConditionSynchronizer::new("test");
        let me = Strand::current();
        sync.register(&me);
        sync.register(&me);
        assert_eq!(sync.waiter_count(), 1);
        sync.unregister(&me);
        assert_eq!(sync.waiter_count(), 0);
    }

    #[test]
    fn test_signal_wakes_waiting_thread() {
        let sync = Arc::new(ConditionSynchronizer::new("gate"));
        let ready = Arc::new(AtomicBool::new(false));

        let waiter = {
            let sync = sync.clone();
            let ready = ready.clone();
            thread::spawn(move || {
                let me = Strand::current();
                let deadline = Instant::now() + Duration::from_secs(5);
                while !ready.load(Ordering::Acquire) && Instant::now() < deadline {
                    sync.register(&me);
                    if ready.load(Ordering::Acquire) {
                        break;
                    }
                    let _ = sync.await_until(Some(deadline));
                }
                sync.unregister(&me);
                ready.load(Ordering::Acquire)
            })
        };

        thread::sleep(Duration::from_millis(10));
        ready.store(true, Ordering::Release);
        sync.signal_all();
        assert!(waiter.join().unwrap());
    }
}
