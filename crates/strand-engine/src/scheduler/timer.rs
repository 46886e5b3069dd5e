//! Timer thread for timed parks
//!
//! Instead of polling parked fibers, this thread waits for the earliest
//! deadline using condvar timeouts and wakes the fiber when it passes.
//! Entries are keyed by deadline, fiber and park sequence number: a park
//! that ends early removes its entry, and an entry whose park already ended
//! is ignored when it fires.

use crate::fiber::{Fiber, FiberId};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Timer key; the map's first entry is the earliest deadline
type TimerKey = (Instant, FiberId, u64);

/// Timer thread waking fibers whose park deadline passed
pub struct TimerThread {
    pending: Mutex<BTreeMap<TimerKey, Fiber>>,
    notify: Condvar,
    shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    /// Create a stopped timer
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(BTreeMap::new()),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Start the timer thread
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let timer = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("strand-timer".to_string())
            .spawn(move || timer.run_loop())?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop and join the timer thread
    pub fn stop(&self) {
        self.shutdown.store(true, AtomicOrdering::Release);
        {
            let _pending = self.pending.lock();
            self.notify.notify_one();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        self.pending.lock().clear();
    }

    /// Wake `fiber` at `wake_at` unless its park numbered `seq` ends first
    pub fn register(&self, fiber: Fiber, wake_at: Instant, seq: u64) {
        let mut pending = self.pending.lock();
        pending.insert((wake_at, fiber.id(), seq), fiber);
        // the new entry may be earlier than the one being waited on
        self.notify.notify_one();
    }

    /// Remove the entry of a park that ended before its deadline
    pub fn cancel(&self, fiber_id: FiberId, wake_at: Instant, seq: u64) {
        self.pending.lock().remove(&(wake_at, fiber_id, seq));
    }

    /// Number of pending deadlines
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn run_loop(&self) {
        loop {
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let mut pending = self.pending.lock();

            // stop() may have notified between the check above and the lock
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            while pending.first_key_value().is_some_and(|(key, _)| key.0 <= now) {
                if let Some(((_, _, seq), fiber)) = pending.pop_first() {
                    due.push((fiber, seq));
                }
            }

            if !due.is_empty() {
                drop(pending);
                for (fiber, seq) in due {
                    if !fiber.unpark_timed(seq) {
                        tracing::trace!(fiber = %fiber.id(), seq, "stale park deadline ignored");
                    }
                }
                continue;
            }

            match pending.first_key_value().map(|(key, _)| key.0) {
                Some(wake_at) => {
                    let now = Instant::now();
                    if wake_at > now {
                        self.notify.wait_for(&mut pending, wake_at - now);
                    }
                }
                None => self.notify.wait(&mut pending),
            }
        }

        tracing::debug!("timer thread shutting down");
    }
}
