//! Worker thread that executes fibers
//!
//! Workers pick up fibers from their local deque, steal from other workers,
//! or take a batch from the global injector, then run one step of each.

use super::scheduler::SchedulerShared;
use crate::fiber::Fiber;
use crossbeam_deque::{Steal, Stealer, Worker as CWorker};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Worker thread that executes fibers
pub(crate) struct Worker {
    id: usize,
    stealers: Vec<Stealer<Fiber>>,
    shared: Arc<SchedulerShared>,
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    /// Create a new Worker
    pub(crate) fn new(id: usize, stealers: Vec<Stealer<Fiber>>, shared: Arc<SchedulerShared>) -> Self {
        Self {
            id,
            stealers,
            shared,
            handle: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the worker thread on its own deque
    pub(crate) fn start(&mut self, deque: CWorker<Fiber>) -> io::Result<()> {
        let id = self.id;
        let stealers = self.stealers.clone();
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();

        let handle = thread::Builder::new()
            .name(format!("strand-worker-{}", id))
            .spawn(move || Worker::run_loop(id, deque, stealers, shared, shutdown))?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the worker thread
    pub(crate) fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(worker = self.id, "worker thread panicked");
            }
        }
    }

    fn run_loop(
        id: usize,
        deque: CWorker<Fiber>,
        stealers: Vec<Stealer<Fiber>>,
        shared: Arc<SchedulerShared>,
        shutdown: Arc<AtomicBool>,
    ) {
        let idle = Duration::from_micros(shared.idle_sleep_us());
        tracing::trace!(worker = id, "worker started");
        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }

            let fiber = match Self::find_work(&deque, &stealers, &shared) {
                Some(fiber) => fiber,
                None => {
                    // parked fibers are woken by unpark or the timer thread
                    thread::sleep(idle);
                    continue;
                }
            };

            if !fiber.try_claim() {
                tracing::debug!(worker = id, fiber = %fiber.id(), state = ?fiber.state(), "skipping fiber that is not runnable");
                continue;
            }

            let outcome = fiber.run();
            tracing::trace!(worker = id, fiber = %fiber.id(), ?outcome, "step done");
            shared.after_step(&fiber, outcome);
        }

        tracing::trace!(worker = id, "worker shutting down");
    }

    /// Find work: local pop, then a batch from the injector, then steal
    fn find_work(deque: &CWorker<Fiber>, stealers: &[Stealer<Fiber>], shared: &SchedulerShared) -> Option<Fiber> {
        if let Some(fiber) = deque.pop() {
            return Some(fiber);
        }

        loop {
            match shared.injector().steal_batch_and_pop(deque) {
                Steal::Success(fiber) => return Some(fiber),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }

        Self::steal_from_others(stealers)
    }

    /// Steal from a random victim first, then the rest in order
    fn steal_from_others(stealers: &[Stealer<Fiber>]) -> Option<Fiber> {
        use rand::Rng;

        if stealers.is_empty() {
            return None;
        }

        let start = rand::thread_rng().gen_range(0..stealers.len());
        for i in 0..stealers.len() {
            let stealer = &stealers[(start + i) % stealers.len()];
            loop {
                match stealer.steal() {
                    Steal::Success(fiber) => return Some(fiber),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Whether the worker thread is running
    pub(crate) fn is_running(&self) -> bool {
        self.handle.is_some() && !self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
