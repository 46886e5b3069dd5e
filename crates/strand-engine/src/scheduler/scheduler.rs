//! Fiber scheduler coordinating worker threads
//!
//! Many fibers are multiplexed over a fixed pool of OS threads. A runnable
//! fiber sits in the global injector or a worker's deque; one step runs it
//! until it finishes or suspends. Unparked fibers re-enter the injector and
//! may resume on any worker.

use super::pool::StackPool;
use super::timer::TimerThread;
use super::worker::Worker;
use crate::config::SchedulerConfig;
use crate::fiber::{Fiber, FiberContext, FiberError, FiberId, FiberResult, FiberState, Flow, Stack, Suspendable};
use crossbeam_deque::{Injector, Worker as CWorker};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Scheduler start-up errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A worker or timer thread could not be spawned
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// What a worker must do with a fiber after running one step
#[derive(Debug)]
pub(crate) enum StepOutcome {
    /// Terminal; the stack can be recycled
    Finished(Option<Stack>),
    /// Parked; wake at the deadline if one was given, tagged with the
    /// park's sequence number
    Parked(Option<(Instant, u64)>),
    /// Runnable again (yield, or unparked while parking)
    Requeue,
}

/// Diagnostic snapshot of a live fiber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberInfo {
    /// Fiber id
    pub id: FiberId,
    /// Fiber name
    pub name: String,
    /// State at snapshot time
    pub state: FiberState,
    /// Last park blocker
    pub blocker: Option<String>,
}

/// State shared by the scheduler, its workers, and its fibers
pub(crate) struct SchedulerShared {
    injector: Injector<Fiber>,
    timer: Arc<TimerThread>,
    fibers: DashMap<FiberId, Fiber>,
    pool: StackPool,
    idle_sleep_us: u64,
    shutdown: AtomicBool,
}

impl SchedulerShared {
    pub(crate) fn injector(&self) -> &Injector<Fiber> {
        &self.injector
    }

    pub(crate) fn idle_sleep_us(&self) -> u64 {
        self.idle_sleep_us
    }

    /// Enqueue a runnable fiber
    pub(crate) fn submit(&self, fiber: Fiber) {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::debug!(fiber = %fiber.id(), "scheduler shut down; fiber not enqueued");
            return;
        }
        self.injector.push(fiber);
    }

    /// Drop the timer entry of a park that ended early
    pub(crate) fn cancel_timeout(&self, id: FiberId, deadline: Instant, seq: u64) {
        self.timer.cancel(id, deadline, seq);
    }

    /// Act on the outcome of one step
    pub(crate) fn after_step(&self, fiber: &Fiber, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Finished(stack) => {
                self.fibers.remove(&fiber.id());
                if let Some(stack) = stack {
                    self.pool.release(stack);
                }
            }
            StepOutcome::Parked(Some((deadline, seq))) => self.timer.register(fiber.clone(), deadline, seq),
            StepOutcome::Parked(None) => {}
            StepOutcome::Requeue => self.submit(fiber.clone()),
        }
    }
}

/// Main fiber scheduler
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<Worker>>,
    worker_count: usize,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count)
            .field("fibers", &self.shared.fibers.len())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler and start its worker and timer threads
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let worker_count = config.worker_count();
        let shared = Arc::new(SchedulerShared {
            injector: Injector::new(),
            timer: TimerThread::new(),
            fibers: DashMap::new(),
            pool: StackPool::new(config.stack_pool_size, config.stack_size),
            idle_sleep_us: config.idle_sleep_us,
            shutdown: AtomicBool::new(false),
        });

        // deques are created here so every worker gets the others' stealers;
        // each deque moves into its own thread
        let deques: Vec<CWorker<Fiber>> = (0..worker_count).map(|_| CWorker::new_lifo()).collect();
        let stealers: Vec<_> = deques.iter().map(|d| d.stealer()).collect();

        let scheduler = Self {
            shared: shared.clone(),
            workers: Mutex::new(Vec::with_capacity(worker_count)),
            worker_count,
        };

        shared.timer.start()?;
        for (id, deque) in deques.into_iter().enumerate() {
            let other_stealers: Vec<_> = stealers
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != id)
                .map(|(_, s)| s.clone())
                .collect();
            let mut worker = Worker::new(id, other_stealers, shared.clone());
            worker.start(deque)?;
            scheduler.workers.lock().push(worker);
        }

        tracing::debug!(workers = worker_count, "scheduler started");
        Ok(scheduler)
    }

    /// Create a scheduler with `workers` threads and default settings
    pub fn with_workers(workers: usize) -> Result<Self, SchedulerError> {
        Self::new(&SchedulerConfig {
            workers,
            ..SchedulerConfig::default()
        })
    }

    /// Create and start a fiber running `body` on a pooled stack
    pub fn spawn<F>(&self, name: impl Into<String>, body: F) -> Result<Fiber, FiberError>
    where
        F: FnMut(&mut FiberContext<'_>) -> Flow<FiberResult> + Send + 'static,
    {
        self.spawn_target(name, body)
    }

    /// Create and start a fiber running `target` on a pooled stack
    pub fn spawn_target(&self, name: impl Into<String>, target: impl Suspendable + 'static) -> Result<Fiber, FiberError> {
        let fiber = Fiber::from_target(name, self.shared.pool.acquire(), target);
        self.start(&fiber)?;
        Ok(fiber)
    }

    /// Enqueue a new fiber. Fails if the fiber was already started.
    pub fn start(&self, fiber: &Fiber) -> Result<(), FiberError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(FiberError::IllegalState("scheduler is shut down".to_string()));
        }
        fiber.bind(&self.shared)?;
        self.shared.fibers.insert(fiber.id(), fiber.clone());
        tracing::trace!(fiber = %fiber.id(), name = %fiber.name(), "fiber started");
        self.shared.submit(fiber.clone());
        Ok(())
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Number of timed parks still waiting on the timer thread
    pub fn pending_timeouts(&self) -> usize {
        self.shared.timer.pending_count()
    }

    /// Number of started, unfinished fibers
    pub fn fiber_count(&self) -> usize {
        self.shared.fibers.len()
    }

    /// Snapshot of every live fiber
    pub fn fibers(&self) -> Vec<FiberInfo> {
        let mut infos: Vec<FiberInfo> = self
            .shared
            .fibers
            .iter()
            .map(|entry| {
                let fiber = entry.value();
                FiberInfo {
                    id: fiber.id(),
                    name: fiber.name().to_string(),
                    state: fiber.state(),
                    blocker: fiber.blocker(),
                }
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Whether all workers are running
    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.load(Ordering::Acquire) && self.workers.lock().iter().all(Worker::is_running)
    }

    /// Stop all threads. Unfinished fibers stay unfinished.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in self.workers.lock().iter_mut() {
            worker.stop();
        }
        self.shared.timer.stop();
        let abandoned = self.shared.fibers.len();
        if abandoned > 0 {
            tracing::debug!(abandoned, "scheduler stopped with unfinished fibers");
        }
        self.shared.fibers.clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
