//! Fiber: a suspendable unit of execution
//!
//! A fiber owns its target computation and a [`Stack`]. Its lifecycle lives
//! in a single atomic byte so that park and unpark can race safely:
//!
//! ```text
//! NEW -> RUNNABLE -> RUNNING -> PARKING -> PARKED -> RUNNABLE -> ...
//!                       |                                 ^
//!                       +----------- yield ---------------+
//!                       +--> FINISHED
//! ```
//!
//! An unpark that lands while the fiber is still running or parking sets the
//! PERMIT bit instead; the worker settling the park sees it and makes the
//! fiber runnable again, so the wake-up is never lost.

use super::flow::{Flow, SuspendKind, Suspension};
use super::stack::Stack;
use super::FiberError;
use crate::scheduler::{SchedulerShared, StepOutcome};
use crate::sync::ConditionSynchronizer;
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

const NEW: u8 = 0;
const RUNNABLE: u8 = 1;
const RUNNING: u8 = 2;
const PARKING: u8 = 3;
const PARKED: u8 = 4;
const FINISHED: u8 = 5;
const LIFECYCLE: u8 = 0x0F;
const PERMIT: u8 = 0x10;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Fiber>> = const { RefCell::new(None) };
}

/// Unique identifier for a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Observable fiber state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created, not yet started
    New,
    /// Waiting for a worker
    Runnable,
    /// Executing on a worker (or settling a suspension)
    Running,
    /// Parked until unparked or its deadline passes
    Suspended,
    /// Terminal; a result or failure is recorded
    Finished,
}

/// Terminal result of a fiber
pub type FiberResult = Result<Value, FiberError>;

/// Errors from joining a fiber
#[derive(Debug, Clone, Error)]
pub enum JoinError {
    /// The deadline passed before the fiber finished
    #[error("timed out waiting for fiber to finish")]
    Timeout,

    /// The fiber finished with a failure
    #[error("fiber failed: {0}")]
    Failed(FiberError),

    /// A thread-blocking join was attempted from inside a fiber
    #[error("blocking join called from inside a fiber; use poll_join")]
    InFiber,

    /// A fiber tried to join itself
    #[error("fiber {0} cannot join itself")]
    SelfJoin(FiberId),
}

/// A computation a fiber can run.
///
/// `run` is invoked once per resumption. An implementation either returns
/// [`Flow::Complete`] with the fiber's result or forwards a suspension; it
/// keeps whatever it needs across resumptions in its own fields or in the
/// context's [`Stack`].
pub trait Suspendable: Send {
    /// Run until completion or the next suspension
    fn run(&mut self, ctx: &mut FiberContext<'_>) -> Flow<FiberResult>;
}

impl<F> Suspendable for F
where
    F: FnMut(&mut FiberContext<'_>) -> Flow<FiberResult> + Send,
{
    fn run(&mut self, ctx: &mut FiberContext<'_>) -> Flow<FiberResult> {
        self(ctx)
    }
}

/// Handle passed to a running [`Suspendable`].
pub struct FiberContext<'a> {
    fiber: &'a Fiber,
    stack: &'a mut Stack,
}

impl FiberContext<'_> {
    /// The running fiber
    pub fn fiber(&self) -> &Fiber {
        self.fiber
    }

    /// The fiber's stack encoding
    pub fn stack(&mut self) -> &mut Stack {
        self.stack
    }
}

struct Body {
    target: Box<dyn Suspendable>,
    stack: Stack,
}

#[derive(Default)]
struct ParkRecord {
    blocker: Option<String>,
    deadline: Option<Instant>,
    /// Bumped on every park; a timer entry only fires for its own park
    seq: u64,
}

struct Inner {
    id: FiberId,
    name: String,
    state: AtomicU8,
    cancelled: AtomicBool,
    /// Set when a run ends in a suspension; consumed by the first
    /// suspending primitive of the next run
    wakeup: AtomicBool,
    body: Mutex<Option<Body>>,
    park: Mutex<ParkRecord>,
    executor: OnceLock<Weak<SchedulerShared>>,
    outcome: Mutex<Option<FiberResult>>,
    done: Condvar,
    joiners: ConditionSynchronizer,
}

/// Shared handle to a fiber. Cloning is cheap.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<Inner>,
}

impl Fiber {
    /// Create a fiber running the closure `body` on a fresh stack.
    ///
    /// The closure is re-invoked from the top on every resumption.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnMut(&mut FiberContext<'_>) -> Flow<FiberResult> + Send + 'static,
    {
        Self::from_target(name, Stack::new(), body)
    }

    /// Create a fiber running `target` on a recycled or pre-sized stack
    pub fn from_target(name: impl Into<String>, stack: Stack, target: impl Suspendable + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: FiberId::next(),
                name: name.into(),
                state: AtomicU8::new(NEW),
                cancelled: AtomicBool::new(false),
                wakeup: AtomicBool::new(false),
                body: Mutex::new(Some(Body {
                    target: Box::new(target),
                    stack,
                })),
                park: Mutex::new(ParkRecord::default()),
                executor: OnceLock::new(),
                outcome: Mutex::new(None),
                done: Condvar::new(),
                joiners: ConditionSynchronizer::new("fiber-join"),
            }),
        }
    }

    /// The fiber running on the calling thread, if any
    pub fn current() -> Option<Fiber> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Fiber id
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// Fiber name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state
    pub fn state(&self) -> FiberState {
        match self.inner.state.load(Ordering::Acquire) & LIFECYCLE {
            NEW => FiberState::New,
            RUNNABLE => FiberState::Runnable,
            RUNNING | PARKING => FiberState::Running,
            PARKED => FiberState::Suspended,
            _ => FiberState::Finished,
        }
    }

    /// Whether the fiber has not finished yet
    pub fn is_alive(&self) -> bool {
        self.state() != FiberState::Finished
    }

    /// Whether [`Fiber::cancel`] was called
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// What the fiber last parked on
    pub fn blocker(&self) -> Option<String> {
        self.inner.park.lock().blocker.clone()
    }

    /// The terminal result, once finished
    pub fn result(&self) -> Option<FiberResult> {
        self.inner.outcome.lock().clone()
    }

    /// Whether two handles refer to the same fiber
    pub fn same_fiber(&self, other: &Fiber) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Make a parked fiber runnable. Safe to call from any thread at any
    /// time; an unpark that arrives before the park completes is kept as a
    /// permit and consumed by that park.
    pub fn unpark(&self) {
        let state = &self.inner.state;
        loop {
            let s = state.load(Ordering::Acquire);
            match s & LIFECYCLE {
                FINISHED => return,
                PARKED => {
                    if state
                        .compare_exchange(s, RUNNABLE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        tracing::trace!(fiber = %self.id(), "unparked");
                        if let Some(shared) = self.executor() {
                            if let Some((deadline, seq)) = self.park_timeout() {
                                shared.cancel_timeout(self.id(), deadline, seq);
                            }
                            shared.submit(self.clone());
                        }
                        return;
                    }
                }
                _ => {
                    if s & PERMIT != 0 {
                        return;
                    }
                    if state
                        .compare_exchange(s, s | PERMIT, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Wake the fiber for the timed park numbered `seq`. Ignored once that
    /// park has ended, so a late timer never wakes a later park.
    pub(crate) fn unpark_timed(&self, seq: u64) -> bool {
        let park = self.inner.park.lock();
        if park.seq != seq {
            return false;
        }
        let state = &self.inner.state;
        let s = state.load(Ordering::Acquire);
        if s & LIFECYCLE != PARKED {
            return false;
        }
        if state
            .compare_exchange(s, RUNNABLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        drop(park);
        tracing::trace!(fiber = %self.id(), "park deadline reached");
        if let Some(shared) = self.executor() {
            shared.submit(self.clone());
        }
        true
    }

    /// Request cancellation. The fiber finishes with
    /// [`FiberError::Cancelled`] the next time it would be resumed or would
    /// park; a fiber that never suspends again runs to completion.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.unpark();
    }

    /// Run a new, runnable, or suspended fiber on the calling thread until
    /// it finishes or suspends again.
    ///
    /// Fibers owned by a scheduler may only be resumed from the suspended
    /// state. A fiber that is running elsewhere or already finished is
    /// rejected with [`FiberError::IllegalState`].
    pub fn exec(&self) -> Result<FiberState, FiberError> {
        let scheduled = self.executor().is_some();
        let state = &self.inner.state;
        loop {
            let s = state.load(Ordering::Acquire);
            let resumable = match s & LIFECYCLE {
                PARKED => true,
                NEW | RUNNABLE => !scheduled,
                _ => false,
            };
            if !resumable {
                return Err(FiberError::IllegalState(format!(
                    "fiber {} cannot be resumed while {:?}",
                    self.id(),
                    self.state()
                )));
            }
            if state
                .compare_exchange(s, RUNNING | (s & PERMIT), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        let outcome = self.run();
        if let Some(shared) = self.executor() {
            shared.after_step(self, outcome);
        }
        Ok(self.state())
    }

    /// Join, blocking the calling thread until the fiber finishes
    pub fn join(&self) -> Result<Value, JoinError> {
        self.wait(None)
    }

    /// Join with a timeout
    pub fn join_timeout(&self, timeout: Duration) -> Result<Value, JoinError> {
        self.wait(Some(Instant::now() + timeout))
    }

    /// Join from a fiber or a thread. Inside a fiber this suspends instead of
    /// blocking the worker.
    pub fn poll_join(&self, deadline: Option<Instant>) -> Flow<Result<Value, JoinError>> {
        let me = super::Strand::current();
        if let Some(current) = Fiber::current() {
            if current.same_fiber(self) {
                return Flow::Complete(Err(JoinError::SelfJoin(self.id())));
            }
            current.take_wakeup();
        }
        loop {
            if let Some(result) = self.result() {
                self.inner.joiners.unregister(&me);
                return Flow::Complete(result.map_err(JoinError::Failed));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.inner.joiners.unregister(&me);
                return Flow::Complete(Err(JoinError::Timeout));
            }
            self.inner.joiners.register(&me);
            if self.result().is_some() {
                continue;
            }
            crate::flow!(self.inner.joiners.await_until(deadline));
        }
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<Value, JoinError> {
        if Fiber::current().is_some() {
            return Err(JoinError::InFiber);
        }
        let mut outcome = self.inner.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone().map_err(JoinError::Failed);
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.done.wait_until(&mut outcome, deadline).timed_out() && outcome.is_none() {
                        return Err(JoinError::Timeout);
                    }
                }
                None => self.inner.done.wait(&mut outcome),
            }
        }
    }

    /// Attach to a scheduler and mark runnable. Fails unless the fiber is new.
    pub(crate) fn bind(&self, shared: &Arc<SchedulerShared>) -> Result<(), FiberError> {
        if self.inner.executor.set(Arc::downgrade(shared)).is_err() {
            return Err(FiberError::IllegalState(format!("fiber {} was already started", self.id())));
        }
        let state = &self.inner.state;
        loop {
            let s = state.load(Ordering::Acquire);
            if s & LIFECYCLE != NEW {
                return Err(FiberError::IllegalState(format!(
                    "fiber {} was already started ({:?})",
                    self.id(),
                    self.state()
                )));
            }
            if state
                .compare_exchange(s, RUNNABLE | (s & PERMIT), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Claim a runnable fiber for a worker
    pub(crate) fn try_claim(&self) -> bool {
        let state = &self.inner.state;
        loop {
            let s = state.load(Ordering::Acquire);
            if s & LIFECYCLE != RUNNABLE {
                return false;
            }
            if state
                .compare_exchange(s, RUNNING | (s & PERMIT), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Deadline and sequence number of the latest timed park
    pub(crate) fn park_timeout(&self) -> Option<(Instant, u64)> {
        let park = self.inner.park.lock();
        park.deadline.map(|deadline| (deadline, park.seq))
    }

    /// Run one step. The caller has moved the fiber to RUNNING.
    pub(crate) fn run(&self) -> StepOutcome {
        let mut guard = self.inner.body.lock();
        if guard.is_none() {
            return StepOutcome::Finished(None);
        }
        if self.is_cancelled() {
            let body = guard.take();
            drop(guard);
            self.finish(Err(FiberError::Cancelled));
            return StepOutcome::Finished(body.map(|b| b.stack));
        }

        let flow = {
            let Some(Body { target, stack }) = guard.as_mut() else {
                return StepOutcome::Finished(None);
            };
            stack.resume_stack();
            let _current = CurrentGuard::enter(self);
            let mut ctx = FiberContext { fiber: self, stack };
            panic::catch_unwind(AssertUnwindSafe(|| target.run(&mut ctx)))
        };

        let result = match flow {
            Ok(Flow::Suspend(suspension)) => {
                drop(guard);
                self.inner.wakeup.store(true, Ordering::Release);
                return self.settle(suspension);
            }
            Ok(Flow::Complete(result)) => result,
            Err(payload) => Err(FiberError::Panicked(panic_message(payload.as_ref()))),
        };
        let body = guard.take();
        drop(guard);
        self.finish(result);
        StepOutcome::Finished(body.map(|b| b.stack))
    }

    /// Suspend the current fiber until unparked or `deadline` passes.
    pub(crate) fn park_current(&self, blocker: &str, deadline: Option<Instant>) -> Flow<()> {
        if self.is_cancelled() {
            // hand the worker back; the next step finishes the fiber
            return Flow::Suspend(Suspension::YIELD);
        }
        if self.take_wakeup() {
            return Flow::Complete(());
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Flow::Complete(());
        }
        {
            let mut park = self.inner.park.lock();
            park.blocker = Some(blocker.to_string());
            park.deadline = deadline;
            park.seq = park.seq.wrapping_add(1);
        }
        let state = &self.inner.state;
        loop {
            let s = state.load(Ordering::Acquire);
            if s & PERMIT != 0 {
                if state
                    .compare_exchange(s, s & !PERMIT, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Flow::Complete(());
                }
                continue;
            }
            if state
                .compare_exchange(s, PARKING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        tracing::trace!(fiber = %self.id(), blocker, "parking");
        Flow::Suspend(Suspension::PARK)
    }

    /// Give up the worker, staying runnable.
    pub(crate) fn yield_current(&self) -> Flow<()> {
        if self.take_wakeup() {
            return Flow::Complete(());
        }
        Flow::Suspend(Suspension::YIELD)
    }

    /// Consume the resume token left by the previous suspension.
    pub(crate) fn take_wakeup(&self) -> bool {
        self.inner.wakeup.swap(false, Ordering::AcqRel)
    }

    fn settle(&self, suspension: Suspension) -> StepOutcome {
        let state = &self.inner.state;
        loop {
            let s = state.load(Ordering::Acquire);
            let (next, outcome) = match suspension.kind() {
                SuspendKind::Yield => (RUNNABLE | (s & PERMIT), StepOutcome::Requeue),
                SuspendKind::Park if s & PERMIT != 0 => (RUNNABLE, StepOutcome::Requeue),
                SuspendKind::Park => (PARKED, StepOutcome::Parked(self.park_timeout())),
            };
            if state
                .compare_exchange(s, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return outcome;
            }
        }
    }

    fn finish(&self, result: FiberResult) {
        match &result {
            Ok(_) => tracing::debug!(fiber = %self.id(), name = %self.name(), "finished"),
            Err(e) => tracing::debug!(fiber = %self.id(), name = %self.name(), error = %e, "failed"),
        }
        {
            let mut outcome = self.inner.outcome.lock();
            *outcome = Some(result);
            self.inner.state.store(FINISHED, Ordering::Release);
            self.inner.done.notify_all();
        }
        self.inner.joiners.signal_all();
    }

    fn executor(&self) -> Option<Arc<SchedulerShared>> {
        self.inner.executor.get().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Installs a fiber as the thread's current fiber for one resumption.
struct CurrentGuard {
    previous: Option<Fiber>,
}

impl CurrentGuard {
    fn enter(fiber: &Fiber) -> Self {
        let previous = CURRENT.with(|c| c.borrow_mut().replace(fiber.clone()));
        Self { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
