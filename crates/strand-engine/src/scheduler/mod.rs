//! Fiber scheduler: worker pool, timer, and stack recycling

mod pool;
#[allow(clippy::module_inception)]
mod scheduler;
mod timer;
mod worker;

pub use pool::StackPool;
pub use scheduler::{FiberInfo, Scheduler, SchedulerError};
pub(crate) use scheduler::{SchedulerShared, StepOutcome};
pub use timer::TimerThread;
