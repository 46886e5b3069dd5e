//! Fibers and the state they carry across suspensions
//!
//! - [`Stack`]: the per-fiber stack encoding
//! - [`Flow`] / [`Suspension`]: the suspension signal
//! - [`Fiber`]: lifecycle, park/unpark, join
//! - [`Strand`]: threads and fibers behind one park/unpark capability

mod fiber;
mod flow;
pub mod stack;
mod strand;

pub use fiber::{Fiber, FiberContext, FiberId, FiberResult, FiberState, JoinError, Suspendable};
pub use flow::{Flow, SuspendKind, Suspension};
pub use stack::{FrameEntry, FrameRecord, Stack, StackError};
pub use strand::{park, park_until, sleep_until, yield_now, ExecutionUnit, Strand, StrandError, StrandId, ThreadStrand};

pub(crate) use strand::clear_wakeup;

use crate::interpreter::ExecError;
use thiserror::Error;

/// Ways a fiber can fail
#[derive(Debug, Clone, Error)]
pub enum FiberError {
    /// Operation not allowed in the fiber's current state
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The fiber was cancelled before finishing
    #[error("fiber was cancelled")]
    Cancelled,

    /// Native fiber code panicked
    #[error("fiber panicked: {0}")]
    Panicked(String),

    /// Stack encoding invariant violated
    #[error("stack corrupted: {0}")]
    Stack(#[from] StackError),

    /// Interpreted code failed
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Park/unpark protocol violated
    #[error(transparent)]
    Strand(#[from] StrandError),

    /// Failure reported by native fiber code
    #[error("{0}")]
    Failed(String),
}
