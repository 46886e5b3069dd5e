//! Condition primitives built on park/unpark
//!
//! Both work identically for fibers and OS threads: waiting parks the
//! current [`Strand`](crate::fiber::Strand), signalling unparks it.

mod condition;
mod owned;

pub use condition::ConditionSynchronizer;
pub use owned::OwnedSynchronizer;
