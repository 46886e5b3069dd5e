//! Suspension signal
//!
//! Suspension is an ordinary return value: every operation on the suspend
//! path returns a [`Flow`], and callers forward [`Flow::Suspend`] upward with
//! the [`flow!`](crate::flow) macro until it reaches the fiber boundary.
//! User-level error handling (`Result`) never sees it.

use std::fmt;

/// Why a fiber gave up its worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuspendKind {
    /// Waiting for an explicit unpark (or a deadline)
    Park,
    /// Immediately runnable again; cooperative time slicing
    Yield,
}

/// The suspension marker. Carries no payload beyond its flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Suspension {
    kind: SuspendKind,
}

impl Suspension {
    /// Park flavor
    pub const PARK: Suspension = Suspension { kind: SuspendKind::Park };

    /// Yield flavor
    pub const YIELD: Suspension = Suspension { kind: SuspendKind::Yield };

    /// The flavor of this suspension
    pub fn kind(self) -> SuspendKind {
        self.kind
    }
}

impl fmt::Display for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SuspendKind::Park => write!(f, "park"),
            SuspendKind::Yield => write!(f, "yield"),
        }
    }
}

/// Outcome of a call on the suspend path.
#[must_use = "a suspension must be propagated to the fiber boundary"]
#[derive(Debug, Clone, PartialEq)]
pub enum Flow<T> {
    /// The operation finished with a value
    Complete(T),
    /// The fiber is suspending; unwind to the boundary
    Suspend(Suspension),
}

impl<T> Flow<T> {
    /// Map the completed value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Flow<U> {
        match self {
            Flow::Complete(value) => Flow::Complete(f(value)),
            Flow::Suspend(s) => Flow::Suspend(s),
        }
    }

    /// Whether this is a suspension
    pub fn is_suspend(&self) -> bool {
        matches!(self, Flow::Suspend(_))
    }

    /// The completed value, if any
    pub fn complete(self) -> Option<T> {
        match self {
            Flow::Complete(value) => Some(value),
            Flow::Suspend(_) => None,
        }
    }
}

/// Unwrap a [`Flow::Complete`] or return the suspension from the enclosing function.
#[macro_export]
macro_rules! flow {
    ($e:expr) => {
        match $e {
            $crate::fiber::Flow::Complete(value) => value,
            $crate::fiber::Flow::Suspend(s) => return $crate::fiber::Flow::Suspend(s),
        }
    };
}

/// Like [`flow!`], for a `Flow<Result<T, E>>` inside a function returning
/// `Flow<Result<U, F>>` where `F: From<E>`.
#[macro_export]
macro_rules! flow_try {
    ($e:expr) => {
        match $crate::flow!($e) {
            Ok(value) => value,
            Err(err) => return $crate::fiber::Flow::Complete(Err(::core::convert::From::from(err))),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner(suspend: bool) -> Flow<Result<i64, String>> {
        if suspend {
            Flow::Suspend(Suspension::YIELD)
        } else {
            Flow::Complete(Ok(20))
        }
    }

    fn outer(suspend: bool) -> Flow<Result<i64, String>> {
        let v = crate::flow_try!(inner(suspend));
        Flow::Complete(Ok(v + 1))
    }

    #[test]
    fn test_suspension_propagates_through_macro() {
        assert_eq!(outer(false), Flow::Complete(Ok(21)));
        assert_eq!(outer(true), Flow::Suspend(Suspension::YIELD));
    }

    #[test]
    fn test_suspension_flavors() {
        assert_eq!(Suspension::PARK.kind(), SuspendKind::Park);
        assert_eq!(Suspension::YIELD.to_string(), "yield");
        assert!(Flow::<()>::Suspend(Suspension::PARK).is_suspend());
        assert_eq!(Flow::Complete(2).map(|v| v * 2).complete(), Some(4));
    }
}
