//! Interpreter for instrumented programs
//!
//! Methods execute on native Rust recursion: a call is a Rust call, and a
//! suspension is a [`Flow::Suspend`](crate::fiber::Flow) returned up through
//! every interpreted frame. Instrumented frames save their live registers
//! into the fiber's stack on the way out and replay on the way back in.

mod engine;
mod interp;
mod intrinsics;
mod natives;

pub use interp::Interpreter;
pub use engine::{Engine, ProgramTarget};
pub use natives::{NativeContext, NativeEntry, NativeFn, NativeRegistry};

use crate::fiber::StackError;
use crate::value::Value;
use crate::verify::VerifyError;
use thiserror::Error;

/// Interpreter errors
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// A `throw` nobody caught
    #[error("uncaught exception: {0}")]
    Thrown(Value),

    /// A call names a missing method
    #[error("unknown method {0}")]
    UnknownMethod(String),

    /// A call targets a method without a body
    #[error("method {0} has no body")]
    NoBody(String),

    /// A native call names an unregistered native
    #[error("unknown native {0}")]
    UnknownNative(String),

    /// Wrong number of arguments
    #[error("{method} expects {expected} arguments, got {got}")]
    Arity {
        /// Callee
        method: String,
        /// Declared parameters
        expected: usize,
        /// Supplied arguments
        got: usize,
    },

    /// Operand of the wrong type
    #[error("type error: {0}")]
    Type(String),

    /// A native reported a failure
    #[error("{name}: {message}")]
    Native {
        /// Native name
        name: String,
        /// Failure description
        message: String,
    },

    /// The joined fiber failed
    #[error("joined fiber failed: {0}")]
    JoinFailed(String),

    /// Saved frame state does not match the method
    #[error("stack corrupted: {0}")]
    Stack(#[from] StackError),

    /// Instrumented frame state is inconsistent
    #[error("corrupt frame in {method}: {reason}")]
    Corrupt {
        /// Method being replayed
        method: String,
        /// What was wrong
        reason: String,
    },

    /// Verification failed in `fail` mode
    #[error("verification failed: {0}")]
    Verification(String),
}

impl From<VerifyError> for ExecError {
    fn from(err: VerifyError) -> Self {
        ExecError::Verification(err.to_string())
    }
}

impl ExecError {
    /// Whether a user handler may catch the error
    pub fn is_catchable(&self) -> bool {
        matches!(self, ExecError::Thrown(_))
    }

    /// Build a type error
    pub(crate) fn type_error(expected: &str, got: &Value) -> Self {
        ExecError::Type(format!("expected {}, got {}", expected, got.type_name()))
    }
}

/// Result of running interpreted code
pub type ExecResult = Result<Value, ExecError>;
