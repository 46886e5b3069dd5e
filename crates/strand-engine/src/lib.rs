//! Strand Fiber Engine
//!
//! Lightweight fibers for a register-machine IR, suspended and resumed by
//! saving and replaying their call stacks:
//! - **Stack encoding**: per-fiber frame markers and data slots (`fiber::stack`)
//! - **Suspension signal**: the [`Flow`] return channel (`fiber`)
//! - **Instrumentor**: rewrites suspendable methods to save and replay (`instrument`)
//! - **Verification**: catches uninstrumented frames at suspension time (`verify`)
//! - **Scheduler**: work-stealing worker pool with timers (`scheduler`)
//! - **Channels and synchronizers**: fiber-aware messaging (`channel`, `sync`)
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_engine::{Program, Runtime, RuntimeConfig};
//!
//! let program = Program::from_json(&std::fs::read_to_string("ring.json")?)?;
//! let runtime = Runtime::new(program, RuntimeConfig::load(None)?)?;
//! let result = runtime.run("Ring.main", vec![])?;
//! println!("{}", result);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

// ============================================================================
// Core Modules
// ============================================================================

/// Fibers, the suspension signal, and the stack encoding
pub mod fiber;

/// Condition primitives for fibers and threads
pub mod sync;

/// Fiber-aware channels
pub mod channel;

/// Work-stealing fiber scheduler
pub mod scheduler;

/// Program representation
pub mod ir;

/// Instrumentation pass and linker
pub mod instrument;

/// Suspension-time verification
pub mod verify;

/// Program interpreter and runtime library
pub mod interpreter;

/// Runtime values
pub mod value;

/// Pipeline facade
pub mod runtime;

// ============================================================================
// Ambient
// ============================================================================

/// Runtime configuration
pub mod config;

/// Default constants
pub mod defaults;

/// Tracing setup
pub mod logging;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::{Channel, ChannelConfig, OverflowPolicy, Received, Selected, Selector, SendError};
pub use config::{ConfigError, RuntimeConfig, SchedulerConfig};
pub use fiber::{Fiber, FiberError, FiberId, FiberState, Flow, JoinError, Stack, Suspendable, Suspension};
pub use instrument::{InstrumentError, InstrumentOptions, InstrumentReport, Instrumentor};
pub use interpreter::{Engine, ExecError, NativeRegistry};
pub use ir::{Method, MethodBuilder, PrettyPrint, Program, ProgramBuilder};
pub use runtime::{Runtime, RuntimeError};
pub use scheduler::{Scheduler, SchedulerError};
pub use value::Value;
pub use verify::{Verifier, VerifyConfig, VerifyMode};
