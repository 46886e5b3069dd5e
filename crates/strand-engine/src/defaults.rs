//! Default constants for runtime configuration.
//!
//! Centralizes the numbers shared by the stack encoding, the scheduler,
//! the instrumentor, and the config loader.

/// Initial number of data slots allocated for a fresh fiber stack.
pub const DEFAULT_STACK_SIZE: usize = 16;

/// Initial number of frame markers allocated for a fresh fiber stack.
pub const DEFAULT_FRAME_DEPTH: usize = 16;

/// Largest suspension entry id a frame marker can hold (14 bits).
pub const MAX_ENTRY: usize = (1 << 14) - 1;

/// Largest number of saved slots a frame marker can hold (16 bits).
pub const MAX_SLOTS: usize = (1 << 16) - 1;

/// Number of finished fiber stacks kept for reuse.
pub const DEFAULT_STACK_POOL_SIZE: usize = 64;

/// Idle sleep of a worker thread that found no runnable fiber, in microseconds.
pub const DEFAULT_IDLE_SLEEP_US: u64 = 100;

/// Natives that block the calling OS thread.
///
/// Calling one of these from a suspendable method stalls a worker slot.
pub const BLOCKING_NATIVES: &[&str] = &["thread.sleep", "thread.join", "io.read_line", "lock.acquire"];

/// Owner prefix of runtime-internal methods, always accepted by verification.
pub const RUNTIME_OWNER: &str = "strand";

/// Environment variable selecting the verification mode.
pub const ENV_VERIFY: &str = "STRAND_VERIFY";

/// Environment variable overriding the worker count.
pub const ENV_WORKERS: &str = "STRAND_WORKERS";

/// Environment variable holding the log filter.
pub const ENV_LOG: &str = "STRAND_LOG";
