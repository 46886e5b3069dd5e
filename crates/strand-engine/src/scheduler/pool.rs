//! Stack pool for reusing fiber stacks.
//!
//! When a fiber finishes, its Stack (which may have grown during deep
//! suspensions) is returned to the pool. The next spawned fiber acquires the
//! recycled Stack and reuses its capacity.

use crate::fiber::Stack;
use parking_lot::Mutex;

/// Pool of reusable Stack objects.
pub struct StackPool {
    stacks: Mutex<Vec<Stack>>,
    max_size: usize,
    stack_size: usize,
}

impl StackPool {
    /// Create a pool holding up to `max_size` stacks; fresh stacks start
    /// with `stack_size` slots.
    pub fn new(max_size: usize, stack_size: usize) -> Self {
        Self {
            stacks: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
            stack_size,
        }
    }

    /// Get a stack from the pool, or create a new one.
    pub fn acquire(&self) -> Stack {
        self.stacks
            .lock()
            .pop()
            .unwrap_or_else(|| Stack::with_capacity(self.stack_size))
    }

    /// Return a stack to the pool for reuse.
    pub fn release(&self, mut stack: Stack) {
        stack.reset();
        let mut pool = self.stacks.lock();
        if pool.len() < self.max_size {
            pool.push(stack);
        }
    }

    /// Stacks currently pooled
    pub fn len(&self) -> usize {
        self.stacks.lock().len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
