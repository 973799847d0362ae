//! Loop-owned allocation pool
//!
//! [`Pool`] accounts for every timer entry and task a loop holds, so that an
//! optional capacity surfaces as [`LoopError::OutOfMemory`] at the operation
//! that needed the slot, and cleanup can report anything still outstanding.

use crate::error::{LoopError, LoopResult};

/// Lifecycle of a [`Pool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Constructed, `init` not called yet
    Uninit,
    /// Accepting allocations
    Ready,
    /// `cleanup` ran; no further allocations
    Released,
}

/// Accounting arena for loop allocations
#[derive(Debug)]
pub struct Pool {
    capacity: Option<usize>,
    in_use: usize,
    high_water: usize,
    state: PoolState,
}

impl Pool {
    /// Create a pool; `None` means unbounded
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            in_use: 0,
            high_water: 0,
            state: PoolState::Uninit,
        }
    }

    /// Make the pool ready for allocations
    pub fn init(&mut self) {
        self.in_use = 0;
        self.high_water = 0;
        self.state = PoolState::Ready;
    }

    /// Reserve one slot for `what`
    pub fn alloc(&mut self, what: &'static str) -> LoopResult<()> {
        match self.state {
            PoolState::Ready => {}
            PoolState::Uninit => return Err(LoopError::InvalidState("pool used before init")),
            PoolState::Released => return Err(LoopError::OutOfMemory(what)),
        }
        if let Some(cap) = self.capacity {
            if self.in_use >= cap {
                return Err(LoopError::OutOfMemory(what));
            }
        }
        self.in_use += 1;
        self.high_water = self.high_water.max(self.in_use);
        Ok(())
    }

    /// Return one slot
    pub fn free(&mut self) {
        debug_assert!(self.in_use > 0, "pool free without matching alloc");
        self.in_use = self.in_use.saturating_sub(1);
    }

    /// Release the pool. Returns the number of slots still outstanding.
    pub fn cleanup(&mut self) -> usize {
        let leaked = self.in_use;
        self.in_use = 0;
        self.state = PoolState::Released;
        leaked
    }

    /// Slots currently allocated
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Largest `in_use` seen since `init`
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        self.state
    }

    /// Whether `cleanup` ran
    pub fn is_released(&self) -> bool {
        self.state == PoolState::Released
    }
}
