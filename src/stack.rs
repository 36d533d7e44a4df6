//! # Lightweight-Task Stacks
//!
//! Each task group reserves a region of its address space for the stacks
//! of its lightweight tasks: one page per stack slot, starting at the
//! group's stack base. The group leader tracks which slots are taken in a
//! [`SlotMap`]; a taken slot is owned by exactly one live lightweight task
//! until a joiner reaps it.
//!
//! ```text
//!   stack_base                 + PAGE_SIZE              + 2 * PAGE_SIZE
//!   ├──────── slot 0 ─────────┼──────── slot 1 ─────────┼─── ...
//!   │                 [arg]   │                 [arg]   │
//!   │           [sentinel] ◄sp│           [sentinel] ◄sp│
//! ```

use crate::config::{MAX_THREADS, PAGE_SIZE};

/// Occupancy bitmap of a group's stack slots. Bit `i` set means slot `i`
/// belongs to a live (or not yet reaped) lightweight task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotMap {
    bits: u64,
}

const _: () = assert!(MAX_THREADS <= u64::BITS as usize);

impl SlotMap {
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    /// Claim the lowest free slot.
    pub fn claim(&mut self) -> Option<usize> {
        let free = !self.bits;
        let slot = free.trailing_zeros() as usize;
        if slot >= MAX_THREADS {
            return None;
        }
        self.bits |= 1 << slot;
        Some(slot)
    }

    /// Return a slot to the free pool.
    pub fn release(&mut self, slot: usize) {
        debug_assert!(slot < MAX_THREADS);
        self.bits &= !(1u64 << slot);
    }

    #[inline]
    pub fn is_taken(&self, slot: usize) -> bool {
        slot < MAX_THREADS && self.bits & (1 << slot) != 0
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.bits.count_ones() as usize
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() >= MAX_THREADS
    }
}

/// The stack page a lightweight task owns until it is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    /// Slot index within the group; doubles as the task's thread id.
    pub slot: usize,
    /// Lowest address of the page.
    pub base: usize,
}

impl StackRegion {
    /// The region of `slot` in a group whose stack area starts at
    /// `stack_base`.
    pub const fn for_slot(stack_base: usize, slot: usize) -> Self {
        Self {
            slot,
            base: stack_base + slot * PAGE_SIZE,
        }
    }

    /// One past the highest address; the initial stack pointer.
    #[inline]
    pub const fn top(&self) -> usize {
        self.base + PAGE_SIZE
    }
}

/// Round `addr` up to the next page boundary.
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
