//! # Feedback Class (MLFQ)
//!
//! The default scheduling class. Tasks start at the highest of
//! `MLFQ_LEVELS` levels and sink as they consume CPU:
//!
//! - Each level has a time **quantum**. A task that uses it up is
//!   preempted and requeued at the tail of its level.
//! - Each level has a time **allotment**. A task that has consumed its
//!   allotment at a level is demoted, no matter how many times it yielded
//!   in between. Yielding resets the quantum, never the allotment, so a
//!   task cannot keep a high level by yielding just before the tick.
//! - Every `BOOST_PERIOD` feedback ticks every task returns to level 0,
//!   so long-running tasks are not starved by interactive ones.
//!
//! Within a level, order is round-robin: each (re)queue stamps the task
//! with a sequence number and the smallest stamp runs first.

use crate::config::{BOOST_PERIOD, MLFQ_LEVELS, TIME_ALLOTMENT, TIME_QUANTUM};

/// Per-task feedback bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackState {
    /// Current level, 0 is the highest priority.
    pub level: usize,
    /// Ticks consumed in the current quantum.
    pub quantum_used: u32,
    /// Ticks consumed at the current level.
    pub allotment_used: u32,
    /// Round-robin stamp within the level.
    pub queued_at: u64,
    /// Cleared when the task leaves the feedback class.
    pub enrolled: bool,
}

impl FeedbackState {
    pub const DETACHED: Self = Self {
        level: 0,
        quantum_used: 0,
        allotment_used: 0,
        queued_at: 0,
        enrolled: false,
    };

    /// Ordering key for selection: higher level first, then FIFO.
    #[inline]
    pub fn rank(&self) -> (usize, u64) {
        (self.level, self.queued_at)
    }
}

/// Global feedback-class state.
#[derive(Debug, Clone, Copy)]
pub struct Mlfq {
    /// Feedback clock; drives the priority boost.
    ticks: u64,
    /// Next round-robin stamp.
    seq: u64,
    /// Number of enrolled tasks.
    members: usize,
}

impl Mlfq {
    pub const fn new() -> Self {
        Self { ticks: 0, seq: 0, members: 0 }
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    #[inline]
    pub fn members(&self) -> usize {
        self.members
    }

    fn stamp(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Admit a task at level 0.
    pub fn enroll(&mut self) -> FeedbackState {
        self.members += 1;
        FeedbackState {
            level: 0,
            quantum_used: 0,
            allotment_used: 0,
            queued_at: self.stamp(),
            enrolled: true,
        }
    }

    /// Remove a task from feedback bookkeeping. Idempotent.
    pub fn remove(&mut self, state: &mut FeedbackState) {
        if state.enrolled {
            state.enrolled = false;
            self.members -= 1;
        }
    }

    /// Put a task at the tail of its level with a fresh quantum.
    pub fn requeue(&mut self, state: &mut FeedbackState) {
        state.quantum_used = 0;
        state.queued_at = self.stamp();
    }

    /// Charge one timer tick to the running task.
    ///
    /// Returns true if the task must give up the CPU, either because its
    /// quantum expired or because it was demoted.
    pub fn charge(&mut self, state: &mut FeedbackState) -> bool {
        state.quantum_used += 1;
        state.allotment_used = state.allotment_used.saturating_add(1);

        if state.level + 1 < MLFQ_LEVELS && state.allotment_used >= TIME_ALLOTMENT[state.level] {
            state.level += 1;
            state.allotment_used = 0;
            log::debug!("mlfq: demoted to level {}", state.level);
            self.requeue(state);
            return true;
        }
        if state.quantum_used >= TIME_QUANTUM[state.level] {
            self.requeue(state);
            return true;
        }
        false
    }

    /// Advance the feedback clock by one tick. Returns true when a priority
    /// boost is due.
    pub fn advance(&mut self) -> bool {
        self.ticks += 1;
        self.ticks % BOOST_PERIOD == 0
    }

    /// Return one task to level 0 as part of a priority boost.
    pub fn boost(&mut self, state: &mut FeedbackState) {
        state.level = 0;
        state.allotment_used = 0;
        self.requeue(state);
    }
}

impl Default for Mlfq {
    fn default() -> Self {
        Self::new()
    }
}
