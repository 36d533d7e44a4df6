//! # Architecture Abstraction Layer
//!
//! Provides the hardware boundary for the scheduler: which execution
//! context is running, and how a task gives the processor back.
//! Currently implements the Cortex-M4 port; extensible to other
//! architectures by adding sibling modules.

use crate::task::{TaskId, TaskState};

pub mod armv7m;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

/// One hardware execution context as seen by the scheduler.
pub trait Cpu {
    /// Index of the executing CPU, below [`crate::config::NCPU`].
    fn id(&self) -> usize;

    /// Save the context of `from` and re-enter the scheduler loop.
    ///
    /// `state` is the state `from` was left in. The call returns once
    /// `from` has been dispatched again; for [`TaskState::Terminated`] it
    /// must never return.
    ///
    /// The table lock is not held during the call; the implementation must
    /// keep other CPUs from resuming `from` until its registers are saved.
    fn switch(&self, from: TaskId, state: TaskState);
}
