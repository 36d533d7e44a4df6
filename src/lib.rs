//! # lwpos: Lightweight Processes on a Dual-Class Scheduler
//!
//! The scheduling and lightweight-task subsystem of a small multitasking
//! kernel. Tasks belong to one of two scheduling classes, and a task may
//! start lightweight tasks that share its address space and open files.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Trap handler                         │
//! ├────────────────────────────────────────────────────────┤
//! │            Syscall marshaling (syscall.rs)              │
//! │   yield · getlev · set_cpu_share · thread_* · sleep     │
//! ├────────────────────────────────────────────────────────┤
//! │              Kernel API (kernel.rs, thread.rs)          │
//! │  admit · dispatch · timer_tick · sleep/wakeup · kill    │
//! │  thread_create · thread_join · thread_exit              │
//! ├──────────────┬───────────────┬─────────────────────────┤
//! │  Scheduler   │ Stride class  │  Feedback class (MLFQ)  │
//! │  scheduler.rs│ stride.rs     │  mlfq.rs                │
//! ├──────────────┴───────────────┴─────────────────────────┤
//! │     Task model (task.rs) · Stack slots (stack.rs)       │
//! ├────────────────────────────────────────────────────────┤
//! │  Collaborators (platform.rs) · Arch port (arch/)        │
//! │  Memory · FileSystem · Cpu                              │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! - **Stride class**: a task that reserved `s` percent of the CPU gets a
//!   stride of `STRIDE_CONSTANT / s`; the smallest pass runs next.
//! - **Feedback class**: every other task, on a three-level MLFQ with
//!   per-level quanta and allotments and a periodic priority boost. The
//!   whole class competes on the stride timeline as one aggregate record
//!   holding the unreserved share, never less than 20%.
//!
//! ## Lightweight Tasks
//!
//! A group is an ordinary task plus the lightweight tasks it started. Each
//! lightweight task owns one stack page in a slot of its group's stack
//! region and is named by that slot. `thread_join` reaps a terminated
//! member and returns the value it passed to `thread_exit`.
//!
//! ## Memory Model
//!
//! - **No heap**: the task table is a fixed `[Task; NPROC]` array
//! - **No `alloc`**: pure `core`
//! - **One lock**: every transition happens under the table spinlock

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod mlfq;
pub mod platform;
pub mod scheduler;
pub mod stack;
pub mod stride;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod thread;

#[cfg(test)]
mod testing;

pub use error::{KernelError, MapError, Result};
pub use kernel::Kernel;
pub use platform::{FileRef, FileSystem, InodeRef, KernelStack, Memory, Platform, SpaceId};
pub use task::{Context, Pid, TaskId, TaskState};
