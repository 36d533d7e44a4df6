//! # lwpos Configuration
//!
//! Compile-time constants governing the task table, the two scheduling
//! classes and the lightweight-task machinery. All limits are fixed at
//! compile time; nothing is allocated dynamically.

/// Capacity of the task table. Every schedulable unit, ordinary task or
/// lightweight task, occupies one slot.
pub const NPROC: usize = 64;

/// Number of hardware execution contexts that may run the scheduler
/// concurrently. Indexes the per-CPU "current task" array.
pub const NCPU: usize = 8;

/// Open-file slots per task.
pub const NOFILE: usize = 16;

/// Stack slots per task group. Bounds the occupancy bitmap (one `u64`)
/// and the pending-result table of the group leader.
pub const MAX_THREADS: usize = 64;

/// Size of one page, and of one lightweight-task stack.
pub const PAGE_SIZE: usize = 4096;

/// Length of the task name buffer, in bytes.
pub const NAME_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Stride class
// ---------------------------------------------------------------------------

/// Numerator of every stride computation: `stride = STRIDE_CONSTANT / share`.
pub const STRIDE_CONSTANT: u64 = 10_000_000;

/// Total ticket pool, in percent of the CPU.
pub const TICKET_POOL: u32 = 100;

/// Upper bound on the sum of all reserved stride shares. The remainder
/// (`TICKET_POOL - MAX_STRIDE_SHARE`) always belongs to the feedback
/// aggregate, so its share can never reach zero.
pub const MAX_STRIDE_SHARE: u32 = 80;

// ---------------------------------------------------------------------------
// Feedback (MLFQ) class
// ---------------------------------------------------------------------------

/// Number of feedback priority levels. Level 0 is the highest.
pub const MLFQ_LEVELS: usize = 3;

/// Time quantum per level, in ticks. A task is preempted after consuming
/// its quantum and requeued at the tail of its level.
pub const TIME_QUANTUM: [u32; MLFQ_LEVELS] = [1, 2, 4];

/// Time allotment per level, in ticks. Once a task has consumed its
/// allotment at a level it is demoted, however often it yielded meanwhile.
/// The lowest level has no allotment.
pub const TIME_ALLOTMENT: [u32; MLFQ_LEVELS] = [5, 10, u32::MAX];

/// Every `BOOST_PERIOD` feedback ticks all feedback tasks return to level 0.
pub const BOOST_PERIOD: u64 = 100;

// ---------------------------------------------------------------------------
// Lightweight tasks
// ---------------------------------------------------------------------------

/// Fake return address pushed below a new lightweight task's argument.
/// An entry routine that returns instead of calling `thread_exit` faults
/// on it.
pub const STACK_SENTINEL: usize = usize::MAX;

// ---------------------------------------------------------------------------
// Cortex-M4 port
// ---------------------------------------------------------------------------

/// Core clock frequency in Hz.
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Scheduler tick frequency in Hz.
pub const TICK_HZ: u32 = 1_000;
