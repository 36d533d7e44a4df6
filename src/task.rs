//! # Task Control Block
//!
//! Defines the task model for lwpos. One TCB exists per schedulable unit,
//! ordinary task or lightweight task; all of them live in the fixed-size
//! table owned by the scheduler.
//!
//! ## Task Groups
//!
//! A group is an ordinary task (the *leader*) plus every lightweight task
//! it created. Members share the leader's pid, address space and size;
//! each lightweight task owns only a private stack page. The leader keeps
//! the group bookkeeping: the stack-slot bitmap and the pending-result
//! table that exiting members fill and joiners drain.

use crate::config::{MAX_THREADS, NAME_LEN, NOFILE};
use crate::mlfq::FeedbackState;
use crate::platform::{FileRef, InodeRef, KernelStack, SpaceId};
use crate::stack::{SlotMap, StackRegion};
use crate::stride::StrideRecord;

/// Index of a TCB in the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub usize);

/// Group identifier, shared by a leader and its lightweight tasks.
/// `Pid(0)` never names a live group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// What a blocked task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitChannel {
    /// A member of the group led by this task terminated.
    Join(TaskId),
    /// The tick counter advanced.
    Ticks,
}

/// Execution state of a TCB.
///
/// ```text
///   ┌────────┐ alloc ┌────────┐ seeded ┌───────┐ dispatch ┌─────────┐
///   │ Unused │──────►│ Embryo │───────►│ Ready │─────────►│ Running │
///   └────────┘       └────────┘        └───────┘◄─────────└─────────┘
///       ▲                 │               ▲    preempt/yield │    │
///       │   rollback      │       wakeup  │                  │    │ exit
///       ├─────────────────┘          ┌─────────┐    sleep    │    ▼
///       │                            │ Blocked │◄────────────┘ ┌────────────┐
///       │          reap (join)       └─────────┘               │ Terminated │
///       └──────────────────────────────────────────────────────└────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Free table slot.
    Unused,
    /// Claimed but not yet fully initialized; never scheduled.
    Embryo,
    /// Runnable, waiting for a CPU.
    Ready,
    /// Executing on some CPU.
    Running,
    /// Sleeping on a wait channel.
    Blocked(WaitChannel),
    /// Exited, waiting to be reaped.
    Terminated,
}

// ---------------------------------------------------------------------------
// Scheduling membership
// ---------------------------------------------------------------------------

/// The scheduling class a task belongs to, with its per-class state.
///
/// Feedback tasks are represented on the stride timeline by the single
/// aggregate record held in [`crate::stride::StridePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    Feedback(FeedbackState),
    Stride(StrideRecord),
}

// ---------------------------------------------------------------------------
// Saved execution context
// ---------------------------------------------------------------------------

/// Register state a task resumes with when it is first dispatched.
///
/// The arch layer owns the full register file; the subsystem only seeds
/// what a new lightweight task depends on. The argument is also on the
/// stack; ports that pass the first argument in a register take it from
/// `arg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Context {
    /// Instruction pointer.
    pub pc: usize,
    /// Stack pointer.
    pub sp: usize,
    /// Argument of the entry routine.
    pub arg: usize,
    /// Result register.
    pub ret: usize,
}

// ---------------------------------------------------------------------------
// Group bookkeeping
// ---------------------------------------------------------------------------

/// Lightweight-task bookkeeping kept on a group leader.
#[derive(Debug, Clone, Copy)]
pub struct GroupBook {
    /// Base of the region holding member stacks.
    pub stack_base: usize,
    /// Which stack slots are taken.
    pub slots: SlotMap,
    /// Results published by exited members, indexed by slot.
    pub pending: [Option<usize>; MAX_THREADS],
}

impl GroupBook {
    pub const EMPTY: Self = Self {
        stack_base: 0,
        slots: SlotMap::new(),
        pending: [None; MAX_THREADS],
    };

    pub const fn new(stack_base: usize) -> Self {
        Self { stack_base, ..Self::EMPTY }
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB), the central data structure for each task.
///
/// TCBs are stored in a static array in the scheduler; no heap allocation.
pub struct Task {
    /// Group id.
    pub pid: Pid,

    /// Current execution state.
    pub state: TaskState,

    /// Back-reference to the creator. For a lightweight task this is the
    /// group leader.
    pub parent: Option<TaskId>,

    /// NUL-padded name, for diagnostics.
    pub name: [u8; NAME_LEN],

    /// Address space. Shared with the leader for lightweight tasks.
    pub space: Option<SpaceId>,

    /// Size of the address space in bytes.
    pub size: usize,

    /// Kernel-internal stack.
    pub kstack: Option<KernelStack>,

    /// Context to resume on first dispatch.
    pub context: Context,

    /// Open files, each slot holding one reference.
    pub files: [Option<FileRef>; NOFILE],

    /// Current directory, one reference.
    pub cwd: Option<InodeRef>,

    /// Scheduling class and its state.
    pub class: SchedClass,

    /// Set when the task has been killed; blocked joins fail on it.
    pub killed: bool,

    /// Private stack page. `Some` exactly when this is a lightweight task.
    pub thread: Option<StackRegion>,

    /// Group bookkeeping, meaningful on leaders only.
    pub group: GroupBook,
}

impl Task {
    /// An unallocated TCB. Used to initialize the static array.
    pub const EMPTY: Self = Self {
        pid: Pid(0),
        state: TaskState::Unused,
        parent: None,
        name: [0; NAME_LEN],
        space: None,
        size: 0,
        kstack: None,
        context: Context { pc: 0, sp: 0, arg: 0, ret: 0 },
        files: [None; NOFILE],
        cwd: None,
        class: SchedClass::Feedback(FeedbackState::DETACHED),
        killed: false,
        thread: None,
        group: GroupBook::EMPTY,
    };

    /// Reset every field back to the unused state.
    pub fn clear(&mut self) {
        *self = Self::EMPTY;
    }

    /// Copy `name` into the fixed buffer, truncating if needed.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_LEN];
        let len = name.len().min(NAME_LEN);
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    #[inline]
    pub fn is_lightweight(&self) -> bool {
        self.thread.is_some()
    }

    /// Slot id within the group, for lightweight tasks.
    #[inline]
    pub fn slot(&self) -> Option<usize> {
        self.thread.map(|region| region.slot)
    }

    /// Check if this task can be picked by the scheduler.
    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Ready
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == TaskState::Unused
    }

    /// Feedback level, or None for stride members.
    pub fn level(&self) -> Option<usize> {
        match self.class {
            SchedClass::Feedback(fb) => Some(fb.level),
            SchedClass::Stride(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
