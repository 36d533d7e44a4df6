//! # Scheduler
//!
//! The task table and the two scheduling classes that share it.
//!
//! ## Scheduling Algorithm
//!
//! At each decision point:
//! 1. **Stride round**: among the feedback aggregate (if any feedback task
//!    is runnable) and every runnable stride member, pick the record with
//!    the smallest pass and advance it by its stride.
//! 2. **Feedback round**: if the aggregate won, pick the runnable feedback
//!    task with the best `(level, queue stamp)` rank.
//! 3. Mark the winner Running and record it as this CPU's current task.
//!
//! At each timer tick the global clock and the feedback clock advance, a
//! due priority boost is applied, and the running task is charged. Stride
//! members are preempted every tick so the min-pass rule stays exact.
//!
//! The scheduler itself never locks; [`crate::kernel::Kernel`] owns it
//! behind the table lock and every method here runs with that lock held.

use crate::config::{NCPU, NPROC};
use crate::error::{KernelError, Result};
use crate::mlfq::Mlfq;
use crate::stride::StridePool;
use crate::task::{Pid, SchedClass, Task, TaskId, TaskState, WaitChannel};

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The central scheduler state: all TCBs, the per-CPU current task, and
/// the global accounting of both classes.
pub struct Scheduler {
    /// Fixed-size task table.
    pub tasks: [Task; NPROC],

    /// Task running on each CPU.
    pub current: [Option<TaskId>; NCPU],

    /// Stride-class accounting and the feedback aggregate.
    pub stride: StridePool,

    /// Feedback-class accounting.
    pub mlfq: Mlfq,

    /// Monotonic timer tick counter.
    pub ticks: u64,

    next_pid: u32,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: [Task::EMPTY; NPROC],
            current: [None; NCPU],
            stride: StridePool::new(),
            mlfq: Mlfq::new(),
            ticks: 0,
            next_pid: 1,
        }
    }

    // -----------------------------------------------------------------------
    // Table management
    // -----------------------------------------------------------------------

    /// Claim an unused TCB and move it to `Embryo`.
    pub fn alloc(&mut self) -> Result<TaskId> {
        let index = self
            .tasks
            .iter()
            .position(Task::is_free)
            .ok_or(KernelError::NoFreeTask)?;
        self.tasks[index].state = TaskState::Embryo;
        Ok(TaskId(index))
    }

    /// Hand out a fresh group id.
    pub fn next_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// # Panics
    /// If `id` is outside the table. Ids from outside the kernel go
    /// through [`Scheduler::live`] instead.
    #[inline]
    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    #[inline]
    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.0]
    }

    /// The TCB of `id` if it names an allocated entry.
    pub fn live(&self, id: TaskId) -> Result<&Task> {
        self.tasks
            .get(id.0)
            .filter(|t| !t.is_free())
            .ok_or(KernelError::BadArgument)
    }

    pub fn live_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(id.0)
            .filter(|t| !t.is_free())
            .ok_or(KernelError::BadArgument)
    }

    /// Task running on `cpu`.
    pub fn current(&self, cpu: usize) -> Result<TaskId> {
        self.current
            .get(cpu)
            .copied()
            .flatten()
            .ok_or(KernelError::NoCurrentTask)
    }

    /// The leader of the group `id` belongs to.
    pub fn leader_of(&self, id: TaskId) -> TaskId {
        let task = self.task(id);
        match (task.is_lightweight(), task.parent) {
            (true, Some(parent)) => parent,
            _ => id,
        }
    }

    /// The lightweight task occupying `slot` in the group led by `leader`.
    pub fn find_member(&self, leader: TaskId, slot: usize) -> Option<TaskId> {
        self.tasks
            .iter()
            .position(|t| !t.is_free() && t.parent == Some(leader) && t.slot() == Some(slot))
            .map(TaskId)
    }

    /// The leader of group `pid`, if it is alive.
    pub fn find_group(&self, pid: Pid) -> Option<TaskId> {
        self.tasks
            .iter()
            .position(|t| !t.is_free() && t.pid == pid && !t.is_lightweight())
            .map(TaskId)
    }

    /// Number of TCBs not in the unused pool.
    pub fn live_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_free()).count()
    }

    // -----------------------------------------------------------------------
    // Class membership
    // -----------------------------------------------------------------------

    /// Put a task into the feedback class at level 0.
    pub fn enroll_feedback(&mut self, id: TaskId) {
        let state = self.mlfq.enroll();
        self.tasks[id.0].class = SchedClass::Feedback(state);
    }

    /// Reserve `share` percent of the CPU for `id`, moving it to the stride
    /// class. Fails without side effects if the pool cannot cover it.
    pub fn set_share(&mut self, id: TaskId, share: u32) -> Result<()> {
        let current = match &self.tasks[id.0].class {
            SchedClass::Stride(record) => Some(*record),
            SchedClass::Feedback(_) => None,
        };
        let min_pass = self.min_pass();
        let record = match self.stride.reserve(share, current.as_ref(), min_pass) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("sched: pid {} denied {}% share: {}", self.tasks[id.0].pid.0, share, err);
                return Err(err);
            }
        };

        let task = &mut self.tasks[id.0];
        if let SchedClass::Feedback(state) = &mut task.class {
            self.mlfq.remove(state);
        }
        task.class = SchedClass::Stride(record);
        log::info!(
            "sched: pid {} granted {}% (aggregate now {}%)",
            task.pid.0,
            share,
            self.stride.aggregate().share
        );
        Ok(())
    }

    /// Take `id` out of whichever class it is in. For a stride member this
    /// folds its share back into the aggregate, at most once.
    pub fn release_class(&mut self, id: TaskId) {
        match &mut self.tasks[id.0].class {
            SchedClass::Feedback(state) => self.mlfq.remove(state),
            SchedClass::Stride(record) => {
                if self.stride.release(record) {
                    log::debug!(
                        "sched: {}% returned, aggregate now {}%",
                        record.share,
                        self.stride.aggregate().share
                    );
                }
            }
        }
    }

    /// Smallest pass on the stride timeline among the aggregate and the
    /// valid stride members that are competing for a CPU.
    pub fn min_pass(&self) -> u64 {
        self.tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Ready | TaskState::Running))
            .filter_map(|t| match t.class {
                SchedClass::Stride(r) if r.valid => Some(r.pass),
                _ => None,
            })
            .fold(self.stride.aggregate().pass, u64::min)
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Select the next task to run and charge the selection to its stride
    /// record (or to the aggregate).
    pub fn pick_next(&mut self) -> Option<TaskId> {
        let feedback_ready = self.tasks.iter().any(|t| {
            t.is_runnable() && matches!(t.class, SchedClass::Feedback(fb) if fb.enrolled)
        });

        // None in the second position stands for the aggregate.
        let mut best: Option<(u64, Option<TaskId>)> =
            feedback_ready.then(|| (self.stride.aggregate().pass, None));

        for (i, task) in self.tasks.iter().enumerate() {
            if !task.is_runnable() {
                continue;
            }
            if let SchedClass::Stride(record) = task.class {
                if record.valid && best.map_or(true, |(pass, _)| record.pass < pass) {
                    best = Some((record.pass, Some(TaskId(i))));
                }
            }
        }

        match best? {
            (_, Some(id)) => {
                if let SchedClass::Stride(record) = &mut self.tasks[id.0].class {
                    record.advance();
                }
                Some(id)
            }
            (_, None) => {
                self.stride.aggregate_mut().advance();
                self.pick_feedback()
            }
        }
    }

    /// Best-ranked runnable feedback task.
    fn pick_feedback(&self) -> Option<TaskId> {
        self.tasks
            .iter()
            .enumerate()
            .filter_map(|(i, t)| match t.class {
                SchedClass::Feedback(fb) if fb.enrolled && t.is_runnable() => Some((fb.rank(), i)),
                _ => None,
            })
            .min()
            .map(|(_, i)| TaskId(i))
    }

    /// Pick a task for `cpu` and mark it Running.
    pub fn dispatch(&mut self, cpu: usize) -> Option<TaskId> {
        let id = self.pick_next()?;
        self.tasks[id.0].state = TaskState::Running;
        self.current[cpu] = Some(id);
        log::debug!("sched: cpu {} runs {} (pid {})", cpu, id.0, self.tasks[id.0].pid.0);
        Some(id)
    }

    // -----------------------------------------------------------------------
    // Time accounting
    // -----------------------------------------------------------------------

    /// Advance the global clock by one timer tick.
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.wakeup(WaitChannel::Ticks);
        self.advance_feedback();
    }

    /// Advance the feedback clock, boosting every feedback task when the
    /// boost period elapses.
    pub fn advance_feedback(&mut self) {
        if self.mlfq.advance() {
            log::debug!("mlfq: priority boost at feedback tick {}", self.mlfq.ticks());
            for task in self.tasks.iter_mut() {
                if let SchedClass::Feedback(state) = &mut task.class {
                    if state.enrolled {
                        self.mlfq.boost(state);
                    }
                }
            }
        }
    }

    /// Charge one tick to the task running on `cpu`. Returns true if it
    /// should be preempted.
    pub fn charge(&mut self, cpu: usize) -> bool {
        let Ok(id) = self.current(cpu) else {
            return false;
        };
        let task = &mut self.tasks[id.0];
        if task.state != TaskState::Running {
            return false;
        }
        match &mut task.class {
            SchedClass::Feedback(state) => self.mlfq.charge(state),
            SchedClass::Stride(_) => true,
        }
    }

    /// Feedback bookkeeping done on behalf of a yielding task: advance the
    /// feedback clock and charge the caller, so that yielding just before
    /// the timer fires does not escape accounting.
    pub fn yield_charge(&mut self, cpu: usize) {
        self.advance_feedback();
        if let Ok(id) = self.current(cpu) {
            if let SchedClass::Feedback(state) = &mut self.tasks[id.0].class {
                self.mlfq.charge(state);
            }
        }
    }

    /// Give the CPU back: the running task becomes Ready and, if it is a
    /// feedback task, goes to the tail of its level with a fresh quantum.
    pub fn yield_current(&mut self, cpu: usize) -> Result<TaskId> {
        let id = self.current(cpu)?;
        let task = &mut self.tasks[id.0];
        task.state = TaskState::Ready;
        if let SchedClass::Feedback(state) = &mut task.class {
            self.mlfq.requeue(state);
        }
        self.current[cpu] = None;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Sleep / wakeup
    // -----------------------------------------------------------------------

    /// Make every task blocked on `chan` runnable, with stride catch-up.
    pub fn wakeup(&mut self, chan: WaitChannel) -> usize {
        let min_pass = self.min_pass();
        let mut woken = 0;
        for task in self.tasks.iter_mut() {
            if task.state == TaskState::Blocked(chan) {
                make_ready(task, min_pass);
                woken += 1;
            }
        }
        woken
    }

    /// Mark every task of group `pid` killed and wake the blocked ones.
    pub fn kill(&mut self, pid: Pid) -> Result<()> {
        let min_pass = self.min_pass();
        let mut found = false;
        for task in self.tasks.iter_mut() {
            if task.is_free() || task.pid != pid {
                continue;
            }
            found = true;
            task.killed = true;
            if matches!(task.state, TaskState::Blocked(_)) {
                make_ready(task, min_pass);
            }
        }
        if found {
            log::info!("sched: pid {} killed", pid.0);
            Ok(())
        } else {
            Err(KernelError::NoSuchProcess(pid))
        }
    }
}

/// Move a blocked task back to Ready. A stride member is raised to
/// `min_pass` so it does not monopolize the CPU to make up for the time it
/// was away.
fn make_ready(task: &mut Task, min_pass: u64) {
    task.state = TaskState::Ready;
    if let SchedClass::Stride(record) = &mut task.class {
        record.pass = record.pass.max(min_pass);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
