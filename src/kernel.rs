//! # Kernel
//!
//! Top-level registry and public API of lwpos.
//!
//! [`Kernel`] owns the task table behind the single [`TableLock`] together
//! with the platform collaborators. Every state transition goes through
//! one of its methods; nothing else holds a reference to the table.
//!
//! ## Entry Points
//!
//! ```text
//! timer interrupt ──► timer_tick()  ──► charge running task, maybe preempt
//! scheduler loop  ──► dispatch()    ──► stride round, then feedback round
//! syscalls        ──► yield_now() · set_cpu_share() · kill() · get*()
//!                     sleep_ticks() · uptime()
//!                     thread_create() · thread_join() · thread_exit()
//!                                         (see thread.rs)
//! ```

use crate::arch::Cpu;
use crate::error::{KernelError, Result};
use crate::platform::{FileRef, InodeRef, Platform, SpaceId};
use crate::scheduler::Scheduler;
use crate::stack::page_round_up;
use crate::sync::{TableGuard, TableLock};
use crate::task::{Context, GroupBook, Pid, SchedClass, TaskId, TaskState, WaitChannel};

/// The scheduling and lightweight-task subsystem.
pub struct Kernel<P: Platform> {
    pub(crate) table: TableLock<Scheduler>,
    pub(crate) platform: P,
}

impl<P: Platform> Kernel<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            table: TableLock::new(Scheduler::new()),
            platform,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Acquire the table lock. Callers must not hold it across any call
    /// back into `Kernel`.
    pub fn lock(&self) -> TableGuard<'_, Scheduler> {
        self.table.lock()
    }

    /// Task running on the executing CPU.
    pub(crate) fn current(&self, table: &Scheduler) -> Result<TaskId> {
        table.current(self.platform.id())
    }

    // -----------------------------------------------------------------------
    // Task admission
    // -----------------------------------------------------------------------

    /// Install an ordinary task built by the process layer.
    ///
    /// The task joins the feedback class at level 0 and is immediately
    /// runnable. Its lightweight-task stacks will start at the page-rounded
    /// end of its address space.
    pub fn admit(&self, name: &str, space: SpaceId, size: usize) -> Result<TaskId> {
        let mut table = self.table.lock();
        let id = table.alloc()?;
        let Some(kstack) = self.platform.alloc_kstack() else {
            table.task_mut(id).clear();
            return Err(KernelError::NoKernelStack);
        };
        let pid = table.next_pid();

        let task = table.task_mut(id);
        task.pid = pid;
        task.set_name(name);
        task.space = Some(space);
        task.size = size;
        task.kstack = Some(kstack);
        task.group = GroupBook::new(page_round_up(size));
        table.enroll_feedback(id);
        table.task_mut(id).state = TaskState::Ready;

        log::info!("kernel: admitted pid {} ({}) in slot {}", pid.0, name, id.0);
        Ok(id)
    }

    /// Hand an open file reference to task `id`. Returns the descriptor.
    pub fn install_file(&self, id: TaskId, file: FileRef) -> Result<usize> {
        let mut table = self.table.lock();
        let task = table.live_mut(id)?;
        let fd = task
            .files
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::BadArgument)?;
        task.files[fd] = Some(file);
        Ok(fd)
    }

    /// Set the current directory of task `id`, taking over the reference.
    /// Returns the previous directory, whose reference the caller now owns.
    pub fn set_cwd(&self, id: TaskId, cwd: InodeRef) -> Result<Option<InodeRef>> {
        Ok(self.table.lock().live_mut(id)?.cwd.replace(cwd))
    }

    // -----------------------------------------------------------------------
    // Scheduler loop and time
    // -----------------------------------------------------------------------

    /// Choose the next task for the executing CPU and mark it Running.
    /// Returns None when nothing is runnable.
    pub fn dispatch(&self) -> Option<TaskId> {
        self.table.lock().dispatch(self.platform.id())
    }

    /// Seed the context an admitted task starts from.
    pub fn set_context(&self, id: TaskId, context: Context) -> Result<()> {
        self.table.lock().live_mut(id)?.context = context;
        Ok(())
    }

    /// Saved context of task `id`, for the arch layer to resume.
    pub fn context(&self, id: TaskId) -> Result<Context> {
        Ok(self.table.lock().live(id)?.context)
    }

    /// Timer interrupt bookkeeping. CPU 0 drives the global clock; every
    /// CPU charges its running task. Returns true if that task should be
    /// preempted.
    pub fn timer_tick(&self) -> bool {
        let cpu = self.platform.id();
        let mut table = self.table.lock();
        if cpu == 0 {
            table.tick();
        }
        table.charge(cpu)
    }

    /// Preempt the running task after [`Kernel::timer_tick`] asked for it.
    pub fn preempt(&self) -> Result<()> {
        let cpu = self.platform.id();
        let me = self.table.lock().yield_current(cpu)?;
        self.switch_away(me, TaskState::Ready);
        Ok(())
    }

    /// Cooperative yield.
    ///
    /// Feedback bookkeeping advances only on even ticks, so a task that
    /// yields many times per tick is charged no more often than one that
    /// yields once every two ticks.
    pub fn yield_now(&self) -> Result<()> {
        let cpu = self.platform.id();
        let me = {
            let mut table = self.table.lock();
            self.current(&table)?;
            if table.ticks % 2 == 0 {
                table.yield_charge(cpu);
            }
            table.yield_current(cpu)?
        };
        self.switch_away(me, TaskState::Ready);
        Ok(())
    }

    /// Hand the CPU to the scheduler loop and come back Running.
    fn switch_away(&self, me: TaskId, state: TaskState) {
        self.platform.switch(me, state);
        let mut table = self.table.lock();
        table.task_mut(me).state = TaskState::Running;
        table.current[self.platform.id()] = Some(me);
    }

    /// Number of timer ticks since boot.
    pub fn uptime(&self) -> u64 {
        self.table.lock().ticks
    }

    // -----------------------------------------------------------------------
    // Sleep / wakeup
    // -----------------------------------------------------------------------

    /// Block the running task on `chan`, releasing the table lock while it
    /// sleeps, and return with the lock held again.
    ///
    /// Wakeups can be spurious; callers re-check their condition in a loop.
    pub fn sleep<'a>(
        &'a self,
        chan: WaitChannel,
        mut table: TableGuard<'a, Scheduler>,
    ) -> TableGuard<'a, Scheduler> {
        let cpu = self.platform.id();
        let Ok(me) = table.current(cpu) else {
            return table;
        };
        table.task_mut(me).state = TaskState::Blocked(chan);
        table.current[cpu] = None;
        drop(table);

        self.platform.switch(me, TaskState::Blocked(chan));

        let mut table = self.table.lock();
        table.task_mut(me).state = TaskState::Running;
        table.current[self.platform.id()] = Some(me);
        table
    }

    /// Block the running task for `n` timer ticks. Fails with
    /// [`KernelError::Interrupted`] if the task is killed meanwhile.
    pub fn sleep_ticks(&self, n: u64) -> Result<()> {
        let mut table = self.table.lock();
        let me = self.current(&table)?;
        let start = table.ticks;
        while table.ticks - start < n {
            if table.task(me).killed {
                return Err(KernelError::Interrupted);
            }
            table = self.sleep(WaitChannel::Ticks, table);
        }
        Ok(())
    }

    /// Wake every task blocked on `chan`. Returns how many were woken.
    pub fn wakeup(&self, chan: WaitChannel) -> usize {
        self.table.lock().wakeup(chan)
    }

    /// Mark every task of group `pid` killed. Blocked members are woken so
    /// that a pending join fails instead of waiting forever.
    pub fn kill(&self, pid: Pid) -> Result<()> {
        self.table.lock().kill(pid)
    }

    // -----------------------------------------------------------------------
    // Share reservation
    // -----------------------------------------------------------------------

    /// Move the running task into the stride class with `percent` of the
    /// CPU. Fails, changing nothing, if the pool cannot cover the request.
    pub fn set_cpu_share(&self, percent: u32) -> Result<()> {
        let mut table = self.table.lock();
        let me = self.current(&table)?;
        table.set_share(me, percent)
    }

    /// Share held by the leader of group `pid`, if it is a stride member.
    pub fn share_of(&self, pid: Pid) -> Option<u32> {
        let table = self.table.lock();
        let leader = table.find_group(pid)?;
        match table.task(leader).class {
            SchedClass::Stride(record) if record.valid => Some(record.share),
            _ => None,
        }
    }

    /// Share currently held by the feedback aggregate.
    pub fn aggregate_share(&self) -> u32 {
        self.table.lock().stride.aggregate().share
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn getpid(&self) -> Result<Pid> {
        let table = self.table.lock();
        let me = self.current(&table)?;
        Ok(table.task(me).pid)
    }

    /// Pid of the creator of the running task; `Pid(0)` for a task the
    /// process layer admitted without a parent.
    pub fn getppid(&self) -> Result<Pid> {
        let table = self.table.lock();
        let me = self.current(&table)?;
        Ok(table
            .task(me)
            .parent
            .map_or(Pid(0), |parent| table.task(parent).pid))
    }

    /// Feedback level of the running task; None for a stride member.
    pub fn getlev(&self) -> Result<Option<usize>> {
        let table = self.table.lock();
        let me = self.current(&table)?;
        Ok(table.task(me).level())
    }

    /// Store `value` at `addr` in the running task's address space.
    pub fn copy_out(&self, addr: usize, value: usize) -> Result<()> {
        let space = {
            let table = self.table.lock();
            let me = self.current(&table)?;
            table.task(me).space.ok_or(KernelError::BadArgument)?
        };
        self.platform.write_word(space, addr, value)?;
        Ok(())
    }

    /// Open descriptors of task `id`.
    pub fn open_files(&self, id: TaskId) -> Result<usize> {
        Ok(self.table.lock().live(id)?.files.iter().flatten().count())
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
