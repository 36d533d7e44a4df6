//! # Lightweight Tasks
//!
//! Creation, join and exit of lightweight tasks: schedulable units that
//! share their group's address space, open files and current directory,
//! and own only a private stack page and an execution context.
//!
//! ## Lifecycle
//!
//! ```text
//!   thread_create ──► Embryo ──► Ready ⇄ Running ──► thread_exit ──► Terminated
//!                       │                                                │
//!                       └── failed setup: rolled back to Unused          │
//!                                                  thread_join (reap) ◄──┘
//! ```
//!
//! The group leader's slot bitmap and pending-result table are touched
//! only under the table lock. An exiting task publishes its result before
//! it becomes Terminated, in the same critical section, so a joiner that
//! sees Terminated always finds the result.

use core::convert::Infallible;
use core::mem::size_of;

use crate::arch::Cpu;
use crate::config::{NOFILE, STACK_SENTINEL};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::platform::{FileRef, FileSystem, InodeRef, Memory, Platform, SpaceId};
use crate::scheduler::Scheduler;
use crate::stack::StackRegion;
use crate::task::{Context, TaskId, TaskState, WaitChannel};

const WORD: usize = size_of::<usize>();

impl<P: Platform> Kernel<P> {
    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Start a lightweight task running `entry(arg)` in the caller's group.
    ///
    /// Returns the slot id that names the new task within the group. The
    /// new task shares the caller's address space, duplicates its open
    /// files and current directory, and is not schedulable until fully
    /// set up; any failure leaves the table as it was.
    pub fn thread_create(&self, entry: usize, arg: usize) -> Result<usize> {
        let cpu = self.platform.id();

        // Phase 1: claim a TCB and a stack slot.
        let (id, leader, region, space, files, cwd) = {
            let mut table = self.table.lock();
            let me = self.current(&table)?;
            let leader = table.leader_of(me);
            let space = table.task(leader).space.ok_or(KernelError::BadArgument)?;
            if table.task(leader).group.slots.is_full() {
                log::warn!("thread: pid {} has no free stack slot", table.task(leader).pid.0);
                return Err(KernelError::NoFreeSlot);
            }

            let id = table.alloc()?;
            let Some(kstack) = self.platform.alloc_kstack() else {
                table.task_mut(id).clear();
                return Err(KernelError::NoKernelStack);
            };
            let stack_base = table.task(leader).group.stack_base;
            let Some(slot) = table.task_mut(leader).group.slots.claim() else {
                self.platform.free_kstack(kstack);
                table.task_mut(id).clear();
                return Err(KernelError::NoFreeSlot);
            };
            let region = StackRegion::for_slot(stack_base, slot);

            let (pid, size, name) = {
                let l = table.task(leader);
                (l.pid, l.size, l.name)
            };
            let (files, cwd) = {
                let caller = table.task(me);
                (caller.files, caller.cwd)
            };

            let task = table.task_mut(id);
            task.pid = pid;
            task.parent = Some(leader);
            task.name = name;
            task.space = Some(space);
            task.size = size;
            task.kstack = Some(kstack);
            task.thread = Some(region);
            (id, leader, region, space, files, cwd)
        };

        // Phase 2: map the stack and build the first frame, unlocked. The
        // TCB is an Embryo, invisible to the scheduler.
        let context = match self.seed_stack(space, region, entry, arg) {
            Ok(context) => context,
            Err(err) => {
                log::warn!("thread: stack setup for slot {} failed: {}", region.slot, err);
                let mut table = self.table.lock();
                self.discard_embryo(&mut table, id, leader, region);
                return Err(err);
            }
        };

        let mut dup_files = [None; NOFILE];
        for (fd, file) in files.iter().enumerate() {
            dup_files[fd] = file.map(|f| self.platform.dup(f));
        }
        let dup_cwd = cwd.map(|inode| self.platform.idup(inode));

        // Phase 3: publish.
        let mut table = self.table.lock();
        let task = table.task_mut(id);
        task.context = context;
        task.files = dup_files;
        task.cwd = dup_cwd;
        table.enroll_feedback(id);
        table.task_mut(id).state = TaskState::Ready;

        log::info!(
            "thread: pid {} slot {} created on cpu {} (entry {:#x})",
            table.task(id).pid.0,
            region.slot,
            cpu,
            entry
        );
        Ok(region.slot)
    }

    /// Map the stack page of `region` and lay out the initial frame:
    /// the argument, below it the sentinel return address.
    fn seed_stack(
        &self,
        space: SpaceId,
        region: StackRegion,
        entry: usize,
        arg: usize,
    ) -> Result<Context> {
        let top = self.platform.map(space, region.base, region.top())?;

        let mut sp = top;
        let frame = [arg, STACK_SENTINEL];
        for word in frame {
            sp -= WORD;
            if let Err(err) = self.platform.write_word(space, sp, word) {
                self.platform.unmap(space, region.top(), region.base);
                return Err(err.into());
            }
        }

        Ok(Context { pc: entry, sp, arg, ret: 0 })
    }

    /// Undo phase 1 of a failed creation.
    fn discard_embryo(
        &self,
        table: &mut Scheduler,
        id: TaskId,
        leader: TaskId,
        region: StackRegion,
    ) {
        if let Some(kstack) = table.task_mut(id).kstack.take() {
            self.platform.free_kstack(kstack);
        }
        table.task_mut(id).clear();
        table.task_mut(leader).group.slots.release(region.slot);
        // A joiner may have seen the Embryo and gone to sleep on it.
        table.wakeup(WaitChannel::Join(leader));
    }

    // -----------------------------------------------------------------------
    // Join
    // -----------------------------------------------------------------------

    /// Wait for the lightweight task in `slot` of the caller's group to
    /// terminate, reap it, and return the result it exited with.
    ///
    /// Fails with [`KernelError::NoSuchMember`] if the slot is empty
    /// (never created, or already reaped) or names the caller itself, and
    /// with [`KernelError::Interrupted`] if the caller is killed while
    /// waiting.
    pub fn thread_join(&self, slot: usize) -> Result<usize> {
        self.join(slot, None)
    }

    /// Like [`Kernel::thread_join`], but first store the result at `out` in
    /// the caller's address space. If that store fails the member is left
    /// unreaped with its result pending, so a later join still gets it.
    pub fn thread_join_into(&self, slot: usize, out: usize) -> Result<usize> {
        self.join(slot, Some(out))
    }

    fn join(&self, slot: usize, out: Option<usize>) -> Result<usize> {
        let mut table = self.table.lock();
        let me = self.current(&table)?;
        let leader = table.leader_of(me);

        loop {
            let member = table
                .find_member(leader, slot)
                .filter(|&id| id != me)
                .ok_or(KernelError::NoSuchMember)?;

            if table.task(member).state == TaskState::Terminated {
                if let Some(addr) = out {
                    let value = table.task(leader).group.pending[slot].unwrap_or(0);
                    let space = table.task(me).space.ok_or(KernelError::BadArgument)?;
                    self.platform.write_word(space, addr, value)?;
                }
                return Ok(self.reap(&mut table, leader, member));
            }
            if table.task(me).killed {
                return Err(KernelError::Interrupted);
            }

            table = self.sleep(WaitChannel::Join(leader), table);
        }
    }

    /// Release everything a terminated lightweight task still holds and
    /// return its TCB to the unused pool.
    fn reap(&self, table: &mut Scheduler, leader: TaskId, id: TaskId) -> usize {
        let task = table.task_mut(id);
        let region = task.thread.take();
        let space = task.space;
        let kstack = task.kstack.take();

        if let (Some(region), Some(space)) = (region, space) {
            self.platform.unmap(space, region.top(), region.base);
        }
        if let Some(kstack) = kstack {
            self.platform.free_kstack(kstack);
        }
        table.task_mut(id).clear();

        let Some(region) = region else {
            return 0;
        };
        let book = &mut table.task_mut(leader).group;
        book.slots.release(region.slot);
        let value = book.pending[region.slot].take();
        debug_assert!(value.is_some(), "terminated member left no result");

        log::info!("thread: slot {} reaped, result {:#x}", region.slot, value.unwrap_or(0));
        value.unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Exit
    // -----------------------------------------------------------------------

    /// Terminate the calling lightweight task with result `retval`.
    ///
    /// On success this never returns: the task hands its CPU to the
    /// scheduler for good. The only error is calling it from a task that
    /// is not a lightweight task.
    pub fn thread_exit(&self, retval: usize) -> Result<Infallible> {
        let cpu = self.platform.id();

        let (me, files, cwd) = {
            let mut table = self.table.lock();
            let me = self.current(&table)?;
            let task = table.task_mut(me);
            if !task.is_lightweight() {
                return Err(KernelError::NotLightweight);
            }
            let files: [Option<FileRef>; NOFILE] = core::mem::take(&mut task.files);
            let cwd: Option<InodeRef> = task.cwd.take();
            (me, files, cwd)
        };

        for file in files.into_iter().flatten() {
            self.platform.close(file);
        }
        if let Some(cwd) = cwd {
            self.platform.begin_op();
            self.platform.iput(cwd);
            self.platform.end_op();
        }

        let mut table = self.table.lock();
        let leader = table.leader_of(me);
        table.wakeup(WaitChannel::Join(leader));
        table.release_class(me);

        if let Some(slot) = table.task(me).slot() {
            table.task_mut(leader).group.pending[slot] = Some(retval);
            log::info!("thread: pid {} slot {} exited with {:#x}", table.task(me).pid.0, slot, retval);
        }
        table.task_mut(me).state = TaskState::Terminated;
        table.current[cpu] = None;
        drop(table);

        self.platform.switch(me, TaskState::Terminated);
        panic!("terminated task {} was scheduled again", me.0);
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_THREADS, PAGE_SIZE, STRIDE_CONSTANT, TICKET_POOL};
    use crate::error::MapError;
    use crate::testing::{self, MockPlatform};
    use proptest::prelude::*;
    use std::sync::Arc;

    const ENTRY: usize = 0x1040;

    fn boot() -> (Arc<Kernel<MockPlatform>>, TaskId) {
        let kernel = Arc::new(Kernel::new(MockPlatform::new()));
        let leader = kernel.admit("main", SpaceId(1), 0x4000).unwrap();
        testing::set_cpu(0);
        testing::run_as(&kernel, 0, leader);
        (kernel, leader)
    }

    #[test]
    fn test_create_seeds_stack_and_context() {
        let (kernel, leader) = boot();
        let slot = kernel.thread_create(ENTRY, 0xabcd).unwrap();
        assert_eq!(slot, 0);

        let table = kernel.lock();
        let member = table.find_member(leader, 0).unwrap();
        let task = table.task(member);
        let top = 0x4000 + PAGE_SIZE;
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.pid, table.task(leader).pid);
        assert_eq!(task.parent, Some(leader));
        assert_eq!(task.space, Some(SpaceId(1)));
        assert_eq!(
            task.context,
            Context { pc: ENTRY, sp: top - 2 * WORD, arg: 0xabcd, ret: 0 }
        );
        assert_eq!(task.level(), Some(0));
        drop(table);

        let platform = kernel.platform();
        assert_eq!(platform.read_word(SpaceId(1), top - WORD), Some(0xabcd));
        assert_eq!(platform.read_word(SpaceId(1), top - 2 * WORD), Some(STACK_SENTINEL));
    }

    #[test]
    fn test_create_shares_files_and_cwd() {
        let (kernel, leader) = boot();
        kernel.install_file(leader, FileRef(3)).unwrap();
        kernel.install_file(leader, FileRef(4)).unwrap();
        kernel.set_cwd(leader, InodeRef(9)).unwrap();
        kernel.platform().open_file(FileRef(3));
        kernel.platform().open_file(FileRef(4));
        kernel.platform().open_inode(InodeRef(9));

        kernel.thread_create(ENTRY, 0).unwrap();
        let platform = kernel.platform();
        assert_eq!(platform.file_refs(FileRef(3)), 2);
        assert_eq!(platform.file_refs(FileRef(4)), 2);
        assert_eq!(platform.inode_refs(InodeRef(9)), 2);
        let member = kernel.lock().find_member(leader, 0).unwrap();
        assert_eq!(kernel.open_files(member), Ok(2));
    }

    #[test]
    fn test_slots_are_allocated_lowest_first() {
        let (kernel, leader) = boot();
        assert_eq!(kernel.thread_create(ENTRY, 1), Ok(0));
        assert_eq!(kernel.thread_create(ENTRY, 2), Ok(1));
        assert_eq!(kernel.thread_create(ENTRY, 3), Ok(2));

        let table = kernel.lock();
        assert_eq!(table.task(leader).group.slots.count(), 3);
        for slot in 0..3 {
            let member = table.find_member(leader, slot).unwrap();
            assert_eq!(table.task(member).slot(), Some(slot));
        }
    }

    #[test]
    fn test_full_bitmap_leaves_table_untouched() {
        let (kernel, leader) = boot();
        {
            let mut table = kernel.lock();
            for _ in 0..MAX_THREADS {
                table.task_mut(leader).group.slots.claim().unwrap();
            }
        }
        let live = kernel.lock().live_count();
        assert_eq!(kernel.thread_create(ENTRY, 0), Err(KernelError::NoFreeSlot));
        assert_eq!(kernel.lock().live_count(), live);
        assert_eq!(kernel.platform().kstacks_out(), 1);
    }

    #[test]
    fn test_full_table_rejects() {
        let (kernel, leader) = boot();
        let mut created = 0;
        loop {
            match kernel.thread_create(ENTRY, 0) {
                Ok(_) => created += 1,
                Err(err) => {
                    assert_eq!(err, KernelError::NoFreeTask);
                    break;
                }
            }
        }
        assert_eq!(created, crate::config::NPROC - 1);
        assert_eq!(kernel.lock().task(leader).group.slots.count(), created);
    }

    #[test]
    fn test_map_failure_rolls_back() {
        let (kernel, leader) = boot();
        kernel.platform().fail_next_map(MapError::OutOfMemory);
        assert_eq!(
            kernel.thread_create(ENTRY, 0),
            Err(KernelError::Map(MapError::OutOfMemory))
        );
        let table = kernel.lock();
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.task(leader).group.slots.count(), 0);
        drop(table);
        assert_eq!(kernel.platform().kstacks_out(), 1);
        assert_eq!(kernel.thread_create(ENTRY, 0), Ok(0));
    }

    #[test]
    fn test_join_without_children_fails() {
        let (kernel, _leader) = boot();
        for slot in [0, 1, 63, 200] {
            assert_eq!(kernel.thread_join(slot), Err(KernelError::NoSuchMember));
        }
    }

    #[test]
    fn test_exit_then_join_delivers_result() {
        let (kernel, leader) = boot();
        let a = kernel.thread_create(ENTRY, 0).unwrap();
        let b = kernel.thread_create(ENTRY, 0).unwrap();
        assert_eq!((a, b), (0, 1));

        let member_a = kernel.lock().find_member(leader, a).unwrap();
        testing::exit_on_cpu(&kernel, 1, member_a, 42);

        assert_eq!(kernel.thread_join(a), Ok(42));
        let table = kernel.lock();
        assert!(table.task(member_a).is_free());
        assert!(!table.task(leader).group.slots.is_taken(a));
        assert!(table.task(leader).group.slots.is_taken(b));
        drop(table);

        // Reaping is destructive.
        assert_eq!(kernel.thread_join(a), Err(KernelError::NoSuchMember));
        // The freed slot is reused.
        assert_eq!(kernel.thread_create(ENTRY, 0), Ok(0));
    }

    #[test]
    fn test_join_blocks_until_exit() {
        let (kernel, leader) = boot();
        let slot = kernel.thread_create(ENTRY, 0).unwrap();
        let member = kernel.lock().find_member(leader, slot).unwrap();

        let joiner = {
            let kernel = Arc::clone(&kernel);
            testing::spawn_on_cpu(0, move || kernel.thread_join(slot))
        };

        testing::wait_for(|| {
            kernel.lock().task(leader).state == TaskState::Blocked(WaitChannel::Join(leader))
        });
        assert!(kernel.lock().task(member).state != TaskState::Terminated);

        testing::exit_on_cpu(&kernel, 1, member, 7);
        assert_eq!(testing::recv(&joiner), Ok(7));
        assert!(kernel.lock().task(member).is_free());
    }

    #[test]
    fn test_member_can_join_sibling() {
        let (kernel, leader) = boot();
        let first = kernel.thread_create(ENTRY, 0).unwrap();
        let second = kernel.thread_create(ENTRY, 0).unwrap();
        let first_id = kernel.lock().find_member(leader, first).unwrap();
        let second_id = kernel.lock().find_member(leader, second).unwrap();

        testing::exit_on_cpu(&kernel, 1, second_id, 99);

        testing::set_cpu(2);
        testing::run_as(&kernel, 2, first_id);
        assert_eq!(kernel.thread_join(second), Ok(99));
        assert_eq!(kernel.thread_join(first), Err(KernelError::NoSuchMember));
    }

    #[test]
    fn test_killed_joiner_is_interrupted() {
        let (kernel, leader) = boot();
        let slot = kernel.thread_create(ENTRY, 0).unwrap();
        let pid = kernel.lock().task(leader).pid;

        let joiner = {
            let kernel = Arc::clone(&kernel);
            testing::spawn_on_cpu(0, move || kernel.thread_join(slot))
        };
        testing::wait_for(|| {
            matches!(kernel.lock().task(leader).state, TaskState::Blocked(_))
        });

        testing::set_cpu(3);
        kernel.kill(pid).unwrap();
        assert_eq!(testing::recv(&joiner), Err(KernelError::Interrupted));
    }

    #[test]
    fn test_exit_releases_files_and_cwd() {
        let (kernel, leader) = boot();
        kernel.install_file(leader, FileRef(3)).unwrap();
        kernel.set_cwd(leader, InodeRef(9)).unwrap();
        kernel.platform().open_file(FileRef(3));
        kernel.platform().open_inode(InodeRef(9));

        let slot = kernel.thread_create(ENTRY, 0).unwrap();
        let member = kernel.lock().find_member(leader, slot).unwrap();
        testing::exit_on_cpu(&kernel, 1, member, 0);

        let platform = kernel.platform();
        assert_eq!(platform.file_refs(FileRef(3)), 1);
        assert_eq!(platform.inode_refs(InodeRef(9)), 1);
        assert!(platform.iput_in_transaction());
        assert_eq!(kernel.lock().mlfq.members(), 1);
    }

    #[test]
    fn test_stride_member_exit_returns_share() {
        let (kernel, leader) = boot();
        let slot = kernel.thread_create(ENTRY, 0).unwrap();
        let member = kernel.lock().find_member(leader, slot).unwrap();

        testing::set_cpu(1);
        testing::run_as(&kernel, 1, member);
        kernel.set_cpu_share(30).unwrap();
        assert_eq!(kernel.aggregate_share(), TICKET_POOL - 30);

        testing::set_cpu(0);
        testing::exit_on_cpu(&kernel, 1, member, 5);
        let table = kernel.lock();
        assert_eq!(table.stride.aggregate().share, TICKET_POOL);
        assert_eq!(table.stride.aggregate().stride, STRIDE_CONSTANT / TICKET_POOL as u64);
        drop(table);
        assert_eq!(kernel.thread_join(slot), Ok(5));
    }

    #[test]
    fn test_exit_from_ordinary_task_is_rejected() {
        let (kernel, _leader) = boot();
        assert_eq!(kernel.thread_exit(1).unwrap_err(), KernelError::NotLightweight);
    }

    #[test]
    fn test_reap_unmaps_stack_and_frees_kstack() {
        let (kernel, leader) = boot();
        let slot = kernel.thread_create(ENTRY, 0).unwrap();
        let member = kernel.lock().find_member(leader, slot).unwrap();
        assert_eq!(kernel.platform().kstacks_out(), 2);
        assert!(kernel.platform().is_mapped(SpaceId(1), 0x4000));

        testing::exit_on_cpu(&kernel, 1, member, 0);
        kernel.thread_join(slot).unwrap();
        assert_eq!(kernel.platform().kstacks_out(), 1);
        assert!(!kernel.platform().is_mapped(SpaceId(1), 0x4000));
    }

    #[test]
    fn test_slot_reuse_scenario() {
        let (kernel, leader) = boot();
        assert_eq!(kernel.thread_create(ENTRY, 0), Ok(0));
        assert_eq!(kernel.thread_create(ENTRY, 0), Ok(1));
        let a = kernel.lock().find_member(leader, 0).unwrap();
        testing::exit_on_cpu(&kernel, 1, a, 42);
        assert_eq!(kernel.thread_join(0), Ok(42));

        // Slot 0 is handed to the next task, and joining it waits for that
        // task rather than returning the old result.
        assert_eq!(kernel.thread_create(ENTRY, 0), Ok(0));
        let fresh = kernel.lock().find_member(leader, 0).unwrap();
        let joiner = {
            let kernel = Arc::clone(&kernel);
            testing::spawn_on_cpu(0, move || kernel.thread_join(0))
        };
        testing::wait_for(|| {
            matches!(kernel.lock().task(leader).state, TaskState::Blocked(_))
        });
        testing::exit_on_cpu(&kernel, 1, fresh, 43);
        assert_eq!(testing::recv(&joiner), Ok(43));
    }

    /// Every taken bit of the leader's slot map has exactly one live
    /// member in that slot, and every free bit has none.
    fn assert_slots_consistent(kernel: &Kernel<MockPlatform>, leader: TaskId) {
        let table = kernel.lock();
        for slot in 0..MAX_THREADS {
            let holders = table
                .tasks
                .iter()
                .filter(|t| !t.is_free() && t.parent == Some(leader) && t.slot() == Some(slot))
                .count();
            let taken = table.task(leader).group.slots.is_taken(slot);
            assert_eq!(holders, usize::from(taken), "slot {} out of sync", slot);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_slots_match_live_members(ops in prop::collection::vec(0u8..=255, 0..24)) {
            let (kernel, leader) = boot();
            let mut running: std::vec::Vec<(usize, TaskId)> = std::vec::Vec::new();
            let mut exited: std::vec::Vec<usize> = std::vec::Vec::new();

            for op in ops {
                let pick = (op / 3) as usize;
                match op % 3 {
                    0 => {
                        let slot = kernel.thread_create(ENTRY, 0).unwrap();
                        let id = kernel.lock().find_member(leader, slot).unwrap();
                        running.push((slot, id));
                    }
                    1 if !running.is_empty() => {
                        let (slot, id) = running.remove(pick % running.len());
                        testing::exit_on_cpu(&kernel, 1, id, slot + 100);
                        exited.push(slot);
                    }
                    2 if !exited.is_empty() => {
                        let slot = exited.remove(pick % exited.len());
                        prop_assert_eq!(kernel.thread_join(slot), Ok(slot + 100));
                        prop_assert_eq!(kernel.thread_join(slot), Err(KernelError::NoSuchMember));
                    }
                    _ => {
                        let free = (0..MAX_THREADS)
                            .find(|s| !kernel.lock().task(leader).group.slots.is_taken(*s))
                            .unwrap();
                        prop_assert_eq!(kernel.thread_join(free), Err(KernelError::NoSuchMember));
                    }
                }
                assert_slots_consistent(&kernel, leader);
            }
        }
    }
}
