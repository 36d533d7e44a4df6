//! Host test harness: an in-memory platform and helpers for driving the
//! kernel from several OS threads, each standing in for one CPU.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::arch::Cpu;
use crate::config::PAGE_SIZE;
use crate::error::MapError;
use crate::kernel::Kernel;
use crate::platform::{FileRef, FileSystem, InodeRef, KernelStack, Memory, Platform, SpaceId};
use crate::task::{TaskId, TaskState};

const PATIENCE: Duration = Duration::from_secs(5);

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
}

/// Make the calling OS thread act as `cpu`.
pub fn set_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
}

#[derive(Default)]
struct MockState {
    pages: HashSet<(SpaceId, usize)>,
    words: HashMap<(SpaceId, usize), usize>,
    files: HashMap<FileRef, usize>,
    inodes: HashMap<InodeRef, usize>,
    kstacks_out: usize,
    kstacks_issued: usize,
    kstack_limit: Option<usize>,
    fail_map: Option<MapError>,
    op_depth: usize,
    iputs: usize,
    iputs_outside_op: usize,
}

/// In-memory stand-in for the memory manager, file layer and CPUs.
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Allow at most `limit` kernel stacks to be outstanding.
    pub fn set_kstack_limit(&self, limit: usize) {
        self.state().kstack_limit = Some(limit);
    }

    pub fn kstacks_out(&self) -> usize {
        self.state().kstacks_out
    }

    /// Make the next `map` call fail with `err`.
    pub fn fail_next_map(&self, err: MapError) {
        self.state().fail_map = Some(err);
    }

    pub fn is_mapped(&self, space: SpaceId, addr: usize) -> bool {
        self.state().pages.contains(&(space, page_of(addr)))
    }

    pub fn read_word(&self, space: SpaceId, addr: usize) -> Option<usize> {
        self.state().words.get(&(space, addr)).copied()
    }

    /// Register one reference on `file`, as the file layer would on open.
    pub fn open_file(&self, file: FileRef) {
        *self.state().files.entry(file).or_default() += 1;
    }

    pub fn open_inode(&self, inode: InodeRef) {
        *self.state().inodes.entry(inode).or_default() += 1;
    }

    pub fn file_refs(&self, file: FileRef) -> usize {
        self.state().files.get(&file).copied().unwrap_or(0)
    }

    pub fn inode_refs(&self, inode: InodeRef) -> usize {
        self.state().inodes.get(&inode).copied().unwrap_or(0)
    }

    /// True if at least one `iput` happened and all of them ran inside a
    /// transaction.
    pub fn iput_in_transaction(&self) -> bool {
        let state = self.state();
        state.iputs > 0 && state.iputs_outside_op == 0
    }
}

fn page_of(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

impl Memory for MockPlatform {
    fn map(&self, space: SpaceId, old_end: usize, new_end: usize) -> Result<usize, MapError> {
        let mut state = self.state();
        if let Some(err) = state.fail_map.take() {
            return Err(err);
        }
        let mut page = page_of(old_end);
        while page < new_end {
            state.pages.insert((space, page));
            page += PAGE_SIZE;
        }
        Ok(new_end)
    }

    fn unmap(&self, space: SpaceId, old_end: usize, new_end: usize) {
        let mut state = self.state();
        state
            .pages
            .retain(|&(s, page)| s != space || page < new_end || page >= old_end);
        state
            .words
            .retain(|&(s, addr), _| s != space || addr < new_end || addr >= old_end);
    }

    fn write_word(&self, space: SpaceId, addr: usize, value: usize) -> Result<(), MapError> {
        let mut state = self.state();
        if !state.pages.contains(&(space, page_of(addr))) {
            return Err(MapError::BadAddress(addr));
        }
        state.words.insert((space, addr), value);
        Ok(())
    }

    fn alloc_kstack(&self) -> Option<KernelStack> {
        let mut state = self.state();
        if state.kstack_limit.is_some_and(|limit| state.kstacks_out >= limit) {
            return None;
        }
        state.kstacks_out += 1;
        state.kstacks_issued += 1;
        Some(KernelStack(0x8000_0000 + state.kstacks_issued * PAGE_SIZE))
    }

    fn free_kstack(&self, _stack: KernelStack) {
        self.state().kstacks_out -= 1;
    }
}

impl FileSystem for MockPlatform {
    fn dup(&self, file: FileRef) -> FileRef {
        *self.state().files.entry(file).or_default() += 1;
        file
    }

    fn close(&self, file: FileRef) {
        if let Some(refs) = self.state().files.get_mut(&file) {
            *refs -= 1;
        }
    }

    fn idup(&self, inode: InodeRef) -> InodeRef {
        *self.state().inodes.entry(inode).or_default() += 1;
        inode
    }

    fn iput(&self, inode: InodeRef) {
        let mut state = self.state();
        state.iputs += 1;
        if state.op_depth == 0 {
            state.iputs_outside_op += 1;
        }
        if let Some(refs) = state.inodes.get_mut(&inode) {
            *refs -= 1;
        }
    }

    fn begin_op(&self) {
        self.state().op_depth += 1;
    }

    fn end_op(&self) {
        self.state().op_depth -= 1;
    }
}

impl Cpu for MockPlatform {
    fn id(&self) -> usize {
        CPU.with(Cell::get)
    }

    /// There is no real scheduler loop on the host. A blocked task naps
    /// briefly and resumes, which its caller treats as a spurious wakeup;
    /// a terminated task parks its OS thread for good.
    fn switch(&self, _from: TaskId, state: TaskState) {
        match state {
            TaskState::Blocked(_) => thread::sleep(Duration::from_millis(1)),
            TaskState::Terminated => loop {
                thread::park();
            },
            _ => {}
        }
    }
}

/// Pretend `id` was dispatched on `cpu`.
pub fn run_as<P: Platform>(kernel: &Kernel<P>, cpu: usize, id: TaskId) {
    let mut table = kernel.lock();
    table.task_mut(id).state = TaskState::Running;
    table.current[cpu] = Some(id);
}

/// Run `f` on a fresh OS thread acting as `cpu`; its result arrives on
/// the returned channel.
pub fn spawn_on_cpu<T, F>(cpu: usize, f: F) -> Receiver<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        set_cpu(cpu);
        let _ = tx.send(f());
    });
    rx
}

pub fn recv<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(PATIENCE).expect("no result from spawned cpu")
}

/// Poll until `cond` holds.
pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < PATIENCE, "condition never became true");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Run lightweight task `id` on `cpu` and have it exit with `retval`.
/// Returns once the task is Terminated, or already reaped by a joiner
/// that was waiting for it.
pub fn exit_on_cpu(kernel: &Arc<Kernel<MockPlatform>>, cpu: usize, id: TaskId, retval: usize) {
    let worker = Arc::clone(kernel);
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        set_cpu(cpu);
        run_as(&worker, cpu, id);
        let _ = tx.send(());
        let _ = worker.thread_exit(retval);
    });
    recv(&rx);
    wait_for(|| {
        matches!(
            kernel.lock().task(id).state,
            TaskState::Terminated | TaskState::Unused
        )
    });
}
