//! # Errors
//!
//! Every recoverable failure of the scheduler and lightweight-task
//! subsystem. Errors are returned to the immediate caller; the syscall
//! layer turns them into the negative integers user space sees.

use crate::task::Pid;

/// Failure reported by the address-space collaborator.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    #[error("out of physical memory")]
    OutOfMemory,

    #[error("address {0:#x} is outside the address space")]
    BadAddress(usize),
}

/// A centralized error type for all scheduler and lifecycle operations.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("task table is full")]
    NoFreeTask,

    #[error("no free kernel stack")]
    NoKernelStack,

    #[error("every stack slot of the group is occupied")]
    NoFreeSlot,

    #[error("stack mapping failed: {0}")]
    Map(#[from] MapError),

    #[error("cpu share {requested}% exceeds the {available}% still available")]
    ShareExceeded { requested: u32, available: u32 },

    #[error("cpu share must be a positive percentage")]
    InvalidShare,

    #[error("no such member in the caller's group")]
    NoSuchMember,

    #[error("caller was killed while waiting")]
    Interrupted,

    #[error("caller is not a lightweight task")]
    NotLightweight,

    #[error("no task is running on this cpu")]
    NoCurrentTask,

    #[error("no process with pid {0}")]
    NoSuchProcess(Pid),

    #[error("bad syscall argument")]
    BadArgument,

    #[error("unknown syscall {0}")]
    UnknownSyscall(usize),
}

impl KernelError {
    /// The value a failed system call returns to user space.
    ///
    /// Every classic failure collapses to `-1`; an unknown syscall number
    /// reports `-ENOSYS`.
    pub fn errno(&self) -> isize {
        match self {
            KernelError::UnknownSyscall(_) => -38,
            _ => -1,
        }
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;
