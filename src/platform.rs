//! # Platform Collaborators
//!
//! Services the subsystem consumes but does not implement: address-space
//! mapping, kernel stacks, reference-counted file and directory handles,
//! and filesystem transaction boundaries. The CPU hand-off lives in
//! [`crate::arch::Cpu`].
//!
//! All handles are opaque and `Copy`. Ownership of what they name is
//! tracked by the collaborator through its own reference counts.

use crate::arch::Cpu;
use crate::error::MapError;

/// Handle of an address space. Every lightweight task of a group holds
/// the leader's handle, so the space is shared, never duplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceId(pub u32);

/// Handle of an open file (one reference).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRef(pub u32);

/// Handle of an inode, used for the current directory (one reference).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeRef(pub u32);

/// Kernel-internal stack of a task, used while it executes in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelStack(pub usize);

/// Address-space and kernel-stack services.
pub trait Memory {
    /// Grow `space` from `old_end` to `new_end`, mapping fresh zeroed pages.
    /// Returns the new end of the mapped range.
    fn map(&self, space: SpaceId, old_end: usize, new_end: usize) -> Result<usize, MapError>;

    /// Release the pages of `space` between `new_end` and `old_end`.
    fn unmap(&self, space: SpaceId, old_end: usize, new_end: usize);

    /// Store one machine word at `addr` inside `space`.
    fn write_word(&self, space: SpaceId, addr: usize, value: usize) -> Result<(), MapError>;

    fn alloc_kstack(&self) -> Option<KernelStack>;

    fn free_kstack(&self, stack: KernelStack);
}

/// File-table and directory services.
pub trait FileSystem {
    /// Take one more reference on an open file.
    fn dup(&self, file: FileRef) -> FileRef;

    /// Drop one reference on an open file.
    fn close(&self, file: FileRef);

    /// Take one more reference on an inode.
    fn idup(&self, inode: InodeRef) -> InodeRef;

    /// Drop one reference on an inode. Must run inside a transaction.
    fn iput(&self, inode: InodeRef);

    /// Begin a filesystem transaction.
    fn begin_op(&self);

    /// End a filesystem transaction.
    fn end_op(&self);
}

/// Everything [`crate::kernel::Kernel`] needs from its surroundings.
pub trait Platform: Memory + FileSystem + Cpu {}

impl<T: Memory + FileSystem + Cpu> Platform for T {}
