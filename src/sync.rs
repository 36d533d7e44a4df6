//! # Synchronization Primitives
//!
//! The task table lock.
//!
//! `TableLock` is the single serialization point of the subsystem: task
//! state transitions, scheduling-class membership and stack-slot bitmaps
//! are only touched through its guard. It is a spinlock, so several cores
//! may contend for it at once.

use spin::{Mutex, MutexGuard};

/// Guard returned by [`TableLock::lock`]. Dropping it releases the lock.
pub type TableGuard<'a, T> = MutexGuard<'a, T>;

/// Spinlock around the task table.
///
/// # Usage
/// ```ignore
/// let mut table = kernel.table.lock();
/// table.tasks[i].state = TaskState::Ready;
/// // lock released when `table` goes out of scope
/// ```
pub struct TableLock<T> {
    inner: Mutex<T>,
}

impl<T> TableLock<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    /// Acquire the lock, spinning until it is free.
    #[inline]
    pub fn lock(&self) -> TableGuard<'_, T> {
        self.inner.lock()
    }

    /// Whether some context currently holds the lock. Only meaningful for
    /// assertions, the answer may be stale by the time it is read.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_release_on_drop() {
        let lock = TableLock::new(5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);
    }
}
