//! # System Call Layer
//!
//! Thin marshaling between the trap handler and [`Kernel`]: fetch raw
//! integer arguments, call the operation, fold the outcome into the single
//! integer user space sees.
//!
//! Numbers:
//!   6   kill(pid)
//!   11  getpid()
//!   13  sleep(ticks)
//!   14  uptime()
//!   22  yield()
//!   23  getppid()
//!   24  getlev()
//!   25  set_cpu_share(percent)
//!   26  thread_create(thread_out, start, arg)
//!   27  thread_exit(retval)
//!   28  thread_join(thread, retval_out)

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::task::Pid;

pub const SYS_KILL: usize = 6;
pub const SYS_GETPID: usize = 11;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_YIELD: usize = 22;
pub const SYS_GETPPID: usize = 23;
pub const SYS_GETLEV: usize = 24;
pub const SYS_SET_CPU_SHARE: usize = 25;
pub const SYS_THREAD_CREATE: usize = 26;
pub const SYS_THREAD_EXIT: usize = 27;
pub const SYS_THREAD_JOIN: usize = 28;

/// Access to the raw arguments of the trapping call.
pub trait SyscallArgs {
    /// The `n`th integer argument.
    fn arg_int(&self, n: usize) -> Result<isize>;

    fn arg_usize(&self, n: usize) -> Result<usize> {
        Ok(self.arg_int(n)? as usize)
    }
}

/// Run system call `number` for the task on the executing CPU.
pub fn dispatch<P: Platform>(kernel: &Kernel<P>, number: usize, args: &dyn SyscallArgs) -> isize {
    match handle(kernel, number, args) {
        Ok(value) => value,
        Err(err) => {
            log::debug!("syscall {} failed: {}", number, err);
            err.errno()
        }
    }
}

fn handle<P: Platform>(kernel: &Kernel<P>, number: usize, args: &dyn SyscallArgs) -> Result<isize> {
    match number {
        SYS_KILL => {
            let pid = u32::try_from(args.arg_int(0)?).map_err(|_| KernelError::BadArgument)?;
            kernel.kill(Pid(pid))?;
            Ok(0)
        }
        SYS_GETPID => Ok(kernel.getpid()?.0 as isize),
        SYS_SLEEP => {
            let n = u64::try_from(args.arg_int(0)?).map_err(|_| KernelError::BadArgument)?;
            kernel.sleep_ticks(n)?;
            Ok(0)
        }
        SYS_UPTIME => Ok(kernel.uptime() as isize),
        SYS_YIELD => {
            kernel.yield_now()?;
            Ok(0)
        }
        SYS_GETPPID => Ok(kernel.getppid()?.0 as isize),
        // A stride member has no level; it reports -1 like a failure.
        SYS_GETLEV => Ok(kernel.getlev()?.map_or(-1, |level| level as isize)),
        SYS_SET_CPU_SHARE => {
            let percent = u32::try_from(args.arg_int(0)?).map_err(|_| KernelError::InvalidShare)?;
            kernel.set_cpu_share(percent)?;
            Ok(0)
        }
        SYS_THREAD_CREATE => {
            let thread_out = args.arg_usize(0)?;
            let start = args.arg_usize(1)?;
            let arg = args.arg_usize(2)?;
            // A task the caller cannot name must not be started.
            kernel.copy_out(thread_out, 0)?;
            let slot = kernel.thread_create(start, arg)?;
            kernel.copy_out(thread_out, slot)?;
            Ok(0)
        }
        SYS_THREAD_EXIT => {
            let retval = args.arg_usize(0)?;
            match kernel.thread_exit(retval)? {}
        }
        SYS_THREAD_JOIN => {
            let slot = args.arg_usize(0)?;
            let retval_out = args.arg_usize(1)?;
            kernel.thread_join_into(slot, retval_out)?;
            Ok(0)
        }
        _ => {
            log::warn!("syscall: unknown number {}", number);
            Err(KernelError::UnknownSyscall(number))
        }
    }
}
