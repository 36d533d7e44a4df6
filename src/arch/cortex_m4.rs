//! # Cortex-M4 Port Layer
//!
//! Hardware-specific glue for a single-core ARM Cortex-M4 (Thumb-2) board.
//! Implements the [`Cpu`] hand-off via PendSV, SysTick configuration, and
//! the Rust half of the context switch.
//!
//! ## Context Switch Mechanism
//!
//! Tasks run in Thread mode on the process stack (PSP). On exception entry
//! the hardware stacks R0–R3, R12, LR, PC and xPSR; the board's PendSV
//! trampoline pushes R4–R11 below them, calls [`select_next`] with the
//! resulting PSP, and restores R4–R11 from the PSP it gets back.
//!
//! ```text
//!   task ──switch()──► PENDSVSET ──► PendSV trampoline ──► select_next()
//!                                        │                    │
//!                                        └── resume next ◄────┘
//! ```
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV both run at the lowest priority, so neither preempts
//! the other and PendSV never delays an application interrupt.

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;

use crate::arch::armv7m::{initial_frame, FRAME_WORDS};
use crate::arch::Cpu;
use crate::config::{NPROC, SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::sync::TableLock;
use crate::task::{Context, TaskId, TaskState};

// ---------------------------------------------------------------------------
// Port state
// ---------------------------------------------------------------------------

struct PortState {
    /// Task whose registers are live on the core.
    on_cpu: Option<TaskId>,
    /// Saved PSP per task; 0 until the task has been switched out once.
    psp: [usize; NPROC],
    /// PSP of the idle loop, resumed when nothing is runnable.
    idle_psp: usize,
}

static PORT: TableLock<PortState> = TableLock::new(PortState {
    on_cpu: None,
    psp: [0; NPROC],
    idle_psp: 0,
});

// ---------------------------------------------------------------------------
// Cpu implementation
// ---------------------------------------------------------------------------

/// The single core of a Cortex-M4 board.
pub struct CortexM4;

impl Cpu for CortexM4 {
    fn id(&self) -> usize {
        0
    }

    fn switch(&self, _from: TaskId, state: TaskState) {
        SCB::set_pendsv();
        cortex_m::asm::isb();
        // PendSV has run by now; execution continues here once this task
        // is dispatched again. A terminated task is never dispatched.
        if state == TaskState::Terminated {
            loop {
                cortex_m::asm::wfi();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    // SAFETY: SHPR3 (0xE000_ED20) is a word-aligned System Control Space
    // register; bits [23:16] hold the PendSV priority, [31:24] SysTick.
    unsafe {
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        core::ptr::write_volatile(shpr3, val | (0xFF << 16) | (0xFF << 24));
    }
}

// ---------------------------------------------------------------------------
// Exception entry points
// ---------------------------------------------------------------------------

/// Body of the SysTick handler: account the tick and, if the running task
/// is out of time, put it back in the ready set and pend a switch.
pub fn on_systick<P: Platform>(kernel: &Kernel<P>) {
    if kernel.timer_tick() && kernel.lock().yield_current(0).is_ok() {
        SCB::set_pendsv();
    }
}

/// Rust half of PendSV. Stores `saved_psp` for the task that was on the
/// core, dispatches the next one, and returns the PSP to restore.
pub fn select_next<P: Platform>(kernel: &Kernel<P>, saved_psp: usize) -> usize {
    let mut port = PORT.lock();
    match port.on_cpu.take() {
        // A terminated task never resumes; its entry may be reused.
        Some(prev) if kernel.lock().task(prev).state == TaskState::Terminated => {
            port.psp[prev.0] = 0;
        }
        Some(prev) => port.psp[prev.0] = saved_psp,
        None => port.idle_psp = saved_psp,
    }

    let Some(next) = kernel.dispatch() else {
        return port.idle_psp;
    };
    port.on_cpu = Some(next);
    if port.psp[next.0] == 0 {
        // First dispatch: fabricate the frame the trampoline will pop.
        let ctx = kernel.context(next).unwrap_or_default();
        // SAFETY: the stack of a new task is mapped and at least one
        // page deep; the frame takes 64 bytes below its seeded sp.
        port.psp[next.0] = unsafe { seed_frame(ctx) };
    }
    port.psp[next.0]
}

/// Build the initial exception frame below `ctx.sp` and return the PSP
/// that points at its R4–R11 block.
///
/// # Safety
/// `ctx.sp` must point one past a writable, word-aligned region of at
/// least `FRAME_WORDS` words.
unsafe fn seed_frame(ctx: Context) -> usize {
    let sp = (ctx.sp - FRAME_WORDS * 4) as *mut u32;
    for (i, word) in initial_frame(&ctx).into_iter().enumerate() {
        sp.add(i).write_volatile(word);
    }
    sp as usize
}
