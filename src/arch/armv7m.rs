//! # Armv7-M Exception Frame
//!
//! Layout of the frame a PendSV-based port pops when it resumes a task
//! for the first time. Kept target-independent so the layout can be
//! checked on the host.
//!
//! ```text
//!   psp ──► R4 R5 R6 R7 R8 R9 R10 R11 │ R0 R1 R2 R3 R12 LR PC xPSR ◄── ctx.sp
//!           └── pushed by software ───┘ └──── stacked by hardware ───┘
//! ```

use crate::config::STACK_SENTINEL;
use crate::task::Context;

/// Words in a full saved frame: R4–R11 then the hardware frame.
pub const FRAME_WORDS: usize = 16;

/// xPSR with only the Thumb bit set.
const XPSR_THUMB: u32 = 1 << 24;

const R0: usize = 8;
const LR: usize = 13;
const PC: usize = 14;
const XPSR: usize = 15;

/// Frame that starts `ctx` at its entry routine, lowest address first.
///
/// The entry routine receives `ctx.arg` in R0, as AAPCS passes the first
/// argument, and returns into the stack sentinel.
pub fn initial_frame(ctx: &Context) -> [u32; FRAME_WORDS] {
    let mut frame = [0u32; FRAME_WORDS];
    frame[R0] = ctx.arg as u32;
    frame[LR] = STACK_SENTINEL as u32;
    frame[PC] = ctx.pc as u32;
    frame[XPSR] = XPSR_THUMB;
    frame
}
