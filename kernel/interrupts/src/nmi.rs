//! NMI handling (vector 2): spec.md §4.4 — "if any CPU is currently paused
//! (debugger) or halting-all, either spin until clear or halt; otherwise
//! panic." This core has no debugger or system-halt feature of its own, so
//! the two conditions are exposed as plain global flags any such feature
//! (out of scope) can set, the same bare-flag shape `tlb_shootdown` and
//! `ipi` use for their own coordination state.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::signal::SigInfo;
use crate::TrapFrame;

static DEBUGGER_PAUSED: AtomicBool = AtomicBool::new(false);
static HALTING_ALL: AtomicBool = AtomicBool::new(false);

/// Set by an (out-of-scope) debugger integration while it has stopped the
/// system to inspect state; NMIs on every other CPU spin rather than panic
/// while this is set.
pub fn set_debugger_paused(paused: bool) {
    DEBUGGER_PAUSED.store(paused, Ordering::Release);
}

pub fn is_debugger_paused() -> bool {
    DEBUGGER_PAUSED.load(Ordering::Acquire)
}

/// Set by an (out-of-scope) fatal-error broadcast that wants every other
/// CPU to come to a stop via NMI rather than keep running.
pub fn set_halting_all(halting: bool) {
    HALTING_ALL.store(halting, Ordering::Release);
}

fn halt_forever() -> ! {
    loop {
        #[cfg(not(test))]
        x86_64::instructions::hlt();
        #[cfg(test)]
        core::hint::spin_loop();
    }
}

/// The specialized handler installed at vector 2.
pub fn handler(_frame: &mut TrapFrame) -> Option<SigInfo> {
    if HALTING_ALL.load(Ordering::Acquire) {
        halt_forever();
    }
    if DEBUGGER_PAUSED.load(Ordering::Acquire) {
        while DEBUGGER_PAUSED.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        return None;
    }
    kernel_config::fatal!("unexpected NMI");
}
