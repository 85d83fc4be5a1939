//! Sleep-timeout accounting. There is no real one-shot hardware timer to
//! arm per call in this core (the actual Local APIC timer/IRQ plumbing is
//! the boot/console layer's concern, out of scope per spec.md §1); instead
//! every CPU's periodic preemption tick also drains this list, which is a
//! documented simplification of "arm a dedicated one-shot timer per
//! sleeping thread" (see DESIGN.md).

use alloc::sync::Arc;
use alloc::vec::Vec;

use kernel_config::irq_lock::IrqSafeMutex;
use task::{Thread, ThreadId};

// `on_tick` runs from `crate::on_timer_fired`, an interrupt handler, while
// `arm`/`disarm_and_check_fired` run from ordinary task context (inside
// `crate::sleep`) — the same task-context/interrupt-context split that
// makes `percpu::PerCpu::state` need an IRQ-safe lock applies here too.
static DEADLINES: IrqSafeMutex<Vec<(Arc<Thread>, u64)>> = IrqSafeMutex::new(Vec::new());
static TIMED_OUT: IrqSafeMutex<Vec<ThreadId>> = IrqSafeMutex::new(Vec::new());

pub(crate) fn arm(thread: Arc<Thread>, ms: u64) {
    DEADLINES.lock().push((thread, ms));
}

/// Called once a sleeper resumes, regardless of why: clears any deadline
/// still pending for it (it was woken some other way) and reports whether
/// *this* resume was the timeout firing.
pub(crate) fn disarm_and_check_fired(thread: &Arc<Thread>) -> bool {
    let mut timed_out = TIMED_OUT.lock();
    if let Some(pos) = timed_out.iter().position(|id| *id == thread.id()) {
        timed_out.remove(pos);
        return true;
    }
    drop(timed_out);
    DEADLINES.lock().retain(|(t, _)| !Arc::ptr_eq(t, thread));
    false
}

/// Advances every pending deadline by `elapsed_ms`, waking (and marking
/// fired) whichever ones just expired. Called from the same periodic tick
/// that accounts the running thread's timeslice.
pub(crate) fn on_tick(elapsed_ms: u64) {
    let mut expired = Vec::new();
    {
        let mut deadlines = DEADLINES.lock();
        deadlines.retain_mut(|(thread, remaining)| {
            if *remaining <= elapsed_ms {
                expired.push(thread.clone());
                false
            } else {
                *remaining -= elapsed_ms;
                true
            }
        });
    }
    for thread in expired {
        TIMED_OUT.lock().push(thread.id());
        crate::wake(&thread);
    }
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    DEADLINES.lock().clear();
    TIMED_OUT.lock().clear();
}
