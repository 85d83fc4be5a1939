//! Lazy FPU state management: the device-not-available (`#NM`) handler
//! installed at vector 7 (spec.md §4.4: "if from user mode, enable the FPU
//! for the current thread. Allocate/restore per-thread FPU state the first
//! time, then count uses and flip a 'frequent FPU' flag after a small
//! threshold so that future context switches eagerly save/restore FPU
//! state").
//!
//! The actual save/restore instructions (`fxsave`/`xsave` and friends) are
//! a hardware detail this core leaves to the same kind of trait-object
//! injection point `apic::InterruptRaiser` uses for the LAPIC, since a
//! from-scratch FPU state area allocator is out of this crate's scope.

use spin::Once;

use crate::signal::SigInfo;
use crate::TrapFrame;

/// Implemented by the arch layer to actually clear the task-switched flag,
/// allocate a save area, and save/restore the FPU register file across a
/// context switch once a thread is marked frequent.
pub trait FpuOps: Sync {
    /// Clears CR0.TS so FPU instructions stop trapping for the current CPU.
    fn enable(&self);
    /// Allocates (or returns an existing) per-thread FPU save area and
    /// restores it into the hardware registers.
    fn restore(&self, thread_id: u64);
}

static FPU_OPS: Once<&'static dyn FpuOps> = Once::new();

pub fn register_fpu_ops(ops: &'static dyn FpuOps) {
    FPU_OPS.call_once(|| ops);
}

/// The specialized handler installed at vector 7. Never synthesizes a
/// signal: from kernel mode, an `#NM` trap is an invariant violation (the
/// kernel never touches the FPU without having enabled it first).
pub fn device_not_available_handler(frame: &mut TrapFrame) -> Option<SigInfo> {
    if !frame.from_user_mode() {
        kernel_config::fatal!("device-not-available trap from kernel mode");
    }

    let thread = scheduler::current_thread();
    if let Some(ops) = FPU_OPS.get() {
        ops.enable();
        if !thread.fpu_allocated() {
            thread.set_fpu_allocated(true);
        }
        ops.restore(thread.id().value() as u64);
    }

    let frequent = thread.note_fpu_use();
    if frequent {
        log::trace!("thread {:?} marked frequent-FPU", thread.id());
    }
    None
}
