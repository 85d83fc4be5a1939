//! The low-level context-switch routine (spec.md §4.5, "Context switch"
//! step 6): saves the outgoing thread's callee-saved registers and flags
//! onto its own kernel stack, swaps `rsp`, and restores the incoming
//! thread's.
//!
//! The push/pop order here is the exact inverse pairing `task::
//! prepare_initial_stack`'s comment documents for a brand new thread's
//! fabricated frame: whichever of the two a thread was last suspended by
//! (a real switch, or its initial fabricated stack) is indistinguishable
//! to this routine.

/// # Safety
/// `prev_sp` must point at a valid, exclusively-owned `u64` cell (the
/// outgoing thread's `saved_sp` storage) and `next_sp` must be a stack
/// pointer previously produced either by this function or by
/// `task::prepare_initial_stack`, pointing into a live, exclusively-owned
/// kernel stack.
#[cfg(not(test))]
#[naked]
pub(crate) unsafe extern "C" fn switch_stacks(prev_sp: *mut u64, next_sp: u64) {
    core::arch::asm!(
        "pushfq",
        "push rax",
        "push rcx",
        "push rdx",
        "push rbx",
        "sub rsp, 8", // alignment padding, matches the skipped slot on restore
        "push rbp",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp", // *prev_sp = outgoing rsp (rdi holds the first arg)
        "mov rsp, rsi",   // switch onto the incoming stack (rsi holds the second arg)
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "add rsp, 8", // skip the padding slot
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "popfq",
        "ret",
        options(noreturn)
    )
}

/// Hosted unit tests never actually have two live kernel stacks to swap
/// between; this stub just records that a switch "happened" so dispatch
/// logic above it can still be exercised.
#[cfg(test)]
pub(crate) unsafe fn switch_stacks(prev_sp: *mut u64, next_sp: u64) {
    core::ptr::write(prev_sp, next_sp.wrapping_add(1));
}
