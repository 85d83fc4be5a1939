//! POSIX-style signal delivery: signal-frame construction on the user
//! stack, and the kernel-exit-time check that decides whether a pending
//! signal needs one written (spec.md §6's signal-frame ABI).
//!
//! `theseus-os-Theseus` does not implement this — its own fault handlers
//! kill or unwind the faulting task (see `exceptions_full::kill_and_halt`)
//! — so this module is instead grounded on `doublegate-VeridianOS`'s
//! `process/signal_delivery.rs`: a C-compatible frame holding the
//! trampoline return address, signal number, saved mask, and the full
//! general-purpose register set, written below the thread's stack pointer
//! less the red zone, with the handler entered per the System V AMD64 ABI
//! (`rdi`=signum, `rsi`=siginfo pointer, `rdx`=ucontext pointer). See
//! DESIGN.md.

use alloc::sync::Arc;

use kernel_config::memory::SIGNAL_RED_ZONE;
use memory_structs::VirtualAddress;
use task::{SignalDisposition, Thread};

use crate::TrapFrame;

pub const SIGILL: u8 = 4;
pub const SIGTRAP: u8 = 5;
pub const SIGBUS: u8 = 7;
pub const SIGFPE: u8 = 8;
pub const SIGSEGV: u8 = 11;

/// `siginfo_t::si_code` for `SIGSEGV`: address not mapped to any object.
pub const SEGV_MAPERR: i32 = 1;
/// `siginfo_t::si_code` for `SIGSEGV`: invalid permissions for the mapped
/// object.
pub const SEGV_ACCERR: i32 = 2;
/// `siginfo_t::si_code` for `SIGILL`: illegal opcode.
pub const ILL_ILLOPC: i32 = 1;
/// `siginfo_t::si_code` for `SIGFPE`: integer divide by zero.
pub const FPE_INTDIV: i32 = 1;

const SIG_DFL: usize = 0;
const SIG_IGN: usize = 1;

/// A synthesized signal, carrying just enough of `siginfo_t` for the
/// handlers this core defines to fill in: the signal number, a
/// signal-specific code, and (for fault signals) the faulting address.
#[derive(Clone, Copy, Debug)]
pub struct SigInfo {
    pub signo: u8,
    pub code: i32,
    pub addr: u64,
}

/// Mirrors the POSIX `siginfo_t` fields this core populates, written to the
/// user stack so the handler's second argument can read them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct SigInfoFrame {
    signo: u64,
    code: i64,
    addr: u64,
}

/// Mirrors `ucontext_t`'s machine-dependent register snapshot (the
/// GLOSSARY's "arch-saved register frame"), written to the user stack as
/// the handler's third argument so a conforming handler (or `sigreturn`)
/// can restore the pre-trap state exactly.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct UContext {
    saved_mask: u64,
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rdi: u64,
    rsi: u64,
    rbp: u64,
    rbx: u64,
    rdx: u64,
    rcx: u64,
    rax: u64,
    rip: u64,
    rflags: u64,
    rsp: u64,
}

/// One pushed signal delivery: [return-address][SigInfoFrame][UContext],
/// matching spec.md §6's "user stack holds, in the order written by the
/// kernel, [return-address, siginfo, ucontext]".
#[repr(C)]
struct SignalFrame {
    restorer: u64,
    info: SigInfoFrame,
    ctx: UContext,
}

/// Writes `value` at `vaddr` in `space` via the direct physical map,
/// assuming the whole structure fits within the single page `vaddr`
/// translates through (guaranteed in practice by the 16-byte-aligned,
/// sub-page-sized frame this module ever writes).
fn write_user_value(space: &memory::AddressSpace, vaddr: VirtualAddress, value: &SignalFrame) -> bool {
    let Some(phys) = memory::find(space, vaddr) else { return false };
    let kernel_va = memory::phys_map(phys, core::mem::size_of::<SignalFrame>());
    // SAFETY: `kernel_va` is the direct-map alias of the byte at `vaddr` in
    // `space`, per the function's own assumption above.
    unsafe {
        core::ptr::write_unaligned(kernel_va.value() as *mut SignalFrame, *value);
    }
    true
}

/// Constructs a signal frame for `signum` on `thread`'s stack (alternate
/// stack if configured, else the current user stack less the red zone),
/// then rewrites `frame` so the trap's return enters the handler.
fn deliver_to_handler(thread: &Thread, frame: &mut TrapFrame, signum: u8, disposition: SignalDisposition, info: SigInfo) {
    let use_altstack = disposition.use_altstack;
    let sp = if use_altstack {
        thread.altstack().map(|(base, size)| base.value() + size)
    } else {
        None
    }
    .unwrap_or(frame.rsp as usize - SIGNAL_RED_ZONE);

    let frame_size = core::mem::size_of::<SignalFrame>();
    let new_sp = (sp - frame_size) & !0xF;

    let signal_frame = SignalFrame {
        restorer: disposition.restorer as u64,
        info: SigInfoFrame { signo: signum as u64, code: info.code as i64, addr: info.addr },
        ctx: UContext {
            saved_mask: thread.signal_mask(),
            r15: frame.r15,
            r14: frame.r14,
            r13: frame.r13,
            r12: frame.r12,
            r11: frame.r11,
            r10: frame.r10,
            r9: frame.r9,
            r8: frame.r8,
            rdi: frame.rdi,
            rsi: frame.rsi,
            rbp: frame.rbp,
            rbx: frame.rbx,
            rdx: frame.rdx,
            rcx: frame.rcx,
            rax: frame.rax,
            rip: frame.rip,
            rflags: frame.rflags,
            rsp: frame.rsp,
        },
    };

    let vaddr = VirtualAddress::new_canonical(new_sp);
    if !write_user_value(thread.owner().address_space(), vaddr, &signal_frame) {
        log::warn!("signal {} delivery failed: stack not mapped at {:#x}", signum, new_sp);
        return;
    }

    // Block this signal (and whatever the disposition's own mask adds, not
    // modeled here) for the duration of the handler, matching spec.md §9's
    // translation of the source's nesting guard.
    thread.set_signal_mask(thread.signal_mask() | (1u64 << signum));

    frame.rip = disposition.handler as u64;
    frame.rsp = new_sp as u64;
    frame.rdi = signum as u64;
    let info_offset = core::mem::size_of::<u64>();
    let ctx_offset = info_offset + core::mem::size_of::<SigInfoFrame>();
    frame.rsi = (new_sp + info_offset) as u64;
    frame.rdx = (new_sp + ctx_offset) as u64;
    thread.set_frame_modified(true);
}

/// Checked once per user-mode trap right before the kernel-exit hook runs:
/// if any unmasked signal is pending, looks up its disposition and either
/// delivers it to a registered handler, drops it (`SIG_IGN`), or kills the
/// thread (`SIG_DFL`) — spec.md §4.4's "Signal-handler frame setup".
pub fn deliver_pending_signals(thread: &Arc<Thread>, frame: &mut TrapFrame) {
    let ready = thread.pending_signals() & !thread.signal_mask();
    if ready == 0 {
        return;
    }
    let signum = ready.trailing_zeros() as u8;
    thread.clear_signal(signum);

    let disposition = thread.owner().signal_handler(signum);
    match disposition.handler {
        SIG_DFL => {
            log::warn!("thread {:?} terminated by unhandled signal {}", thread.id(), signum);
            task::thread_kill(thread);
        }
        SIG_IGN => {}
        _ => deliver_to_handler(thread, frame, signum, disposition, SigInfo { signo: signum, code: 0, addr: 0 }),
    }
}

/// Restores the pre-trap register set from the `ucontext` a handler's
/// `sigreturn` points at. `ucontext_addr` is the user-space address the
/// syscall wrapper (out of scope for this core) passes through from the
/// handler's argument, per spec.md §6: "`sigreturn` expects the
/// return-address to be popped (so it reads the frame at stack pointer −
/// sizeof(return-address))".
pub fn sigreturn(thread: &Thread, frame: &mut TrapFrame, ucontext_addr: usize) -> bool {
    let space = thread.owner().address_space();
    let vaddr = VirtualAddress::new_canonical(ucontext_addr);
    let Some(phys) = memory::find(space, vaddr) else { return false };
    let kernel_va = memory::phys_map(phys, core::mem::size_of::<UContext>());

    // SAFETY: `kernel_va` is the direct-map alias of `ucontext_addr`; the
    // handler's trampoline is trusted to pass back exactly the pointer this
    // core handed it.
    let ctx = unsafe { core::ptr::read_unaligned(kernel_va.value() as *const UContext) };

    thread.set_signal_mask(ctx.saved_mask);
    frame.r15 = ctx.r15;
    frame.r14 = ctx.r14;
    frame.r13 = ctx.r13;
    frame.r12 = ctx.r12;
    frame.r11 = ctx.r11;
    frame.r10 = ctx.r10;
    frame.r9 = ctx.r9;
    frame.r8 = ctx.r8;
    frame.rdi = ctx.rdi;
    frame.rsi = ctx.rsi;
    frame.rbp = ctx.rbp;
    frame.rbx = ctx.rbx;
    frame.rdx = ctx.rdx;
    frame.rcx = ctx.rcx;
    frame.rax = ctx.rax;
    frame.rip = ctx.rip;
    frame.rflags = ctx.rflags;
    frame.rsp = ctx.rsp;
    thread.set_frame_modified(false);
    true
}
