//! The Trap Dispatcher (spec.md §4.4): receives every CPU-originated kernel
//! entry — exception, fault, or external interrupt — classifies it,
//! routes it to a registered handler, and, for a synchronous fault that
//! reaches a user-mode thread unresolved, delivers it as a POSIX-style
//! signal instead of killing or unwinding the thread.
//!
//! Grounded on `theseus-os-Theseus`'s `exceptions_full`/`interrupts` crates
//! for the vector-table shape and the specific set of specialized handlers
//! (divide-by-zero, debug, NMI, invalid opcode, device-not-available,
//! double fault, page fault, x87/SIMD FPU error); the teacher kills or
//! unwinds the faulting task instead of signaling it, which the signal-
//! frame ABI this core's external interfaces require does not fit, so the
//! signal-delivery half of this crate ([`signal`], part of [`fault`]) is
//! instead grounded on `doublegate-VeridianOS`'s `process/signal_delivery.rs`
//! and `syscall/signal.rs` (see DESIGN.md).
//!
//! This crate does not reproduce the teacher's real hardware IDT wiring
//! (one `extern "x86-interrupt" fn` stub per vector copying architectural
//! register state into a frame) since that is boot/arch glue outside the
//! Trap Dispatcher contract, which names [`on_trap`] taking an
//! already-saved frame as its hardware entry point (spec.md §4.4's
//! Contract line). The same boundary choice already used throughout this
//! core for hardware detail: see `memory`/`scheduler`'s `#[cfg(not(test))]`
//! splits.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod fault;
pub mod fpu;
pub mod nmi;
pub mod signal;
#[cfg(test)]
mod test;

use alloc::sync::Arc;

use kernel_config::interrupts::{IRQ_BASE, VECTOR_COUNT};
use kernel_config::irq_lock::IrqSafeMutex;
use kernel_config::{KResult, KernelError};
use spin::Once;
use task::Thread;

/// A saved register frame for one trap, in the layout the low-level
/// architecture entry stub is responsible for building before calling
/// [`on_trap`] and restoring afterwards. Field order follows System V
/// AMD64 callee/caller-saved convention for the general-purpose registers,
/// then the hardware-pushed `error_code` (0 for vectors with none) and
/// the CPU's own interrupt-return frame.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,

    /// The vector number this trap was taken on; filled in by the arch
    /// entry stub, not the CPU.
    pub vector: u64,
    /// The hardware-pushed error code, or 0 for vectors that don't push one.
    pub error_code: u64,

    /// -- CPU-pushed interrupt-return frame --
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// True if this trap was taken while executing in user mode, per the
    /// x86 convention of the low two bits of `cs` encoding the privilege
    /// level (spec.md §4.4 step 1: "code-segment low bits ≠ 0").
    pub fn from_user_mode(&self) -> bool {
        self.cs & 0x3 != 0
    }

    /// The address a faulted or trapped instruction stream would resume at.
    pub fn instruction_pointer(&self) -> u64 {
        self.rip
    }
}

/// A handler registered for one vector. Exception handlers (0..[`IRQ_BASE`])
/// may synthesize a signal for the current thread by returning one; IRQ
/// handlers always return `None`.
pub type Handler = fn(&mut TrapFrame) -> Option<signal::SigInfo>;

struct Table {
    handlers: [Option<Handler>; VECTOR_COUNT],
}

// IRQ-safe: `on_trap` reads this table as the hardware entry point itself
// (already interrupt context by definition), while `register`/`remove`
// are called from ordinary task context — a plain spinlock would
// self-deadlock if a trap landed on this CPU mid-`register`.
static TABLE: Once<IrqSafeMutex<Table>> = Once::new();

fn table() -> &'static IrqSafeMutex<Table> {
    TABLE.get().unwrap_or_else(|| kernel_config::fatal!("interrupts::init was never called"))
}

fn default_exception_handler(frame: &mut TrapFrame) -> Option<signal::SigInfo> {
    fault::signal_or_panic(frame, signal::SIGILL, 0, 0)
}

fn irq_shim(_frame: &mut TrapFrame) -> Option<signal::SigInfo> {
    None
}

fn unknown_interrupt_handler(frame: &mut TrapFrame) -> Option<signal::SigInfo> {
    log::warn!("unhandled interrupt on vector {}", frame.vector);
    None
}

/// Populates the vector table: CPU exceptions (0..[`IRQ_BASE`]) default to
/// the generic synchronous-exception handler, vectors
/// `[IRQ_BASE, IRQ_BASE+16)` default to the IRQ shim, and the remainder
/// default to the unknown-interrupt handler, per spec.md §4.4's Table
/// paragraph. Specific vectors are then replaced with the specialized
/// handlers the spec names, and [`ipi::IPI_VECTOR`] is wired to
/// [`ipi::process_pending`].
pub fn init() -> KResult<()> {
    let mut handlers = [None; VECTOR_COUNT];

    for v in 0..IRQ_BASE as usize {
        handlers[v] = Some(default_exception_handler as Handler);
    }
    for v in IRQ_BASE as usize..(IRQ_BASE as usize + 16).min(VECTOR_COUNT) {
        handlers[v] = Some(irq_shim as Handler);
    }
    for v in (IRQ_BASE as usize + 16).min(VECTOR_COUNT)..VECTOR_COUNT {
        handlers[v] = Some(unknown_interrupt_handler as Handler);
    }

    handlers[0] = Some(divide_by_zero_handler as Handler);
    handlers[1] = Some(debug_handler as Handler);
    handlers[2] = Some(nmi::handler as Handler);
    handlers[6] = Some(invalid_opcode_handler as Handler);
    handlers[7] = Some(fpu::device_not_available_handler as Handler);
    handlers[8] = Some(double_fault_handler as Handler);
    handlers[14] = Some(fault::page_fault_handler as Handler);
    handlers[16] = Some(x87_fpu_error_handler as Handler);
    handlers[19] = Some(simd_fpu_error_handler as Handler);

    TABLE.call_once(|| IrqSafeMutex::new(Table { handlers }));
    table().lock().handlers[ipi::IPI_VECTOR as usize] = Some(ipi_handler as Handler);
    Ok(())
}

fn ipi_handler(_frame: &mut TrapFrame) -> Option<signal::SigInfo> {
    ipi::process_pending();
    None
}

/// Registers a handler for `vector`. Restricted to `vector >= IRQ_BASE`
/// (spec.md §6's external interface: "TD `register/remove` for vectors ≥
/// IRQ_BASE"); the fixed CPU-exception vectors are owned by this crate.
pub fn register(vector: u8, handler: Handler) -> KResult<()> {
    if (vector as u16) < IRQ_BASE {
        return Err(KernelError::InvalidArgument);
    }
    table().lock().handlers[vector as usize] = Some(handler);
    Ok(())
}

/// Restores `vector`'s slot to the unknown-interrupt default.
pub fn remove(vector: u8) -> KResult<()> {
    if (vector as u16) < IRQ_BASE {
        return Err(KernelError::InvalidArgument);
    }
    table().lock().handlers[vector as usize] = Some(unknown_interrupt_handler as Handler);
    Ok(())
}

fn dispatch(frame: &mut TrapFrame) -> Option<signal::SigInfo> {
    let handler = table().lock().handlers[frame.vector as usize];
    match handler {
        Some(h) => h(frame),
        None => kernel_config::fatal!("no handler installed for vector {} (unknown kernel-mode exception)", frame.vector),
    }
}

/// The hardware entry point: called by the architecture-specific trap stub
/// with `frame` already filled in. Implements spec.md §4.4's four-step
/// dispatch algorithm.
pub fn on_trap(frame: &mut TrapFrame) {
    let from_user = frame.from_user_mode();
    let thread: Option<Arc<Thread>> = if from_user {
        let t = scheduler::current_thread();
        task::thread_at_kernel_entry(&t, frame as *mut TrapFrame as usize);
        Some(t)
    } else {
        None
    };

    let synthesized = dispatch(frame);

    match thread {
        Some(t) => {
            if let Some(info) = synthesized {
                t.raise_signal(info.signo);
            }
            signal::deliver_pending_signals(&t, frame);
            task::thread_at_kernel_exit(&t);
        }
        None => {
            if preemption::take_and_clear_missed() {
                scheduler::preempt_now();
            }
        }
    }
}

fn divide_by_zero_handler(frame: &mut TrapFrame) -> Option<signal::SigInfo> {
    fault::signal_or_panic(frame, signal::SIGFPE, signal::FPE_INTDIV, 0)
}

fn debug_handler(frame: &mut TrapFrame) -> Option<signal::SigInfo> {
    fault::signal_or_panic(frame, signal::SIGTRAP, 0, 0)
}

fn invalid_opcode_handler(frame: &mut TrapFrame) -> Option<signal::SigInfo> {
    fault::signal_or_panic(frame, signal::SIGILL, signal::ILL_ILLOPC, 0)
}

fn x87_fpu_error_handler(frame: &mut TrapFrame) -> Option<signal::SigInfo> {
    fault::signal_or_panic(frame, signal::SIGFPE, 0, 0)
}

fn simd_fpu_error_handler(frame: &mut TrapFrame) -> Option<signal::SigInfo> {
    fault::signal_or_panic(frame, signal::SIGFPE, 0, 0)
}

/// Double fault never attempts recovery (spec.md §4.4: "panic; do not
/// attempt recovery").
fn double_fault_handler(_frame: &mut TrapFrame) -> Option<signal::SigInfo> {
    kernel_config::fatal!("double fault");
}
