//! Trap Dispatcher sizing and signal-delivery configuration (spec.md §4.4,
//! §6).

/// The first vector the Trap Dispatcher treats as an external/IPI interrupt
/// rather than a CPU exception. Exceptions occupy vectors `0..IRQ_BASE`;
/// [`crate::interrupts::VECTOR_COUNT`] - `IRQ_BASE` vectors remain for
/// device IRQs, the IPI vector, and the scheduler's timer tick.
pub const IRQ_BASE: u16 = 32;

/// Total number of entries the vector table covers, matching the x86_64
/// IDT's fixed 256-entry size.
pub const VECTOR_COUNT: usize = 256;

/// Number of consecutive user-mode FPU uses after which a thread is marked
/// "frequent" and the lazy `#NM` trap stops being taken for it (spec.md
/// §4.4's lazy-FPU note). Chosen to match the "after a handful of uses"
/// guidance; not load-bearing for correctness, only for trap-rate.
pub const FPU_FREQUENT_THRESHOLD: u32 = 8;

/// Highest signal number this core recognizes, one past the real POSIX
/// range of 1..=31 so a `[u64; 1]` bitmask (as already used by
/// `task::Thread::signal_mask`/`pending_signals`) can address every valid
/// signal with `1u64 << signum`.
pub const NSIG: usize = 32;
