//! Page-fault decoding and resolution, plus the generic
//! signal-or-panic path shared by every other synchronous exception
//! handler (spec.md §4.4: "Other user-mode synchronous exceptions ...:
//! synthesize the appropriate signal and send").
//!
//! The page-fault handler's fall-through order deliberately preserves the
//! documented source bug (spec.md §9): a user-mode access to a kernel
//! address is never handed to the resolver (only user-half addresses are),
//! so it always falls through as an unresolved fault and unconditionally
//! signals `SIGSEGV` rather than being classified as a distinct "bad
//! address" case. See DESIGN.md's Open Questions.

use kernel_config::memory::USER_SPACE_LIMIT;
use memory::AddressSpace;
use memory_structs::VirtualAddress;
use spin::Once;

use crate::signal::{self, SigInfo};
use crate::TrapFrame;

/// What a [`FaultResolver`] determined about a page fault at a given
/// address: whether the backing VM-region layer (out of scope for this
/// core, per spec.md §1's Non-goals) was able to install a mapping and let
/// the faulting instruction retry, whether no region covers the address at
/// all, or whether a region exists but the access violated its protection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved,
    NoRegion,
    AccessViolation,
}

/// Implemented by the out-of-scope VM-region layer so the Trap Dispatcher
/// can ask "does some mapped object back this address, and may this access
/// proceed" without depending on it directly — the same trait-object
/// injection point `apic::InterruptRaiser`/`task::Dispatcher` use to break
/// a layering cycle.
pub trait FaultResolver: Sync {
    fn resolve(&self, space: &AddressSpace, addr: VirtualAddress, write: bool, execute: bool) -> FaultOutcome;
}

static RESOLVER: Once<&'static dyn FaultResolver> = Once::new();

pub fn register_fault_resolver(resolver: &'static dyn FaultResolver) {
    RESOLVER.call_once(|| resolver);
}

#[cfg(not(test))]
fn faulting_address() -> VirtualAddress {
    let addr = x86_64::registers::control::Cr2::read();
    VirtualAddress::new_canonical(addr.as_u64() as usize)
}
#[cfg(test)]
fn faulting_address() -> VirtualAddress {
    VirtualAddress::new_canonical(test::TEST_CR2.load(core::sync::atomic::Ordering::Relaxed))
}

struct DecodedFault {
    not_present: bool,
    write: bool,
    user: bool,
    execute: bool,
}

fn decode(error_code: u64) -> DecodedFault {
    use x86_64::structures::idt::PageFaultErrorCode as E;
    let bits = E::from_bits_truncate(error_code);
    DecodedFault {
        not_present: !bits.contains(E::PROTECTION_VIOLATION),
        write: bits.contains(E::CAUSED_BY_WRITE),
        user: bits.contains(E::USER_MODE),
        execute: bits.contains(E::INSTRUCTION_FETCH),
    }
}

/// The specialized page-fault handler installed at vector 14.
pub fn page_fault_handler(frame: &mut TrapFrame) -> Option<SigInfo> {
    let addr = faulting_address();
    let decoded = decode(frame.error_code);

    let current = scheduler::current_thread();

    if addr.value() < USER_SPACE_LIMIT {
        if let Some(resolver) = RESOLVER.get() {
            let outcome = resolver.resolve(current.owner().address_space(), addr, decoded.write, decoded.execute);
            if outcome == FaultOutcome::Resolved {
                return None;
            }
        }
    }

    if let Some(ctx) = current.safe_access_context() {
        current.set_safe_access_context(None);
        frame.rip = ctx.resume_rip;
        frame.rsp = ctx.resume_rsp;
        frame.rbp = ctx.resume_rbp;
        return None;
    }

    let code = if decoded.not_present { signal::SEGV_MAPERR } else { signal::SEGV_ACCERR };
    signal_or_panic(frame, signal::SIGSEGV, code, addr.value() as u64)
}

/// Shared by every "other synchronous exception" handler: if the trap came
/// from user mode, synthesizes `signo` (with `code`/`addr` as its siginfo
/// payload) for the current thread; from kernel mode, panics (spec.md §7:
/// "Unhandled kernel-mode exceptions → panic").
pub fn signal_or_panic(frame: &mut TrapFrame, signo: u8, code: i32, addr: u64) -> Option<SigInfo> {
    if frame.from_user_mode() {
        Some(SigInfo { signo, code, addr })
    } else {
        kernel_config::fatal!("unhandled kernel-mode exception (vector {}, signal {})", frame.vector, signo);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use core::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) static TEST_CR2: AtomicUsize = AtomicUsize::new(0);

    pub fn set_test_cr2(addr: usize) {
        TEST_CR2.store(addr, Ordering::Relaxed);
    }
}
