//! Cross-CPU TLB invalidation (spec.md §5's ordering guarantees): once an
//! [`memory::AddressSpace`] mapping changes, every CPU whose last `switch`
//! targeted that space must invalidate its own stale translation before
//! the change is considered published.
//!
//! [`memory::insert`]/[`memory::remove`] already invalidate the *local*
//! translation on the calling CPU. This crate supplies the remaining
//! "every other CPU" half via a synchronous IPI broadcast, so a caller that
//! knows a mapping might be visible elsewhere (a shared kernel range, or a
//! multi-threaded process's address space) can finish the job with one
//! call after its own `insert`/`remove`.

#![no_std]

#[cfg(test)]
extern crate std;

use ipi::IpiHandler;
use memory::AddressSpace;
use memory_structs::VirtualAddress;

/// The IPI handler registered for [`IPI_VECTOR`]: flushes the single
/// virtual address packed into `a1`, given the calling CPU already holds
/// the space that maps it.
fn shootdown_handler(virt: u64, _a2: u64, _a3: u64, _a4: u64) -> i64 {
    local_flush(VirtualAddress::new_canonical(virt as usize));
    0
}

#[cfg(not(test))]
fn local_flush(virt: VirtualAddress) {
    use x86_64::VirtAddr;
    // SAFETY: flushing a TLB entry is always sound; at worst it's an
    // unnecessary flush of an address this CPU never cached.
    x86_64::instructions::tlb::flush(VirtAddr::new(virt.value() as u64));
}

#[cfg(test)]
fn local_flush(_virt: VirtualAddress) {}

const SHOOTDOWN_HANDLER: IpiHandler = shootdown_handler;

/// Registers this crate's handler with the IPI Core. Must run once during
/// boot, after `ipi::init`.
pub fn init() {
    // `ipi` dispatches by raw function pointer value, carried in the
    // message record itself (spec.md §4.6), so there is nothing to
    // register up front beyond making sure the vector this crate's
    // handler answers to is reserved; the Trap Dispatcher is the one that
    // actually wires `ipi::IPI_VECTOR` to `ipi::process_pending`.
}

/// Invalidates `virt` on every CPU in `space.active_cpus()` other than the
/// caller, which is assumed to have already invalidated its own
/// translation (e.g. via [`memory::insert`]/[`memory::remove`]).
///
/// Synchronous: returns only once every targeted CPU has actually flushed,
/// per the ordering guarantee that a mapping change is not "published"
/// until this has happened.
pub fn shootdown(space: &AddressSpace, virt: VirtualAddress) {
    let self_ordinal = cpu::current_cpu().ordinal();
    let mask = space.active_cpus();
    for ordinal in 0..64usize {
        if mask & (1 << ordinal) == 0 {
            continue;
        }
        if Some(ordinal) == self_ordinal {
            continue;
        }
        if let Some(target) = cpu::cpu_at(ordinal) {
            let _ = ipi::send(target, SHOOTDOWN_HANDLER, virt.value() as u64, 0, 0, 0, true);
        }
    }
}

/// Shoots down a contiguous run of `num_pages` pages starting at `virt`.
pub fn shootdown_range(space: &AddressSpace, virt: VirtualAddress, num_pages: usize) {
    let page_size = kernel_config::memory::PAGE_SIZE;
    for i in 0..num_pages {
        shootdown(space, virt + i * page_size);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shootdown_with_no_other_active_cpus_does_nothing() {
        let descriptors = [apic::CpuDescriptor { apic_id: 0, is_bootstrap: true }];
        let _ = apic::init(&descriptors);
        apic::set_test_current_cpu(0);
        let _ = ipi::init();
        let space = memory::init(false).expect("kernel space init");
        memory::switch(&space, 0);
        // Only CPU 0 (the caller) is active, so nothing should be sent.
        shootdown(&space, VirtualAddress::new_canonical(0x1000));
    }
}
