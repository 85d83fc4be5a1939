//! The Address-Space Mapper (ASM): installs and removes virtual-to-physical
//! mappings in a 4-level page-table tree, one tree per address space, with
//! per-space locking and a shared kernel half aliased into every user space.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod table;
#[cfg(test)]
mod test;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::{Mutex, Once};

use frame_allocator::AllocFlags;
use kernel_config::memory::{LOW_MEMORY_LIMIT, PHYSMAP_OFFSET};
use kernel_config::{fatal, KResult, KernelError};
use memory_structs::{Frame, PhysicalAddress, VirtualAddress};
pub use page_table_entry::{EntryFlags, PageTableEntry, ProtectionFlags};

use table::{table_indices, Table, ENTRIES_PER_TABLE};

/// P4 entries at or above this index make up the shared higher-half kernel
/// subtree that every user address space aliases; below it is private to
/// each space. Splits the 512-entry top level exactly in half.
const KERNEL_SPACE_P4_INDEX_START: usize = 256;

static KERNEL_ROOT: Once<Frame> = Once::new();
static NX_SUPPORTED: AtomicBool = AtomicBool::new(false);
static GLOBAL_PAGES_SUPPORTED: AtomicBool = AtomicBool::new(false);

/// One page-table tree and the bookkeeping the mapper needs to mutate it
/// safely: a per-space lock (spec.md §5's "per-address-space mutex") and a
/// bitmap of which CPUs last `switch`ed to this space, consulted by the
/// cross-CPU TLB-shootdown layer to know who needs an invalidation IPI.
///
/// The bitmap tracks at most 64 CPUs; a system with more would need a
/// wider mask, which this core does not implement (see DESIGN.md).
pub struct AddressSpace {
    root: Frame,
    is_user: bool,
    lock: Mutex<()>,
    active_cpus: AtomicU64,
}

impl AddressSpace {
    pub fn is_user(&self) -> bool {
        self.is_user
    }

    pub fn root_frame(&self) -> Frame {
        self.root
    }

    /// CPUs that have this space installed right now, i.e. whose last
    /// `switch` targeted it and who haven't since switched away.
    pub fn active_cpus(&self) -> u64 {
        self.active_cpus.load(Ordering::Acquire)
    }
}

fn detect_cpu_paging_features() {
    use x86_64::registers::control::{Cr4, Cr4Flags};
    use x86_64::registers::model_specific::{Efer, EferFlags};
    NX_SUPPORTED.store(Efer::read().contains(EferFlags::NO_EXECUTE_ENABLE), Ordering::Relaxed);
    GLOBAL_PAGES_SUPPORTED.store(Cr4::read().contains(Cr4Flags::PAGE_GLOBAL), Ordering::Relaxed);
}

/// Allocates a fresh, zeroed frame to back a new page-table level,
/// deliberately leaking it out of the frame allocator's RAII handle: the
/// page-table tree now owns this frame until a `destroy` walk frees it
/// explicitly.
///
/// `wait` carries the caller's `MM_WAIT`/`MM_BOOT`/`MM_ATOMIC` policy down
/// into the PFA call, per spec.md §4.2's Failures: "out of memory if an
/// intermediate table cannot be allocated (only when `flags` is
/// non-waiting); otherwise blocks until a page is free."
fn alloc_table_frame(wait: AllocFlags) -> Option<Frame> {
    frame_allocator::alloc_single(AllocFlags::PM_ZERO | wait).ok().map(|f| *f.into_range().start())
}

/// Creates an address space. `user == false` returns a handle to the one
/// true kernel page table: the first call establishes it and every later
/// `false` call just hands back a fresh handle to the same underlying
/// root, so that whichever call happened to run first is never privileged
/// over the others. `user == true` always allocates a brand new private
/// space and aliases the kernel's higher half into it.
pub fn init(user: bool) -> KResult<AddressSpace> {
    let root = if user {
        let max = Frame::containing_address(PhysicalAddress::new_canonical(LOW_MEMORY_LIMIT));
        *frame_allocator::alloc(1, 1, None, Some(max), AllocFlags::PM_ZERO)?.into_range().start()
    } else {
        match KERNEL_ROOT.get() {
            Some(&frame) => frame,
            None => {
                detect_cpu_paging_features();
                let frame = *frame_allocator::alloc_single(AllocFlags::PM_ZERO)?.into_range().start();
                *KERNEL_ROOT.call_once(|| frame)
            }
        }
    };

    if user {
        let kernel_root = *KERNEL_ROOT.get().ok_or(KernelError::InvalidArgument)?;
        // SAFETY: both frames are live page-table roots this call just
        // allocated or that `init(false)` already established.
        unsafe {
            let new_table = Table::at(root);
            let kernel_table = Table::at(kernel_root);
            for i in KERNEL_SPACE_P4_INDEX_START..ENTRIES_PER_TABLE {
                new_table.store(i, kernel_table.load(i));
            }
        }
    }

    Ok(AddressSpace {
        root,
        is_user: user,
        lock: Mutex::new(()),
        active_cpus: AtomicU64::new(0),
    })
}

/// Installs a mapping. Fatal if `virt` is already mapped in `space`:
/// callers must `remove` first.
pub fn insert(
    space: &AddressSpace,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    prot: ProtectionFlags,
    alloc_flags: AllocFlags,
) -> KResult<()> {
    let _guard = space.lock.lock();
    let wait = alloc_flags & (AllocFlags::MM_WAIT | AllocFlags::MM_BOOT | AllocFlags::MM_ATOMIC);
    let mut maker = || alloc_table_frame(wait);
    // SAFETY: `space.root` is a live P4 table for the lifetime of `space`.
    let walked = unsafe { table::walk(space.root, virt, Some(&mut maker), space.is_user) }
        .ok_or(KernelError::OutOfMemory)?;

    let existing = walked.table.load(walked.index);
    if existing.flags().is_present() {
        fatal!("insert into an already-present mapping at {:?}", virt);
    }

    let flags = EntryFlags::from_protection(prot, space.is_user, NX_SUPPORTED.load(Ordering::Relaxed))
        .with_global_if_supported(!space.is_user && GLOBAL_PAGES_SUPPORTED.load(Ordering::Relaxed));
    let frame = Frame::containing_address(phys);
    walked.table.store(walked.index, PageTableEntry::new(frame, flags));

    core::sync::atomic::fence(Ordering::SeqCst);
    local_invalidate_page(virt);
    Ok(())
}

/// Removes whatever mapping exists at `virt`, returning its physical
/// address. Returns `None` if nothing was mapped there.
pub fn remove(space: &AddressSpace, virt: VirtualAddress) -> Option<PhysicalAddress> {
    let _guard = space.lock.lock();
    // SAFETY: `space.root` is a live P4 table for the lifetime of `space`.
    let walked = unsafe { table::walk(space.root, virt, None, space.is_user) }?;
    let entry = walked.table.load(walked.index);
    if !entry.flags().is_present() {
        return None;
    }
    let frame = entry.pointed_frame()?;
    walked.table.store(walked.index, PageTableEntry::unused());
    local_invalidate_page(virt);
    Some(frame.start_address())
}

/// Read-only lookup. Never allocates, never takes the per-space lock: it
/// only performs atomic loads down the tree, per the concurrency model.
pub fn find(space: &AddressSpace, virt: VirtualAddress) -> Option<PhysicalAddress> {
    // SAFETY: `space.root` is a live P4 table for the lifetime of `space`.
    let walked = unsafe { table::walk(space.root, virt, None, space.is_user) }?;
    let entry = walked.table.load(walked.index);
    if !entry.flags().is_present() {
        return None;
    }
    let frame = entry.pointed_frame()?;
    Some(PhysicalAddress::new_canonical(frame.start_address().value() + virt.page_offset()))
}

/// Splits the huge page mapping a 2 MiB region at `virt` into 512 regular
/// 4 KiB entries with the same protection, so that a subsequent `insert`
/// into part of that region only replaces the one entry it targets.
///
/// Only 2 MiB (P2-level) huge pages are supported; a 1 GiB (P3-level) huge
/// page is left as a documented limitation (see DESIGN.md).
pub fn page_large_to_ptbl(space: &AddressSpace, virt: VirtualAddress) -> KResult<()> {
    let _guard = space.lock.lock();
    let indices = table_indices(virt);
    // SAFETY: `space.root` is a live P4 table for the lifetime of `space`.
    let mut table = unsafe { Table::at(space.root) };
    for &index in &indices[..2] {
        let entry = table.load(index);
        if !entry.flags().is_present() || entry.flags().is_huge() {
            return Err(KernelError::InvalidArgument);
        }
        let frame = entry.pointed_frame().ok_or(KernelError::InvalidArgument)?;
        // SAFETY: the entry was present and non-huge, so it points at a
        // live intermediate table.
        table = unsafe { Table::at(frame) };
    }

    let p2_index = indices[2];
    let huge_entry = table.load(p2_index);
    if !huge_entry.flags().is_huge() {
        return Ok(());
    }
    let base_frame = huge_entry.pointed_frame().ok_or(KernelError::InvalidArgument)?;
    let new_table_frame = alloc_table_frame(AllocFlags::empty()).ok_or(KernelError::OutOfMemory)?;
    // SAFETY: `new_table_frame` was just allocated and zeroed.
    let new_table = unsafe { Table::at(new_table_frame) };
    let regular_flags = huge_entry.flags() & !EntryFlags::HUGE_PAGE;
    for i in 0..ENTRIES_PER_TABLE {
        new_table.store(i, PageTableEntry::new(base_frame + i, regular_flags));
    }
    // The new P2 entry is itself an intermediate entry; it must carry
    // USER_ACCESSIBLE whenever the split leaf entries do; the AND-across-
    // levels privilege rule in `table::walk`'s doc comment applies here too.
    let mut intermediate_flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
    if regular_flags.contains(EntryFlags::USER_ACCESSIBLE) {
        intermediate_flags |= EntryFlags::USER_ACCESSIBLE;
    }
    table.store(p2_index, PageTableEntry::new(new_table_frame, intermediate_flags));
    local_invalidate_page(virt);
    Ok(())
}

/// Tears down every intermediate table frame owned by `space`, finally
/// freeing the root itself. User spaces never touch the shared kernel
/// subtree they aliased in `init`; only a kernel-only space (which, in
/// practice, is never destroyed while the system is up) frees that half
/// too.
///
/// The caller must have already removed every leaf mapping it cares about;
/// this only reclaims the *tables*, never the data frames a P1 entry
/// points to.
pub fn destroy(space: AddressSpace) {
    let skip = if space.is_user {
        Some((KERNEL_SPACE_P4_INDEX_START, ENTRIES_PER_TABLE))
    } else {
        None
    };
    // SAFETY: `space` is consumed here, so nothing else can be walking its
    // tree concurrently.
    unsafe {
        free_table_tree(space.root, 4, skip);
    }
}

/// # Safety
/// `frame` must be a live table at tree depth `depth` (4 = P4 .. 1 = P1),
/// reachable through the direct physical map, and not concurrently walked.
unsafe fn free_table_tree(frame: Frame, depth: usize, skip: Option<(usize, usize)>) {
    if depth > 1 {
        let table = Table::at(frame);
        for i in 0..ENTRIES_PER_TABLE {
            if let Some((start, end)) = skip {
                if i >= start && i < end {
                    continue;
                }
            }
            let entry = table.load(i);
            if entry.flags().is_present() && !entry.flags().is_huge() {
                if let Some(child) = entry.pointed_frame() {
                    free_table_tree(child, depth - 1, None);
                }
            }
        }
    }
    let _ = frame_allocator::free(frame, 1);
}

/// Installs `space`'s root into the MMU on the calling CPU. The caller is
/// responsible for calling [`mark_inactive`] on whatever space this CPU
/// was previously running, the way the scheduler's context-switch
/// algorithm does.
#[cfg(not(test))]
pub fn switch(space: &AddressSpace, cpu_index: usize) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    let phys = PhysAddr::new(space.root.start_address().value() as u64);
    let frame = PhysFrame::containing_address(phys);
    // SAFETY: `frame` holds a valid, fully-populated P4 table.
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
    space.active_cpus.fetch_or(1 << cpu_index, Ordering::AcqRel);
}

#[cfg(test)]
pub fn switch(space: &AddressSpace, cpu_index: usize) {
    space.active_cpus.fetch_or(1 << cpu_index, Ordering::AcqRel);
}

pub fn mark_inactive(space: &AddressSpace, cpu_index: usize) {
    space.active_cpus.fetch_and(!(1 << cpu_index), Ordering::AcqRel);
}

#[cfg(not(test))]
fn local_invalidate_page(virt: VirtualAddress) {
    use x86_64::VirtAddr;
    // SAFETY: invalidating a TLB entry is always sound; at worst it's an
    // unnecessary flush.
    x86_64::instructions::tlb::flush(VirtAddr::new(virt.value() as u64));
}

#[cfg(test)]
fn local_invalidate_page(_virt: VirtualAddress) {}

/// Returns the kernel virtual address through which `base..base+size` is
/// already reachable, via the direct physical map every other core crate
/// assumes. Unlike the teacher's temporary-mapping helper, this never
/// installs new page-table entries: the whole of low physical memory is
/// mapped up front, so there is nothing left to do but compute the
/// address (see DESIGN.md).
pub fn phys_map(base: PhysicalAddress, _size: usize) -> VirtualAddress {
    VirtualAddress::new_canonical(PHYSMAP_OFFSET + base.value())
}

/// The inverse of [`phys_map`]; a no-op for the same reason.
pub fn phys_unmap(_virt: VirtualAddress, _size: usize) {}
