//! The Kernel Memory Arena (KMA): the allocator for the kernel's own
//! virtual address window, layered on top of the Address-Space Mapper and
//! Physical Frame Allocator.
//!
//! A single ordered node list (`node::FreeIndex`) partitions the whole
//! window into `{base, size, allocated}` runs; free runs additionally sit
//! on a bucketed free-list for single-probe allocation, and allocated runs
//! additionally sit in an FNV-hashed table keyed by base address so `free`
//! and `unmap` can validate a caller's claimed size in O(1) rather than by
//! walking the node list.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod node;
#[cfg(test)]
mod test;

use core::hash::BuildHasherDefault;

use fnv::FnvHasher;
use hashbrown::HashMap;
use spin::{Mutex, Once};

use frame_allocator::AllocFlags;
use kernel_config::memory::{KERNEL_HEAP_INITIAL_SIZE, KERNEL_HEAP_START, KMA_REHASH_THRESHOLD, PAGE_SIZE};
use kernel_config::{KResult, KernelError};
use memory::{AddressSpace, ProtectionFlags};
use memory_structs::{Frame, PhysicalAddress, VirtualAddress};
use node::FreeIndex;

struct State {
    nodes: FreeIndex,
    /// base address -> size, of every currently allocated node. Exists
    /// alongside `nodes` so `free`/`unmap` can validate a caller's size
    /// without walking the ordered list; real growth past
    /// [`KMA_REHASH_THRESHOLD`] entries is handled by `hashbrown`'s own
    /// amortized resize, which this core relies on directly rather than
    /// staging a background rehash behind a second table, since every
    /// arena operation already runs under `STATE`'s single lock (see
    /// DESIGN.md).
    allocated: HashMap<usize, usize, BuildHasherDefault<FnvHasher>>,
}

static STATE: Mutex<Option<State>> = Mutex::new(None);
static KERNEL_SPACE: Once<AddressSpace> = Once::new();

fn kernel_space() -> &'static AddressSpace {
    KERNEL_SPACE.call_once(|| {
        memory::init(false).unwrap_or_else(|_| {
            kernel_config::fatal!("failed to establish the kernel address space for the arena")
        })
    })
}

/// Establishes the arena over the kernel VM window
/// (`KERNEL_HEAP_START .. + KERNEL_HEAP_INITIAL_SIZE`).
pub fn init() -> KResult<()> {
    let _ = kernel_space();
    let mut nodes = FreeIndex::new();
    nodes.seed(KERNEL_HEAP_START, KERNEL_HEAP_INITIAL_SIZE);
    *STATE.lock() = Some(State { nodes, allocated: HashMap::default() });
    Ok(())
}

fn round_up_to_page(size: usize) -> KResult<usize> {
    if size == 0 {
        return Err(KernelError::InvalidArgument);
    }
    Ok((size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
}

/// Reserves `size` bytes of kernel VM, with no backing frames and no
/// mappings installed. The counterpart to [`raw_free`].
pub fn raw_alloc(size: usize, _flags: AllocFlags) -> KResult<VirtualAddress> {
    let size = round_up_to_page(size)?;
    let mut guard = STATE.lock();
    let state = guard.as_mut().ok_or(KernelError::InvalidArgument)?;
    let base = state.nodes.reserve(size).ok_or(KernelError::OutOfMemory)?;
    state.allocated.insert(base, size);
    if state.allocated.len() > KMA_REHASH_THRESHOLD {
        state.allocated.reserve(0); // nudge hashbrown to settle its table now rather than mid-insert later
    }
    Ok(VirtualAddress::new_canonical(base))
}

/// Returns a range reserved by [`raw_alloc`]; never touches mappings or
/// frames, so a caller who mapped anything into this range themselves
/// must have already undone that.
pub fn raw_free(virt: VirtualAddress, size: usize) -> KResult<()> {
    let size = round_up_to_page(size)?;
    release_range(virt, size)
}

fn release_range(virt: VirtualAddress, size: usize) -> KResult<()> {
    let mut guard = STATE.lock();
    let state = guard.as_mut().ok_or(KernelError::InvalidArgument)?;
    let base = virt.value();
    let recorded = state.allocated.remove(&base).ok_or(KernelError::InvalidArgument)?;
    if recorded != size {
        state.allocated.insert(base, recorded);
        return Err(KernelError::InvalidArgument);
    }
    state.nodes.release(base, size).ok_or(KernelError::InvalidArgument)?;
    Ok(())
}

/// Reserves `size` bytes and backs every page with a freshly allocated
/// frame, mapped read/write. The counterpart to [`free`].
pub fn alloc(size: usize, flags: AllocFlags) -> KResult<VirtualAddress> {
    alloc_etc(size, ProtectionFlags::READ | ProtectionFlags::WRITE, flags)
}

/// Like [`alloc`], but with caller-specified page protection.
pub fn alloc_etc(size: usize, mmu_flags: ProtectionFlags, flags: AllocFlags) -> KResult<VirtualAddress> {
    let size = round_up_to_page(size)?;
    let virt = raw_alloc(size, flags)?;
    let num_pages = size / PAGE_SIZE;
    let space = kernel_space();

    for i in 0..num_pages {
        let page_virt = virt + i * PAGE_SIZE;
        let result = frame_allocator::alloc_single(flags)
            .and_then(|frames| {
                let frame = *frames.into_range().start();
                memory::insert(space, page_virt, frame.start_address(), mmu_flags, flags)
                    .map_err(|e| {
                        let _ = frame_allocator::free(frame, 1);
                        e
                    })
            });
        if let Err(e) = result {
            unwind_partial_alloc(space, virt, i);
            let _ = raw_free(virt, size);
            return Err(e);
        }
    }
    Ok(virt)
}

/// Unmaps and frees every page `[0, installed)` of a range whose
/// remaining pages failed to install, per `alloc_etc`'s "partial failure
/// unmaps and frees everything it installed" contract.
fn unwind_partial_alloc(space: &AddressSpace, virt: VirtualAddress, installed: usize) {
    for i in 0..installed {
        let page_virt = virt + i * PAGE_SIZE;
        if let Some(phys) = memory::remove(space, page_virt) {
            let _ = frame_allocator::free(Frame::containing_address(phys), 1);
        }
    }
}

/// Unmaps and frees every page of a range allocated by [`alloc`] or
/// [`alloc_etc`], returning the frames to the Physical Frame Allocator.
pub fn free(virt: VirtualAddress, size: usize) -> KResult<()> {
    let rounded = round_up_to_page(size)?;
    let num_pages = rounded / PAGE_SIZE;
    let space = kernel_space();
    for i in 0..num_pages {
        let page_virt = virt + i * PAGE_SIZE;
        if let Some(phys) = memory::remove(space, page_virt) {
            let _ = frame_allocator::free(Frame::containing_address(phys), 1);
        }
    }
    release_range(virt, rounded)
}

/// Reserves VM and maps it onto an existing, caller-owned physical range;
/// the arena never takes ownership of these frames. The counterpart to
/// [`unmap`].
pub fn map(phys_base: PhysicalAddress, size: usize, mmu_flags: ProtectionFlags, flags: AllocFlags) -> KResult<VirtualAddress> {
    let size = round_up_to_page(size)?;
    let virt = raw_alloc(size, flags)?;
    let num_pages = size / PAGE_SIZE;
    let space = kernel_space();

    for i in 0..num_pages {
        let page_virt = virt + i * PAGE_SIZE;
        let page_phys = phys_base + i * PAGE_SIZE;
        if let Err(e) = memory::insert(space, page_virt, page_phys, mmu_flags, flags) {
            for j in 0..i {
                memory::remove(space, virt + j * PAGE_SIZE);
            }
            let _ = raw_free(virt, size);
            return Err(e);
        }
    }
    Ok(virt)
}

/// Unmaps a range installed by [`map`], without freeing any frames (the
/// arena never owned them). `shared` marks whether this range may have
/// been touched by more than the calling CPU: when true, every page is
/// additionally shot down on every other CPU with this space active,
/// rather than relying on the local invalidation `memory::remove` already
/// does for the calling CPU alone.
pub fn unmap(virt: VirtualAddress, size: usize, shared: bool) -> KResult<()> {
    let rounded = round_up_to_page(size)?;
    let num_pages = rounded / PAGE_SIZE;
    let space = kernel_space();
    for i in 0..num_pages {
        let page_virt = virt + i * PAGE_SIZE;
        memory::remove(space, page_virt);
        if shared {
            tlb_shootdown::shootdown(space, page_virt);
        }
    }
    release_range(virt, rounded)
}
