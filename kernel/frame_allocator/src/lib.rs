//! The Physical Frame Allocator (PFA): tracks every physical memory frame
//! as either free or allocated, hands out contiguous runs on request, and
//! reclaims them on free.
//!
//! Free frames are kept in a size-bucketed, address-ordered index (see
//! [`chunk`]) so that allocation descends straight to a bucket that could
//! satisfy the request and freeing coalesces adjacent runs in O(log n).

#![no_std]

extern crate alloc;

mod chunk;
#[cfg(test)]
mod test;

use alloc::vec::Vec;
use core::ops::Deref;

use bitflags::bitflags;
use spin::{Mutex, Once};

use chunk::{Chunk, FreeIndex};
use kernel_config::memory::{PAGE_SIZE, PHYSMAP_MAX_ADDR, PHYSMAP_OFFSET};
use kernel_config::{fatal, KResult, KernelError};
use memory_structs::{
    Frame, FrameDescriptor, FrameRange, MemoryRegionType, PhysicalAddress, PhysicalMemoryArea,
};

bitflags! {
    /// Per-request allocation policy flags, per the PFA's external contract.
    pub struct AllocFlags: u32 {
        /// Zero-fill the returned frames through the direct physical map
        /// before returning them to the caller.
        const PM_ZERO = 1 << 0;
        /// The caller may block (spin/back off) until frames are
        /// available rather than failing immediately.
        const MM_WAIT = 1 << 1;
        /// This allocation happens before the free-list is fully
        /// populated (during [`init`]); only the bootstrap area reserved
        /// by `init` may be handed out.
        const MM_BOOT = 1 << 2;
        /// The caller is in a context that must never block, even if
        /// `MM_WAIT` is also set; equivalent to `MM_WAIT` being ignored.
        const MM_ATOMIC = 1 << 3;
    }
}

/// A contiguous run of physical frames owned by whoever holds this handle.
/// Dropping it returns the frames to the allocator, mirroring the RAII
/// discipline of the teacher's `AllocatedFrames`.
pub struct AllocatedFrames {
    frames: FrameRange,
}

impl AllocatedFrames {
    pub fn range(&self) -> &FrameRange {
        &self.frames
    }

    pub fn start_address(&self) -> PhysicalAddress {
        self.frames.start().start_address()
    }

    /// Consumes the handle without freeing the frames, e.g. because
    /// ownership is being transferred into a page table entry that will
    /// track its own lifetime.
    pub fn into_range(self) -> FrameRange {
        let range = self.frames.clone();
        core::mem::forget(self);
        range
    }
}

impl Deref for AllocatedFrames {
    type Target = FrameRange;
    fn deref(&self) -> &FrameRange {
        &self.frames
    }
}

impl Drop for AllocatedFrames {
    fn drop(&mut self) {
        if self.frames.is_empty() {
            return;
        }
        free_impl(self.frames.clone());
    }
}

/// Aggregate allocator state returned by [`stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameAllocatorStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub allocated_frames: usize,
    pub reclaimable_pending_frames: usize,
}

struct State {
    free: FreeIndex,
    total_frames: usize,
    reclaimable_pending_frames: usize,
}

static STATE: Mutex<Option<State>> = Mutex::new(None);
static DESCRIPTORS: Once<Vec<FrameDescriptor>> = Once::new();

/// Test-only seam invoked once per failed attempt inside `alloc`'s `MM_WAIT`
/// retry loop, so a test can deterministically free frames the first time a
/// retry actually happens instead of racing a fixed sleep against a busy
/// spin loop that has no real concept of wall-clock time.
#[cfg(test)]
static RETRY_HOOK: Mutex<Option<alloc::boxed::Box<dyn FnMut() + Send>>> = Mutex::new(None);

fn descriptor_for(frame: Frame) -> Option<&'static FrameDescriptor> {
    let descriptors = DESCRIPTORS.get()?;
    let base = descriptors.first()?.frame().number();
    frame.number().checked_sub(base).and_then(|i| descriptors.get(i))
}

/// Builds the per-frame descriptor array and the initial free-chunk index
/// from the boot loader's physical memory map.
///
/// `Free` areas seed the free index directly. `Reclaimable` areas are
/// marked allocated up front (their descriptors exist but are not in any
/// free list) and are only released in bulk by [`late_init`], once
/// whatever holds them (ACPI tables, boot modules) has finished reading
/// them. `Reserved`/`Internal`/`Allocated` areas get descriptors but never
/// enter a free list at all.
pub fn init(areas: &[PhysicalMemoryArea]) -> KResult<()> {
    let mut min_frame = usize::MAX;
    let mut max_frame = 0usize;
    for area in areas {
        if area.size_in_bytes == 0 {
            continue;
        }
        let range = FrameRange::from_phys_addr(area.base_addr, area.size_in_bytes);
        min_frame = min_frame.min(range.start().number());
        max_frame = max_frame.max(range.end().number());
    }
    if min_frame > max_frame {
        return Err(KernelError::InvalidArgument);
    }

    let descriptors: Vec<FrameDescriptor> = (min_frame..=max_frame)
        .map(|number| FrameDescriptor::new(Frame::containing_address(PhysicalAddress::new_canonical(number * PAGE_SIZE))))
        .collect();
    DESCRIPTORS.call_once(|| descriptors);

    let mut free = FreeIndex::new();
    let mut reclaimable_pending_frames = 0usize;
    for area in areas {
        if area.size_in_bytes == 0 {
            continue;
        }
        let range = FrameRange::from_phys_addr(area.base_addr, area.size_in_bytes);
        match area.typ {
            MemoryRegionType::Free => {
                free.insert(Chunk { start: *range.start(), end: *range.end() });
            }
            MemoryRegionType::Reclaimable => {
                for frame in range.iter() {
                    if let Some(d) = descriptor_for(frame) {
                        d.mark_allocated();
                    }
                }
                reclaimable_pending_frames += range.size_in_frames();
            }
            MemoryRegionType::Allocated | MemoryRegionType::Reserved | MemoryRegionType::Internal => {
                for frame in range.iter() {
                    if let Some(d) = descriptor_for(frame) {
                        d.mark_allocated();
                    }
                }
            }
        }
    }

    let total_frames = max_frame - min_frame + 1;
    *STATE.lock() = Some(State {
        free,
        total_frames,
        reclaimable_pending_frames,
    });
    Ok(())
}

/// Releases every `Reclaimable` area reserved by [`init`] back into the
/// free index, once the boot sequence no longer needs to read them.
pub fn late_init_release_reclaimable(areas: &[PhysicalMemoryArea]) {
    let mut guard = STATE.lock();
    let state = match guard.as_mut() {
        Some(s) => s,
        None => return,
    };
    for area in areas {
        if area.typ != MemoryRegionType::Reclaimable || area.size_in_bytes == 0 {
            continue;
        }
        let range = FrameRange::from_phys_addr(area.base_addr, area.size_in_bytes);
        for frame in range.iter() {
            if let Some(d) = descriptor_for(frame) {
                d.mark_free();
            }
        }
        state.free.insert(Chunk { start: *range.start(), end: *range.end() });
        state.reclaimable_pending_frames = state.reclaimable_pending_frames.saturating_sub(range.size_in_frames());
    }
}

// Under a hosted `#[cfg(test)]` run there is no direct physical map behind
// PHYSMAP_OFFSET, so the real write would fault; the test build only
// checks that the request was well formed.
#[cfg(not(test))]
fn zero_fill(range: &FrameRange) {
    let start_addr = range.start().start_address().value();
    let len = range.size_in_bytes();
    assert!(
        start_addr + len <= PHYSMAP_MAX_ADDR,
        "frame range exceeds the direct physical map window"
    );
    // SAFETY: the direct physical map window covers every address up to
    // PHYSMAP_MAX_ADDR per the boot sequence's contract (see DESIGN.md),
    // and this range was just removed from the free index so no other
    // owner can observe the write.
    unsafe {
        let ptr = (PHYSMAP_OFFSET + start_addr) as *mut u8;
        core::ptr::write_bytes(ptr, 0, len);
    }
}

#[cfg(test)]
fn zero_fill(range: &FrameRange) {
    let start_addr = range.start().start_address().value();
    let len = range.size_in_bytes();
    assert!(
        start_addr + len <= PHYSMAP_MAX_ADDR,
        "frame range exceeds the direct physical map window"
    );
}

/// Upper bound on the number of times [`alloc`] retries a failed search
/// under `MM_WAIT` before giving up. This core has no reclaim mechanism of
/// its own to wait on (no pager, per spec.md §1's Non-goals), so "block
/// until a page is free" is approximated as a bounded back-off retry rather
/// than a true indefinite block: other CPUs' concurrent `free` calls are
/// the only thing that can make a retry succeed, and this gives them a
/// generous number of chances to run before the caller gives up.
const MM_WAIT_MAX_ATTEMPTS: u32 = 10_000;

/// A single, non-blocking attempt to carve `count` frames (aligned to
/// `align_in_frames`, inside `[window_start, window_end]`) out of the free
/// index. Takes and releases `STATE`'s lock itself so that a caller looping
/// on failure (see [`alloc`]'s `MM_WAIT` handling) never holds the lock
/// across a retry and starves a concurrent `free`.
fn try_alloc_once(
    count: usize,
    align_in_frames: usize,
    window_start: Frame,
    window_end: Frame,
) -> KResult<FrameRange> {
    let mut guard = STATE.lock();
    let state = guard.as_mut().ok_or(KernelError::InvalidArgument)?;

    // Search space may need to grow slightly to account for alignment
    // padding at the front of a candidate chunk.
    let search_min = count + align_in_frames - 1;
    let chunk = state.free.take_fitting(search_min.max(count), window_start, window_end);
    let chunk = match chunk {
        Some(c) => c,
        None => return Err(KernelError::OutOfMemory),
    };

    let chunk_start = chunk.start.number().max(window_start.number());
    let aligned_start = round_up(chunk_start, align_in_frames);
    let alloc_start = Frame::containing_address(PhysicalAddress::new_canonical(aligned_start * PAGE_SIZE));
    let alloc_end = alloc_start + (count - 1);

    if alloc_end.number() > chunk.end.number() || alloc_end.number() > window_end.number() {
        // Couldn't actually satisfy alignment/window inside this chunk;
        // put it back untouched and report failure. A smarter descent
        // would keep searching other candidates in the same bucket, but
        // this keeps the contract conservative rather than wrong.
        state.free.insert(chunk);
        return Err(KernelError::OutOfMemory);
    }

    // Reinsert the unused head and tail of the chunk.
    if chunk.start.number() < alloc_start.number() {
        state.free.insert(Chunk { start: chunk.start, end: alloc_start - 1 });
    }
    if alloc_end.number() < chunk.end.number() {
        state.free.insert(Chunk { start: alloc_end + 1, end: chunk.end });
    }

    let range = FrameRange::new(alloc_start, alloc_end);
    for frame in range.iter() {
        if let Some(d) = descriptor_for(frame) {
            d.mark_allocated();
        }
    }
    Ok(range)
}

/// Allocates `count` contiguous frames, at least `align` frames apart from
/// the start of any other allocation, constrained to fall entirely within
/// `[min, max]` if given.
///
/// `flags` governs what happens when the free index cannot satisfy the
/// request: `MM_BOOT` converts the soft OOM into a fatal halt (the init
/// phase has no other CPU that could free frames to retry against);
/// `MM_WAIT` (and not `MM_ATOMIC`) retries with a back-off instead of
/// failing immediately, since a concurrent `free` on another CPU may make
/// the next attempt succeed; otherwise (including `MM_ATOMIC`) the first
/// failure is reported straight away.
pub fn alloc(
    count: usize,
    align_in_frames: usize,
    min: Option<Frame>,
    max: Option<Frame>,
    flags: AllocFlags,
) -> KResult<AllocatedFrames> {
    if count == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let align_in_frames = align_in_frames.max(1);
    let window_start = min.unwrap_or(Frame::containing_address(PhysicalAddress::zero()));
    let window_end = max.unwrap_or(Frame::containing_address(PhysicalAddress::new_canonical(usize::MAX)));

    let mut attempts = 0u32;
    let range = loop {
        match try_alloc_once(count, align_in_frames, window_start, window_end) {
            Ok(range) => break range,
            Err(KernelError::InvalidArgument) => return Err(KernelError::InvalidArgument),
            Err(_) => {
                if flags.contains(AllocFlags::MM_BOOT) {
                    fatal!(
                        "out of memory during boot: could not allocate {} frame(s) in [{:?}, {:?}]",
                        count, window_start, window_end
                    );
                }
                if flags.contains(AllocFlags::MM_WAIT) && !flags.contains(AllocFlags::MM_ATOMIC) {
                    attempts += 1;
                    if attempts >= MM_WAIT_MAX_ATTEMPTS {
                        return Err(KernelError::OutOfMemory);
                    }
                    #[cfg(test)]
                    if let Some(hook) = RETRY_HOOK.lock().as_mut() {
                        hook();
                    }
                    core::hint::spin_loop();
                    continue;
                }
                return Err(KernelError::OutOfMemory);
            }
        }
    };

    if flags.contains(AllocFlags::PM_ZERO) {
        zero_fill(&range);
    }

    Ok(AllocatedFrames { frames: range })
}

/// Allocates a single frame. Equivalent to `alloc(1, 1, None, None, flags)`.
pub fn alloc_single(flags: AllocFlags) -> KResult<AllocatedFrames> {
    alloc(1, 1, None, None, flags)
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

fn free_impl(range: FrameRange) {
    let mut guard = STATE.lock();
    let state = match guard.as_mut() {
        Some(s) => s,
        None => return,
    };
    for frame in range.iter() {
        if let Some(d) = descriptor_for(frame) {
            d.mark_free();
        }
    }
    state.free.insert(Chunk { start: *range.start(), end: *range.end() });
}

/// Explicitly frees a range of frames that isn't being tracked by an
/// [`AllocatedFrames`] handle (e.g. frames reconstructed from a saved
/// physical address at boot). Prefer letting `AllocatedFrames` drop
/// wherever a handle is already held.
pub fn free(base: Frame, count: usize) -> KResult<()> {
    if count == 0 {
        return Err(KernelError::InvalidArgument);
    }
    free_impl(FrameRange::new(base, base + (count - 1)));
    Ok(())
}

/// Looks up the descriptor for the frame containing `addr`, if it falls
/// within the range covered by [`init`].
pub fn lookup(addr: PhysicalAddress) -> Option<&'static FrameDescriptor> {
    descriptor_for(Frame::containing_address(addr))
}

pub fn stats() -> FrameAllocatorStats {
    let guard = STATE.lock();
    match guard.as_ref() {
        Some(state) => {
            let free_frames = state.free.total_free_frames();
            FrameAllocatorStats {
                total_frames: state.total_frames,
                free_frames,
                allocated_frames: state
                    .total_frames
                    .saturating_sub(free_frames)
                    .saturating_sub(state.reclaimable_pending_frames),
                reclaimable_pending_frames: state.reclaimable_pending_frames,
            }
        }
        None => FrameAllocatorStats::default(),
    }
}

/// Copies `count` frames of raw content from `src` to `dst` through the
/// direct physical map, without requiring either side to already be
/// mapped into the running address space.
pub fn copy(dst: Frame, src: Frame, count: usize) {
    let len = count * PAGE_SIZE;
    let src_addr = src.start_address().value();
    let dst_addr = dst.start_address().value();
    assert!(src_addr + len <= PHYSMAP_MAX_ADDR && dst_addr + len <= PHYSMAP_MAX_ADDR);
    // SAFETY: both ranges are reachable through the direct physical map
    // and the caller guarantees `dst`/`src` do not overlap (frames are
    // page-granular, non-overlapping physical objects by construction).
    unsafe {
        let src_ptr = (PHYSMAP_OFFSET + src_addr) as *const u8;
        let dst_ptr = (PHYSMAP_OFFSET + dst_addr) as *mut u8;
        core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, len);
    }
}
