//! Physical-page and kernel-VM-window constants.
//!
//! This assumes the single 64-bit MMU model named in spec.md's Non-goals:
//! one page size, 4-level paging, no multi-architecture abstraction.

/// 64-bit architecture results in 8 bytes per address.
pub const BYTES_PER_ADDR: usize = core::mem::size_of::<usize>();

/// The lower 12 bits of an address are the in-page offset.
pub const PAGE_SHIFT: usize = 12;
/// Page size is 4096 bytes, 4KiB pages (the fixed size `P` of spec.md §3).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Value: 512. Number of entries in one page-table level.
pub const ENTRIES_PER_PAGE_TABLE: usize = PAGE_SIZE / BYTES_PER_ADDR;

pub const MAX_VIRTUAL_ADDRESS: usize = usize::MAX;
pub const MAX_PAGE_NUMBER: usize = MAX_VIRTUAL_ADDRESS / PAGE_SIZE;

/// The size in pages of each kernel stack.
#[cfg(not(debug_assertions))]
pub const KERNEL_STACK_SIZE_IN_PAGES: usize = 16;
#[cfg(debug_assertions)]
pub const KERNEL_STACK_SIZE_IN_PAGES: usize = 32;

/// The linear offset between physical memory and the higher-half kernel
/// mapping. e.g. physical address 0xb8000 is mapped at
/// `KERNEL_OFFSET + 0xb8000`.
pub const KERNEL_OFFSET: usize = 0xFFFF_FFFF_8000_0000;

/// Start of the kernel virtual memory window that the Kernel Memory Arena
/// (§4.3) carves into allocated/free segments.
pub const KERNEL_HEAP_START: usize = 0xFFFF_FE00_0000_0000;
/// Size in bytes of the kernel virtual memory window at boot; the arena
/// may grow this by requesting more address space if it ever runs out,
/// but the core does not implement that growth (see DESIGN.md).
#[cfg(not(debug_assertions))]
pub const KERNEL_HEAP_INITIAL_SIZE: usize = 256 * 1024 * 1024; // 256 MiB
#[cfg(debug_assertions)]
pub const KERNEL_HEAP_INITIAL_SIZE: usize = 1024 * 1024 * 1024; // 1 GiB, debug builds need more room.

/// An allocated-table bucket in the Kernel Memory Arena's hash table
/// requests an asynchronous rehash once it grows past this many entries.
pub const KMA_REHASH_THRESHOLD: usize = 32;

/// Upper bound on the number of distinct physical memory areas the boot
/// loader's memory map may describe; used to size fixed early-boot arrays
/// before heap allocation is available.
pub const MAX_BOOT_MEMORY_AREAS: usize = 32;

/// Physical addresses below this bound are reachable by 32-bit-addressable
/// hardware (e.g. legacy page-table roots on some MMUs); the Address-Space
/// Mapper constrains top-level table allocations to this window for user
/// address spaces, per spec.md §4.2.
pub const LOW_MEMORY_LIMIT: usize = 4 * 1024 * 1024 * 1024; // 4 GiB

/// Number of bytes below the user stack pointer that a signal frame must
/// never clobber (the "red zone" from the GLOSSARY).
pub const SIGNAL_RED_ZONE: usize = 128;

/// Start of a permanent linear window mapping the whole of physical memory,
/// i.e. physical address `p` is always reachable at `PHYSMAP_OFFSET + p`.
///
/// The Physical Frame Allocator uses this window to zero-fill and copy
/// frame contents (`PM_ZERO`, `copy`) without depending on the Address-Space
/// Mapper, which itself depends on the Physical Frame Allocator for its own
/// page-table frames. The boot sequence is responsible for establishing this
/// mapping before either subsystem's `init` runs; see DESIGN.md.
pub const PHYSMAP_OFFSET: usize = 0xFFFF_8000_0000_0000;
/// Largest physical address the direct map window above is sized to reach.
pub const PHYSMAP_MAX_ADDR: usize = 4 * 1024 * 1024 * 1024 * 1024; // 4 TiB

/// The canonical-address split point between the user-addressable half and
/// the kernel half: `0..USER_SPACE_LIMIT` is user space, everything from
/// here up through the sign-extended canonical hole is kernel space. Used
/// by the Trap Dispatcher's page-fault handler to tell a user-mode access
/// to a kernel address (spec.md §9's "kernel address, user-mode access")
/// apart from an ordinary unmapped user address.
pub const USER_SPACE_LIMIT: usize = 1 << 47;
