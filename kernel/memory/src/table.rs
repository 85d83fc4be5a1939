//! The raw 4-level page-table walk.
//!
//! Every table frame, at any level, is reached through the direct physical
//! map (see `frame_allocator`'s `PHYSMAP_OFFSET`) rather than through a
//! recursive self-map slot: this core's page-table-frame discovery is a
//! simple array lookup, not the `offsetof`-style linked traversal the
//! source used, per the translation notes on cyclic/intrusive linkages.

use core::sync::atomic::{AtomicU64, Ordering};

use kernel_config::memory::{PAGE_SHIFT, PHYSMAP_OFFSET};
use memory_structs::{Frame, PhysicalAddress, VirtualAddress};
use page_table_entry::{EntryFlags, PageTableEntry};

pub const ENTRIES_PER_TABLE: usize = 512;

/// One level of the page-table tree, stored behind the direct physical map.
/// Entries are atomic so that read-only walks (`find`) never need the
/// per-space lock, per the concurrency model's "read-only walks use atomic
/// entry loads".
#[repr(transparent)]
pub struct Table {
    entries: [AtomicU64; ENTRIES_PER_TABLE],
}

impl Table {
    /// # Safety
    /// `frame` must hold a live page table of this level, reachable through
    /// the direct physical map.
    #[cfg(not(test))]
    pub unsafe fn at(frame: Frame) -> &'static Table {
        let addr = PHYSMAP_OFFSET + frame.start_address().value();
        &*(addr as *const Table)
    }

    /// A hosted test binary has no direct physical map behind
    /// `PHYSMAP_OFFSET`, so each distinct frame gets a leaked, process-local
    /// table instead of a real memory reinterpretation. This still
    /// exercises every bit of walk/insert/remove/destroy logic; it just
    /// can't exercise the raw-pointer arithmetic itself.
    #[cfg(test)]
    pub fn at(frame: Frame) -> &'static Table {
        use std::collections::BTreeMap;
        use std::sync::Mutex;

        static TABLES: Mutex<Option<BTreeMap<usize, &'static Table>>> = Mutex::new(None);
        let mut guard = TABLES.lock().unwrap();
        let map = guard.get_or_insert_with(BTreeMap::new);
        *map.entry(frame.number()).or_insert_with(|| {
            let boxed = alloc::boxed::Box::new(Table {
                entries: core::array::from_fn(|_| AtomicU64::new(0)),
            });
            alloc::boxed::Box::leak(boxed)
        })
    }

    pub fn load(&self, index: usize) -> PageTableEntry {
        PageTableEntry::from_raw(self.entries[index].load(Ordering::Acquire))
    }

    pub fn store(&self, index: usize, entry: PageTableEntry) {
        self.entries[index].store(entry.raw(), Ordering::Release);
    }
}

/// The four 9-bit indices (P4, P3, P2, P1) that address a 4 KiB page.
pub fn table_indices(virt: VirtualAddress) -> [usize; 4] {
    let v = virt.value();
    [
        (v >> (PAGE_SHIFT + 27)) & 0x1FF,
        (v >> (PAGE_SHIFT + 18)) & 0x1FF,
        (v >> (PAGE_SHIFT + 9)) & 0x1FF,
        (v >> PAGE_SHIFT) & 0x1FF,
    ]
}

/// Result of walking to the final (P1) table entry for a virtual address.
pub struct Walk {
    pub table: &'static Table,
    pub index: usize,
}

/// Walks from `root` to the P1 entry for `virt`. If `create` is `Some`, any
/// missing intermediate table is allocated (zero-filled) using the closure,
/// which must return a fresh frame to house a new table; without it, a
/// missing intermediate table makes the walk return `None`.
///
/// `user_accessible` must be set whenever the leaf being inserted below this
/// walk is user-accessible: on x86_64 the effective privilege of a
/// translation is the AND of the U/S bit across every level, so a
/// supervisor-only intermediate entry makes every user-mode access below it
/// fault regardless of the leaf's own bits. Newly created intermediate
/// entries therefore carry `USER_ACCESSIBLE` whenever this is set, mirroring
/// how the teacher's mapper propagates the user/writable bits up its own
/// `create_next_table` path. It has no effect when `create` is `None`, since
/// a read-only walk never creates a table to mark.
///
/// # Safety
/// `root` must be a live P4 table frame reachable through the direct
/// physical map.
pub unsafe fn walk(
    root: Frame,
    virt: VirtualAddress,
    mut create: Option<&mut dyn FnMut() -> Option<Frame>>,
    user_accessible: bool,
) -> Option<Walk> {
    let mut intermediate_flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
    if user_accessible {
        intermediate_flags |= EntryFlags::USER_ACCESSIBLE;
    }

    let indices = table_indices(virt);
    let mut table = Table::at(root);
    for &index in &indices[..3] {
        let entry = table.load(index);
        let next_frame = if entry.flags().is_present() {
            if entry.flags().is_huge() {
                // A large page occupies what would be this intermediate
                // table; the caller must split it first
                // (`page_large_to_ptbl`) before walking further.
                return None;
            }
            entry.pointed_frame().expect("present entry with no frame")
        } else {
            let maker = create.as_mut()?;
            let frame = maker()?;
            table.store(index, PageTableEntry::new(frame, intermediate_flags));
            frame
        };
        table = Table::at(next_frame);
    }
    Some(Walk { table, index: indices[3] })
}
