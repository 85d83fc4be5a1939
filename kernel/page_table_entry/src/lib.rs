//! Page-table entry bit layout and the generic `{read, write, execute}`
//! protection set the Address-Space Mapper translates into those bits.

#![no_std]

use bitflags::bitflags;

use memory_structs::{Frame, PhysicalAddress};

bitflags! {
    /// Raw page-table entry bits, following the single 64-bit MMU model
    /// this core assumes (no multi-architecture abstraction).
    #[derive(Default)]
    pub struct EntryFlags: u64 {
        const PRESENT         = 1 << 0;
        const WRITABLE        = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const WRITE_THROUGH   = 1 << 3;
        const NO_CACHE        = 1 << 4;
        const ACCESSED        = 1 << 5;
        const DIRTY           = 1 << 6;
        const HUGE_PAGE       = 1 << 7;
        const GLOBAL          = 1 << 8;
        const NO_EXECUTE      = 1 << 63;
    }
}

impl EntryFlags {
    pub fn is_huge(&self) -> bool {
        self.contains(EntryFlags::HUGE_PAGE)
    }

    pub fn is_present(&self) -> bool {
        self.contains(EntryFlags::PRESENT)
    }

    pub fn is_writable(&self) -> bool {
        self.contains(EntryFlags::WRITABLE)
    }

    /// A page is executable exactly when `NO_EXECUTE` is *not* set.
    pub fn is_executable(&self) -> bool {
        !self.contains(EntryFlags::NO_EXECUTE)
    }

    /// Translates the generic protection set the Address-Space Mapper's
    /// callers speak into the bits this MMU model actually has. `no_execute`
    /// is only honored when the CPU advertised the capability during init
    /// (`nx_supported`); MMUs without it treat every mapping as executable.
    pub fn from_protection(
        prot: ProtectionFlags,
        user_accessible: bool,
        nx_supported: bool,
    ) -> EntryFlags {
        let mut flags = EntryFlags::PRESENT;
        if prot.contains(ProtectionFlags::WRITE) {
            flags |= EntryFlags::WRITABLE;
        }
        if user_accessible {
            flags |= EntryFlags::USER_ACCESSIBLE;
        }
        if nx_supported && !prot.contains(ProtectionFlags::EXECUTE) {
            flags |= EntryFlags::NO_EXECUTE;
        }
        flags
    }

    /// Marks a kernel mapping global, if the CPU supports global pages;
    /// a no-op otherwise so callers don't need to branch on the
    /// capability themselves.
    pub fn with_global_if_supported(self, global_pages_supported: bool) -> EntryFlags {
        if global_pages_supported {
            self | EntryFlags::GLOBAL
        } else {
            self
        }
    }
}

bitflags! {
    /// The generic protection set the Address-Space Mapper's contract
    /// speaks in, independent of any particular MMU's bit layout.
    pub struct ProtectionFlags: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// One slot of a page-table tree: a raw entry plus the bookkeeping needed
/// to walk and mutate it. The physical frame of the table this entry lives
/// in is not stored here; callers reach entries through a mapped page
/// table, the way the Address-Space Mapper's walk does.
#[derive(Debug, Clone, Copy, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

/// Bits 12..52 hold the physical frame number on every MMU this core
/// targets.
const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl PageTableEntry {
    pub const fn unused() -> PageTableEntry {
        PageTableEntry(0)
    }

    /// Builds an entry pointing at `frame` with `flags`, without going
    /// through a `&mut self` mutation; useful when constructing a value to
    /// hand to an atomic table slot.
    pub fn new(frame: Frame, flags: EntryFlags) -> PageTableEntry {
        let mut entry = PageTableEntry::unused();
        entry.set(frame, flags);
        entry
    }

    /// Reinterprets a raw table-slot value as an entry, the way a reader of
    /// an atomic page-table slot does.
    pub const fn from_raw(raw: u64) -> PageTableEntry {
        PageTableEntry(raw)
    }

    /// Returns the raw bits, for storing back into an atomic table slot.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn pointed_frame(&self) -> Option<Frame> {
        if self.flags().is_present() {
            Some(Frame::containing_address(PhysicalAddress::new_canonical(
                (self.0 & ADDRESS_MASK) as usize,
            )))
        } else {
            None
        }
    }

    pub fn set(&mut self, frame: Frame, flags: EntryFlags) {
        let addr = frame.start_address().value() as u64;
        debug_assert_eq!(addr & !ADDRESS_MASK, 0, "frame address doesn't fit the entry's address bits");
        self.0 = addr | flags.bits();
    }

    pub fn set_unused(&mut self) -> Option<Frame> {
        let frame = self.pointed_frame();
        self.0 = 0;
        frame
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unused_entry_has_no_frame() {
        let entry = PageTableEntry::unused();
        assert!(entry.is_unused());
        assert!(entry.pointed_frame().is_none());
    }

    #[test]
    fn set_then_read_round_trips_frame_and_flags() {
        let mut entry = PageTableEntry::unused();
        let frame = Frame::containing_address(PhysicalAddress::new_canonical(0x40_0000));
        let flags = EntryFlags::from_protection(ProtectionFlags::READ | ProtectionFlags::WRITE, true, true);
        entry.set(frame, flags);

        assert!(!entry.is_unused());
        assert_eq!(entry.pointed_frame(), Some(frame));
        assert!(entry.flags().is_writable());
        assert!(!entry.flags().is_executable());
    }

    #[test]
    fn no_execute_ignored_when_cpu_lacks_support() {
        let flags = EntryFlags::from_protection(ProtectionFlags::READ, false, false);
        assert!(flags.is_executable());
    }

    #[test]
    fn set_unused_returns_previous_frame() {
        let mut entry = PageTableEntry::unused();
        let frame = Frame::containing_address(PhysicalAddress::new_canonical(0x80_0000));
        entry.set(frame, EntryFlags::PRESENT);
        let previous = entry.set_unused();
        assert_eq!(previous, Some(frame));
        assert!(entry.is_unused());
    }
}
