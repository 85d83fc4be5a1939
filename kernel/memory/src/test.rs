extern crate std;

use std::sync::Mutex;

use super::*;
use memory_structs::{MemoryRegionType, PhysicalMemoryArea};

// All tests in this binary share the process-wide `frame_allocator` and
// `KERNEL_ROOT` singletons; serialize them and always reinitialize with
// the same bounds so one test's frames can't collide with another's.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn setup() -> std::sync::MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap();
    let areas = [PhysicalMemoryArea::new(
        PhysicalAddress::new_canonical(0),
        256 * 4096,
        MemoryRegionType::Free,
    )];
    frame_allocator::init(&areas).unwrap();
    guard
}

// A virtual address whose P4 index falls in the shared kernel half
// (>= KERNEL_SPACE_P4_INDEX_START), canonicalized the way a real higher-half
// kernel address is.
fn kernel_virt(offset: usize) -> VirtualAddress {
    VirtualAddress::new_canonical(0xFFFF_8000_0000_0000 + offset)
}

fn user_virt(offset: usize) -> VirtualAddress {
    VirtualAddress::new_canonical(0x0000_0000_0040_0000 + offset)
}

#[test]
fn insert_then_find_returns_mapped_address() {
    let _guard = setup();
    let space = init(false).unwrap();
    let virt = user_virt(0);
    let phys = PhysicalAddress::new_canonical(0x1000);

    insert(&space, virt, phys, ProtectionFlags::READ | ProtectionFlags::WRITE, AllocFlags::empty()).unwrap();
    assert_eq!(find(&space, virt), Some(phys));
}

#[test]
fn find_on_unmapped_address_returns_none() {
    let _guard = setup();
    let space = init(false).unwrap();
    assert_eq!(find(&space, user_virt(0x8000)), None);
}

#[test]
fn remove_clears_the_mapping_and_returns_its_frame() {
    let _guard = setup();
    let space = init(false).unwrap();
    let virt = user_virt(0x1000);
    let phys = PhysicalAddress::new_canonical(0x2000);

    insert(&space, virt, phys, ProtectionFlags::READ, AllocFlags::empty()).unwrap();
    assert_eq!(remove(&space, virt), Some(phys));
    assert_eq!(find(&space, virt), None);
}

#[test]
fn remove_on_unmapped_address_returns_none() {
    let _guard = setup();
    let space = init(false).unwrap();
    assert_eq!(remove(&space, user_virt(0x3000)), None);
}

#[test]
fn write_protection_is_reflected_in_entry_flags() {
    let _guard = setup();
    let space = init(false).unwrap();
    let virt = user_virt(0x4000);
    insert(&space, virt, PhysicalAddress::new_canonical(0x5000), ProtectionFlags::READ, AllocFlags::empty()).unwrap();

    // SAFETY: test-only direct walk to inspect the installed entry.
    let walked = unsafe { table::walk(space.root_frame(), virt, None, space.is_user()) }.unwrap();
    assert!(!walked.table.load(walked.index).flags().is_writable());
}

#[test]
fn user_insert_makes_every_intermediate_entry_user_accessible() {
    // On x86_64 the effective privilege of a translation is the AND of the
    // U/S bit across every level: a supervisor-only P4/P3/P2 entry makes a
    // user-accessible leaf unreachable from user mode regardless of its own
    // bits. Every intermediate entry walked to install a user leaf must
    // therefore carry USER_ACCESSIBLE too.
    let _guard = setup();
    let space = init(true).unwrap();
    let virt = user_virt(0xA000);
    insert(&space, virt, PhysicalAddress::new_canonical(0x8000), ProtectionFlags::READ, AllocFlags::empty()).unwrap();

    let indices = table_indices(virt);
    // SAFETY: test-only direct walk down the tree to inspect each level.
    let mut table = unsafe { Table::at(space.root_frame()) };
    for &index in &indices[..3] {
        let entry = table.load(index);
        assert!(entry.flags().is_present());
        assert!(
            entry.flags().contains(EntryFlags::USER_ACCESSIBLE),
            "intermediate entry at index {index} is not user-accessible"
        );
        table = unsafe { Table::at(entry.pointed_frame().unwrap()) };
    }
}

#[test]
fn user_space_aliases_kernel_half() {
    let _guard = setup();
    let kernel_space = init(false).unwrap();
    let virt = kernel_virt(0);
    let phys = PhysicalAddress::new_canonical(0x6000);
    insert(&kernel_space, virt, phys, ProtectionFlags::READ | ProtectionFlags::WRITE, AllocFlags::empty()).unwrap();

    let user_space = init(true).unwrap();
    assert_eq!(find(&user_space, virt), Some(phys));
}

#[test]
fn user_space_does_not_see_other_users_private_mappings() {
    let _guard = setup();
    let _kernel_space = init(false).unwrap();
    let a = init(true).unwrap();
    let b = init(true).unwrap();
    let virt = user_virt(0x9000);
    insert(&a, virt, PhysicalAddress::new_canonical(0x7000), ProtectionFlags::READ, AllocFlags::empty()).unwrap();
    assert_eq!(find(&b, virt), None);
}

#[test]
fn switch_tracks_active_cpus() {
    let _guard = setup();
    let space = init(false).unwrap();
    assert_eq!(space.active_cpus(), 0);
    switch(&space, 2);
    assert_eq!(space.active_cpus(), 0b100);
    mark_inactive(&space, 2);
    assert_eq!(space.active_cpus(), 0);
}

#[test]
fn phys_map_is_stable_under_the_direct_map_offset() {
    let base = PhysicalAddress::new_canonical(0x1234_000);
    let virt = phys_map(base, 4096);
    assert_eq!(virt.value(), PHYSMAP_OFFSET + base.value());
    phys_unmap(virt, 4096);
}
