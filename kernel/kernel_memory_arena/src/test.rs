extern crate std;

use std::sync::Mutex;

use super::*;
use memory_structs::{MemoryRegionType, PhysicalMemoryArea};

// All tests in this binary share the process-wide `frame_allocator`,
// `memory`, and arena singletons; serialize them and always reinitialize
// with the same bounds so one test's state can't collide with another's.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn setup() -> std::sync::MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap();
    let areas = [PhysicalMemoryArea::new(
        PhysicalAddress::new_canonical(0),
        4096 * 4096,
        MemoryRegionType::Free,
    )];
    frame_allocator::init(&areas).unwrap();
    *STATE.lock() = None;
    init().unwrap();
    guard
}

#[test]
fn alloc_then_free_returns_range_to_the_free_list() {
    let _guard = setup();
    let before = STATE.lock().as_ref().unwrap().nodes.total_free_bytes();
    let virt = alloc(PAGE_SIZE, AllocFlags::empty()).unwrap();
    free(virt, PAGE_SIZE).unwrap();
    let after = STATE.lock().as_ref().unwrap().nodes.total_free_bytes();
    assert_eq!(before, after);
}

#[test]
fn alloc_rounds_size_up_to_a_full_page() {
    let _guard = setup();
    let virt = alloc(1, AllocFlags::empty()).unwrap();
    assert_eq!(state_size_of(virt), PAGE_SIZE);
    free(virt, 1).unwrap();
}

#[test]
fn alloc_backs_every_page_with_a_readable_writable_mapping() {
    let _guard = setup();
    let virt = alloc(3 * PAGE_SIZE, AllocFlags::empty()).unwrap();
    let space = kernel_space();
    for i in 0..3 {
        assert!(memory::find(space, virt + i * PAGE_SIZE).is_some());
    }
    free(virt, 3 * PAGE_SIZE).unwrap();
}

#[test]
fn free_of_zero_size_is_rejected() {
    let _guard = setup();
    assert!(matches!(alloc(0, AllocFlags::empty()), Err(KernelError::InvalidArgument)));
}

#[test]
fn free_with_mismatched_size_is_rejected_and_allocation_survives() {
    let _guard = setup();
    let virt = alloc(PAGE_SIZE, AllocFlags::empty()).unwrap();
    assert!(free(virt, 2 * PAGE_SIZE).is_err());
    // The mismatched call must not have released the real allocation.
    free(virt, PAGE_SIZE).unwrap();
}

#[test]
fn map_and_unmap_do_not_touch_the_backing_frames() {
    let _guard = setup();
    let phys = PhysicalAddress::new_canonical(0x10_0000);
    let virt = map(phys, PAGE_SIZE, ProtectionFlags::READ, AllocFlags::empty()).unwrap();
    let space = kernel_space();
    assert_eq!(memory::find(space, virt), Some(phys));
    unmap(virt, PAGE_SIZE, false).unwrap();
    assert_eq!(memory::find(space, virt), None);
}

#[test]
fn raw_alloc_reserves_vm_without_installing_any_mapping() {
    let _guard = setup();
    let virt = raw_alloc(PAGE_SIZE, AllocFlags::empty()).unwrap();
    let space = kernel_space();
    assert_eq!(memory::find(space, virt), None);
    raw_free(virt, PAGE_SIZE).unwrap();
}

fn state_size_of(virt: VirtualAddress) -> usize {
    *STATE.lock().as_ref().unwrap().allocated.get(&virt.value()).unwrap()
}
