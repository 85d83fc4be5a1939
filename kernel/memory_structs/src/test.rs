extern crate std;

use super::*;

#[test]
fn frame_range_size_matches_byte_size() {
    let range = FrameRange::from_phys_addr(PhysicalAddress::new_canonical(0x1000), 3 * 4096);
    assert_eq!(range.size_in_frames(), 3);
    assert_eq!(range.size_in_bytes(), 3 * 4096);
}

#[test]
fn empty_range_has_zero_size() {
    let range = FrameRange::empty();
    assert!(range.is_empty());
    assert_eq!(range.size_in_frames(), 0);
    assert_eq!(range.iter().count(), 0);
}

#[test]
fn zero_byte_request_is_empty() {
    let range = FrameRange::from_phys_addr(PhysicalAddress::zero(), 0);
    assert!(range.is_empty());
}

#[test]
fn frame_contains_is_inclusive_both_ends() {
    let start = Frame::containing_address(PhysicalAddress::new_canonical(0x4000));
    let end = Frame::containing_address(PhysicalAddress::new_canonical(0x6000));
    let range = FrameRange::new(start, end);
    assert!(range.contains(&start));
    assert!(range.contains(&end));
    assert!(!range.contains(&(end + 1)));
}

#[test]
fn frame_descriptor_starts_free_with_no_owner() {
    let frame = Frame::containing_address(PhysicalAddress::new_canonical(0x8000));
    let desc = FrameDescriptor::new(frame);
    assert_eq!(desc.queue(), FrameQueue::Free);
    assert_eq!(desc.owner_count(), 0);
    assert!(desc.object().is_none());
}

#[test]
fn frame_descriptor_alloc_free_round_trip() {
    let frame = Frame::containing_address(PhysicalAddress::new_canonical(0x9000));
    let desc = FrameDescriptor::new(frame);
    desc.mark_allocated();
    assert_eq!(desc.owner_count(), 1);
    assert_eq!(desc.queue(), FrameQueue::Unqueued);
    desc.mark_free();
    assert_eq!(desc.owner_count(), 0);
    assert_eq!(desc.queue(), FrameQueue::Free);
}

#[test]
fn virtual_address_canonicalizes_high_bit() {
    // Bit 47 set, bits 48..64 clear on input -> must be sign-extended to 1s.
    let addr = VirtualAddress::new_canonical(0x0000_8000_0000_1000);
    assert_eq!(addr.value(), 0xFFFF_8000_0000_1000);
}
