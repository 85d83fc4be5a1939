//! Physical/virtual address, frame/page, physical-memory-area, and
//! per-frame-descriptor types shared across the memory subsystem
//! (Physical Frame Allocator, Address-Space Mapper, Kernel Memory Arena).

#![no_std]

extern crate kernel_config;

mod addr;
mod area;
mod descriptor;
mod frame;
mod page;

pub use addr::{PhysicalAddress, VirtualAddress};
pub use area::{MemoryRegionType, PhysicalMemoryArea};
pub use descriptor::{FrameDescriptor, FrameQueue};
pub use frame::{Frame, FrameRange};
pub use page::{Page, PageRange};

#[cfg(test)]
mod test;
