use core::fmt;
use core::ops::{Add, Sub};
use kernel_config::memory::PAGE_SIZE;

use crate::VirtualAddress;

/// A virtual memory page, i.e. a page-aligned chunk of virtual address
/// space of size [`PAGE_SIZE`]. Identified by its *number*, mirroring
/// [`crate::Frame`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page {
    number: usize,
}

impl Page {
    pub const fn containing_address(addr: VirtualAddress) -> Page {
        Page { number: addr.value() / PAGE_SIZE }
    }

    pub const fn number(&self) -> usize {
        self.number
    }

    pub const fn start_address(&self) -> VirtualAddress {
        VirtualAddress::new_canonical(self.number * PAGE_SIZE)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Page(c{:#X})", self.start_address().value())
    }
}

impl Add<usize> for Page {
    type Output = Page;
    fn add(self, rhs: usize) -> Page {
        Page { number: self.number.saturating_add(rhs) }
    }
}
impl Sub<usize> for Page {
    type Output = Page;
    fn sub(self, rhs: usize) -> Page {
        Page { number: self.number.saturating_sub(rhs) }
    }
}

/// An inclusive range of contiguous [`Page`]s, `[start, end]`.
#[derive(Clone, PartialEq, Eq)]
pub struct PageRange {
    start: Page,
    end: Page,
}

impl PageRange {
    pub const fn new(start: Page, end: Page) -> PageRange {
        PageRange { start, end }
    }

    pub const fn empty() -> PageRange {
        PageRange {
            start: Page { number: 1 },
            end: Page { number: 0 },
        }
    }

    pub fn from_virt_addr(start_addr: VirtualAddress, size_in_bytes: usize) -> PageRange {
        if size_in_bytes == 0 {
            return PageRange::empty();
        }
        let start = Page::containing_address(start_addr);
        let end = Page::containing_address(start_addr + (size_in_bytes - 1));
        PageRange::new(start, end)
    }

    pub const fn start(&self) -> &Page {
        &self.start
    }

    pub const fn end(&self) -> &Page {
        &self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start.number > self.end.number
    }

    pub fn size_in_pages(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.end.number - self.start.number + 1
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_pages() * PAGE_SIZE
    }

    pub fn contains(&self, page: &Page) -> bool {
        !self.is_empty() && *page >= self.start && *page <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = Page> {
        (self.start.number..=self.end.number).map(|number| Page { number })
    }
}

impl fmt::Debug for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PageRange({:?} to {:?})", self.start, self.end)
    }
}
