use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// Canonicalizes a raw virtual address the way the x86_64 MMU requires:
/// bits 48..64 must be copies of bit 47 (sign-extension of the top bit).
const fn canonicalize_virt(addr: usize) -> usize {
    ((addr << 16) as isize >> 16) as usize
}

/// A 64-bit physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

/// A 64-bit virtual memory address, canonicalized per the MMU's
/// sign-extension rule.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl PhysicalAddress {
    pub const fn new_canonical(addr: usize) -> PhysicalAddress {
        PhysicalAddress(addr)
    }

    pub fn new(addr: usize) -> Option<PhysicalAddress> {
        Some(PhysicalAddress(addr))
    }

    pub const fn zero() -> PhysicalAddress {
        PhysicalAddress(0)
    }

    pub const fn value(&self) -> usize {
        self.0
    }

    pub const fn page_offset(&self) -> usize {
        self.0 & (kernel_config::memory::PAGE_SIZE - 1)
    }

    pub const fn is_aligned(&self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl VirtualAddress {
    pub const fn new_canonical(addr: usize) -> VirtualAddress {
        VirtualAddress(canonicalize_virt(addr))
    }

    /// Returns `Some` only if `addr` is already canonical; `None` otherwise.
    pub fn new(addr: usize) -> Option<VirtualAddress> {
        if addr == canonicalize_virt(addr) {
            Some(VirtualAddress(addr))
        } else {
            None
        }
    }

    pub const fn zero() -> VirtualAddress {
        VirtualAddress(0)
    }

    pub const fn value(&self) -> usize {
        self.0
    }

    pub const fn page_offset(&self) -> usize {
        self.0 & (kernel_config::memory::PAGE_SIZE - 1)
    }

    pub const fn is_aligned(&self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// True if this address falls in the user-addressable half
    /// (`0..USER_SPACE_LIMIT`) rather than the kernel half. Used by the
    /// Trap Dispatcher's page-fault handler to distinguish an ordinary
    /// unmapped user address from a user-mode access to a kernel address.
    pub const fn is_in_user_space(&self) -> bool {
        self.0 < kernel_config::memory::USER_SPACE_LIMIT
    }
}

macro_rules! impl_address_traits {
    ($TypeName:ident) => {
        impl fmt::Debug for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($TypeName), "({:#X})"), self.0)
            }
        }
        impl fmt::Display for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{:#X}", self.0)
            }
        }
        impl fmt::LowerHex for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
        impl Add<usize> for $TypeName {
            type Output = $TypeName;
            fn add(self, rhs: usize) -> $TypeName {
                $TypeName::new_canonical(self.0.saturating_add(rhs))
            }
        }
        impl AddAssign<usize> for $TypeName {
            fn add_assign(&mut self, rhs: usize) {
                *self = *self + rhs;
            }
        }
        impl Sub<usize> for $TypeName {
            type Output = $TypeName;
            fn sub(self, rhs: usize) -> $TypeName {
                $TypeName::new_canonical(self.0.saturating_sub(rhs))
            }
        }
        impl SubAssign<usize> for $TypeName {
            fn sub_assign(&mut self, rhs: usize) {
                *self = *self - rhs;
            }
        }
    };
}

impl_address_traits!(PhysicalAddress);
impl_address_traits!(VirtualAddress);
