//! Memory abstraction.
//!
//! The hypervisor maps host physical memory linearly into its own address
//! space at a fixed offset, so a physical address and its host virtual address
//! differ by a constant. Pools that carve memory out of another backing (for
//! example heap memory on a hosted build) provide their own [`PhysMapper`].

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;

/// Size of a 2MiB large page.
pub const LARGE_PAGE_SIZE_2M: usize = 0x20_0000;
/// Size of a 1GiB large page.
pub const LARGE_PAGE_SIZE_1G: usize = 0x4000_0000;

/// Physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address with a check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Returns true if the address is aligned to `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Offset within the page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Round down to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }
}

/// Virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Create a new virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Make a virtual address from a host pointer.
    #[inline]
    pub fn from_ptr<T>(p: *const T) -> Self {
        Self(p as usize)
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Cast into a raw pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Cast into a raw mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Get reference of T underlying the Va.
    ///
    /// # Safety
    ///
    /// The pointer must be properly aligned, dereferenceable and point to an
    /// initialized instance of `T` for the whole lifetime `'a`.
    #[inline]
    pub unsafe fn as_ref<'a, T>(&self) -> Option<&'a T> {
        (self.0 as *const T).as_ref()
    }
}

/// Implements `usize` arithmetic on an address newtype.
#[macro_export]
macro_rules! impl_address_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_address_arith!(Pa);
impl_address_arith!(Va);

impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}

impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}

/// Translation from host physical to host virtual addresses.
pub trait PhysMapper: Send + Sync {
    /// Host virtual address through which `pa` can be accessed, if mapped.
    fn pa_to_va(&self, pa: Pa) -> Option<Va>;
}

/// The linear physical memory map of the hypervisor.
pub struct DirectMap {
    offset: usize,
}

impl DirectMap {
    /// Linear map placed at `offset`.
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }
}

impl PhysMapper for DirectMap {
    fn pa_to_va(&self, pa: Pa) -> Option<Va> {
        pa.0.checked_add(self.offset).and_then(Va::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_checks() {
        assert!(Va::new(0x0000_7fff_ffff_f000).is_some());
        assert!(Va::new(0xffff_8000_0000_0000).is_some());
        assert!(Va::new(0x0000_8000_0000_0000).is_none());
        assert!(Pa::new(0xffff_0000_0000_0000).is_none());
    }

    #[test]
    fn alignment_helpers() {
        let pa = Pa::new(0x20_1234).unwrap();
        assert!(!pa.is_aligned(PAGE_SIZE));
        assert_eq!(pa.page_offset(), 0x234);
        assert_eq!(pa.page_down(), Pa::new(0x20_1000).unwrap());
        assert!(Pa::new(0x40_0000).unwrap().is_aligned(LARGE_PAGE_SIZE_2M));
    }

    #[test]
    fn direct_map_offsets() {
        let map = DirectMap::new(0xffff_8000_0000_0000);
        assert_eq!(
            map.pa_to_va(Pa::new(0x1000).unwrap()),
            Va::new(0xffff_8000_0000_1000)
        );
    }
}
