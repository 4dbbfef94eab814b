use abyss::addressing::{Pa, Va, PAGE_SIZE};
use alloc::{boxed::Box, vec::Vec};
use core::ptr::NonNull;

#[repr(C, align(4096))]
struct PageFrame([u8; PAGE_SIZE]);

/// Base physical address reported for host-backed regions.
const HOST_BACKED_BASE: usize = 0x40_0000_0000;

/// A physically contiguous run of pages together with its host mapping.
pub struct PoolRegion {
    base_pa: Pa,
    base_va: Va,
    pages: usize,
    backing: Option<NonNull<[PageFrame]>>,
}

// The backing is only reached through raw page pointers handed out by the pool.
unsafe impl Send for PoolRegion {}
unsafe impl Sync for PoolRegion {}

impl PoolRegion {
    /// Describe `pages` pages at `base_pa`, mapped at `base_va`.
    ///
    /// # Safety
    /// The memory must be reserved for the pool for its whole lifetime and
    /// `base_va` must map `base_pa` for `pages` pages.
    pub unsafe fn new(base_pa: Pa, base_va: Va, pages: usize) -> Self {
        Self {
            base_pa,
            base_va,
            pages,
            backing: None,
        }
    }

    /// A region over `pages` zeroed pages of heap memory.
    ///
    /// The region reports a synthetic physical base; only the pool can
    /// translate it back to a host pointer.
    pub fn host_backed(pages: usize) -> Self {
        let frames = (0..pages)
            .map(|_| PageFrame([0; PAGE_SIZE]))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let backing = NonNull::from(Box::leak(frames));
        Self {
            base_pa: Pa::new(HOST_BACKED_BASE).unwrap_or(Pa::ZERO),
            base_va: Va::from_ptr(backing.as_ptr() as *const PageFrame),
            pages,
            backing: Some(backing),
        }
    }

    /// Physical address of the first page.
    #[inline]
    pub fn base_pa(&self) -> Pa {
        self.base_pa
    }

    /// Number of pages.
    #[inline]
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Page index of `pa`, if it is a page-aligned address inside the region.
    pub fn index_of(&self, pa: Pa) -> Option<usize> {
        if !pa.is_aligned(PAGE_SIZE) || pa < self.base_pa {
            return None;
        }
        let idx = (pa.into_usize() - self.base_pa.into_usize()) / PAGE_SIZE;
        (idx < self.pages).then_some(idx)
    }

    /// Physical address of page `idx`.
    #[inline]
    pub fn pa_of(&self, idx: usize) -> Pa {
        self.base_pa + idx * PAGE_SIZE
    }

    /// Host virtual address of `pa`, which may point anywhere inside a page.
    pub fn va_of(&self, pa: Pa) -> Option<Va> {
        self.index_of(pa.page_down())?;
        Some(self.base_va + (pa.into_usize() - self.base_pa.into_usize()))
    }
}

impl Drop for PoolRegion {
    fn drop(&mut self) {
        if let Some(backing) = self.backing.take() {
            // Safety: created by Box::leak in host_backed.
            drop(unsafe { Box::from_raw(backing.as_ptr()) });
        }
    }
}
