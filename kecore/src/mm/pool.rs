use super::PoolRegion;
use crate::error::{HvError, HvResult};
use abyss::addressing::{Pa, PhysMapper, Va, PAGE_SIZE};
use alloc::{vec, vec::Vec};
use spin_lock::SpinLock;

struct Bitmap {
    words: Vec<u64>,
    // Word index where the next search starts.
    hint: usize,
    live: usize,
}

/// A bitmap page allocator over one [`PoolRegion`].
///
/// The search starts at the word of the last successful allocation and wraps
/// around, so consecutive allocations land close to each other and freed
/// pages in that word are reused first.
pub struct PagePool {
    region: PoolRegion,
    capacity: usize,
    dummy: Option<Pa>,
    bitmap: SpinLock<Bitmap>,
}

impl PagePool {
    /// A pool handing out every page of `region`.
    ///
    /// Exhausting it is fatal.
    pub fn new(region: PoolRegion) -> Self {
        let capacity = region.pages();
        Self::build(region, capacity, None)
    }

    /// A pool that keeps the last page of `region` as the dummy page handed
    /// out by [`PagePool::alloc_page_or_dummy`] once the pool runs dry.
    pub fn with_dummy(region: PoolRegion) -> Self {
        let capacity = region.pages().saturating_sub(1);
        let dummy = (region.pages() > 0).then(|| region.pa_of(capacity));
        Self::build(region, capacity, dummy)
    }

    fn build(region: PoolRegion, capacity: usize, dummy: Option<Pa>) -> Self {
        let mut words = vec![0u64; (capacity + 63) / 64];
        // Bits past the capacity are permanently allocated.
        if capacity % 64 != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << (capacity % 64);
            }
        }
        Self {
            region,
            capacity,
            dummy,
            bitmap: SpinLock::new(Bitmap {
                words,
                hint: 0,
                live: 0,
            }),
        }
    }

    /// Number of pages the pool can hand out.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pages currently allocated.
    pub fn live_pages(&self) -> usize {
        self.bitmap.lock().live
    }

    /// Returns true if `pa` is the dummy page of this pool.
    pub fn is_dummy(&self, pa: Pa) -> bool {
        self.dummy == Some(pa)
    }

    fn take_index(&self) -> Option<usize> {
        let mut bitmap = self.bitmap.lock();
        let nr_words = bitmap.words.len();
        for i in 0..nr_words {
            let w = (bitmap.hint + i) % nr_words;
            let word = bitmap.words[w];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros() as usize;
                bitmap.words[w] |= 1 << bit;
                bitmap.hint = w;
                bitmap.live += 1;
                return Some(w * 64 + bit);
            }
        }
        None
    }

    fn zero(&self, pa: Pa) {
        if let Some(va) = self.region.va_of(pa) {
            // Safety: the page was just taken from the pool; nobody else
            // references it.
            unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
        }
    }

    /// Allocate a zeroed page, or `None` if the pool is exhausted.
    pub fn try_alloc_page(&self) -> Option<Pa> {
        let pa = self.region.pa_of(self.take_index()?);
        self.zero(pa);
        Some(pa)
    }

    /// Allocate a zeroed page.
    ///
    /// # Panics
    /// Panics if the pool is exhausted. Pools without a dummy page back
    /// boot-time mappings whose size is fixed by the configuration, so running
    /// out means the configuration is wrong.
    pub fn alloc_page(&self) -> Pa {
        match self.try_alloc_page() {
            Some(pa) => pa,
            None => panic!(
                "page pool exhausted ({} pages); the pool is sized too small",
                self.capacity
            ),
        }
    }

    /// Allocate a zeroed page, falling back to the dummy page on exhaustion.
    ///
    /// The dummy page is shared by every failed allocation; callers on this
    /// path must tolerate aliasing. Pools without a dummy page panic like
    /// [`PagePool::alloc_page`].
    pub fn alloc_page_or_dummy(&self) -> Pa {
        if let Some(pa) = self.try_alloc_page() {
            return pa;
        }
        match self.dummy {
            Some(dummy) => {
                log::warn!("page pool exhausted, falling back to the dummy page");
                self.zero(dummy);
                dummy
            }
            None => self.alloc_page(),
        }
    }

    /// Return `pa` to the pool.
    ///
    /// The caller guarantees that the page is no longer referenced. Freeing
    /// the dummy page is a no-op.
    pub fn free_page(&self, pa: Pa) -> HvResult {
        if self.is_dummy(pa) {
            return Ok(());
        }
        let idx = match self.region.index_of(pa) {
            Some(idx) if idx < self.capacity => idx,
            _ => return Err(HvError::InvalidArgument),
        };
        let mut bitmap = self.bitmap.lock();
        let (w, bit) = (idx / 64, idx % 64);
        debug_assert_ne!(bitmap.words[w] & (1 << bit), 0, "double free of {:?}", pa);
        if bitmap.words[w] & (1 << bit) != 0 {
            bitmap.words[w] &= !(1 << bit);
            bitmap.live -= 1;
        }
        Ok(())
    }
}

impl PhysMapper for PagePool {
    fn pa_to_va(&self, pa: Pa) -> Option<Va> {
        self.region.va_of(pa)
    }
}
