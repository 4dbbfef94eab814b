//! Per-pCPU storage.
//!
//! A [`PerCpu<T>`] holds one `T` for every pCPU of the machine. Slots are
//! padded to a cache line so that pCPUs working on their own slot do not
//! bounce lines between each other. Ids are dense, `0..len`.

use alloc::{boxed::Box, vec::Vec};
use crossbeam_utils::CachePadded;

/// Identifier of a physical CPU.
pub type PcpuId = usize;

/// Storage with one slot per pCPU.
pub struct PerCpu<T> {
    slots: Box<[CachePadded<T>]>,
}

impl<T> PerCpu<T> {
    /// Build an arena for `nr_pcpus` pCPUs, initializing each slot with
    /// `init(pcpu)`.
    pub fn new(nr_pcpus: usize, mut init: impl FnMut(PcpuId) -> T) -> Self {
        debug_assert!(nr_pcpus <= abyss::MAX_CPU);
        Self {
            slots: (0..nr_pcpus)
                .map(|id| CachePadded::new(init(id)))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    /// Number of pCPUs.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the arena has no pCPU.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot of `pcpu`, if it exists.
    #[inline]
    pub fn get(&self, pcpu: PcpuId) -> Option<&T> {
        self.slots.get(pcpu).map(|s| &**s)
    }

    /// Iterate over `(pcpu, slot)`.
    pub fn iter(&self) -> impl Iterator<Item = (PcpuId, &T)> + '_ {
        self.slots.iter().enumerate().map(|(id, s)| (id, &**s))
    }
}

impl<T> core::ops::Index<PcpuId> for PerCpu<T> {
    type Output = T;

    /// Slot of `pcpu`. Panics on an id the arena was not built for.
    #[inline]
    fn index(&self, pcpu: PcpuId) -> &T {
        &self.slots[pcpu]
    }
}
