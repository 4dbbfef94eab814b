//! Extended page table.
//!
//! The EPT translates guest physical addresses into host physical addresses
//! with a 4-level radix tree of 512-entry tables (PML4, PDPT, PD, PT). Leaves
//! may sit at the PDPT (1 GiB) or PD (2 MiB) level when the region is aligned
//! and the [`LargePagePolicy`] allows it.
//!
//! Tables are pages of the table pool. Installing a table publishes it with a
//! compare-and-swap, so vcpus of one vm may demand-map addresses concurrently
//! with [`Ept::map_page_if_absent`]. Deleting and modifying ranges is
//! serialized by the caller.
use crate::vm::Gpa;
use abyss::addressing::{Pa, PhysMapper, PAGE_SIZE};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use kecore::{hv_result_err, mm::PagePool, HvError, HvResult};

bitflags::bitflags! {
    /// Access rights and memory type of an EPT leaf.
    ///
    /// No memory type bit means uncacheable.
    pub struct EptRights: u64 {
        /// Reads allowed.
        const READ = 1 << 0;
        /// Writes allowed.
        const WRITE = 1 << 1;
        /// Instruction fetches allowed.
        const EXECUTE = 1 << 2;
        /// All accesses allowed.
        const RWX = Self::READ.bits | Self::WRITE.bits | Self::EXECUTE.bits;
        /// Write-combining.
        const MT_WC = 1 << 3;
        /// Write-through.
        const MT_WT = 4 << 3;
        /// Write-protected.
        const MT_WP = 5 << 3;
        /// Write-back.
        const MT_WB = 6 << 3;
        /// Memory type field.
        const MT_MASK = 7 << 3;
        /// Ignore the guest PAT.
        const IGNORE_PAT = 1 << 6;
    }
}

const ENTRY_LARGE: u64 = 1 << 7;
const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
const ENTRY_FLAGS_MASK: u64 = 0x7f;
const TABLE_RIGHTS: u64 = 0x7;
const GPA_LIMIT: usize = 1 << 48;
const HPA_LIMIT: usize = 1 << 52;
const ROOT_LEVEL: usize = 4;

type Table = [AtomicU64; 512];

#[inline]
const fn shift(level: usize) -> usize {
    12 + 9 * (level - 1)
}

#[inline]
const fn is_present(entry: u64) -> bool {
    entry & TABLE_RIGHTS != 0
}

#[inline]
const fn is_leaf(entry: u64, level: usize) -> bool {
    level == 1 || entry & ENTRY_LARGE != 0
}

/// Page sizes the platform lets the EPT use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LargePagePolicy {
    /// 2 MiB leaves at the PD level.
    pub pages_2m: bool,
    /// 1 GiB leaves at the PDPT level.
    pub pages_1g: bool,
}

impl LargePagePolicy {
    /// Policy read from `IA32_VMX_EPT_VPID_CAP`.
    pub const fn from_ept_vpid_cap(cap: u64) -> Self {
        Self {
            pages_2m: cap & (1 << 16) != 0,
            pages_1g: cap & (1 << 17) != 0,
        }
    }

    /// 4 KiB pages only.
    pub const fn none() -> Self {
        Self {
            pages_2m: false,
            pages_1g: false,
        }
    }

    fn allows(&self, level: usize) -> bool {
        match level {
            1 => true,
            2 => self.pages_2m,
            3 => self.pages_1g,
            _ => false,
        }
    }
}

enum Op {
    Map {
        gpa: usize,
        hpa: usize,
        rights: EptRights,
    },
    Unmap,
    Modify {
        set: EptRights,
        clear: EptRights,
    },
}

/// The second-level page table of a vm.
pub struct Ept {
    pool: Arc<PagePool>,
    root: Pa,
    policy: LargePagePolicy,
}

impl Ept {
    /// An empty table whose pages come from `pool`.
    pub fn new(pool: Arc<PagePool>, policy: LargePagePolicy) -> Self {
        let root = pool.alloc_page();
        Self { pool, root, policy }
    }

    /// Physical address of the PML4.
    #[inline]
    pub fn root(&self) -> Pa {
        self.root
    }

    /// EPT pointer: write-back paging structures, 4-level walk.
    #[inline]
    pub fn eptp(&self) -> u64 {
        self.root.into_usize() as u64 | (3 << 3) | 6
    }

    fn table(&self, pa: Pa) -> Option<&Table> {
        let va = self.pool.pa_to_va(pa)?;
        // Safety: every table page belongs to the pool and lives as long as
        // the entry that references it.
        unsafe { va.as_ref::<Table>() }
    }

    fn child(entry: u64) -> HvResult<Pa> {
        Pa::new((entry & ENTRY_ADDR_MASK) as usize).ok_or(HvError::Fault)
    }

    fn check_range(gpa: Gpa, size: usize) -> HvResult {
        if size == 0 || !gpa.is_aligned(PAGE_SIZE) || size & (PAGE_SIZE - 1) != 0 {
            hv_result_err!(InvalidArgument, "bad ept range {:?} + 0x{:x}", gpa, size);
        }
        match gpa.into_usize().checked_add(size) {
            Some(end) if end <= GPA_LIMIT => Ok(()),
            _ => hv_result_err!(OutOfRange, "{:?} + 0x{:x}", gpa, size),
        }
    }

    fn check_hpa(hpa: Pa, size: usize) -> HvResult {
        if !hpa.is_aligned(PAGE_SIZE) {
            hv_result_err!(InvalidArgument, "unaligned {:?}", hpa);
        }
        match hpa.into_usize().checked_add(size) {
            Some(end) if end <= HPA_LIMIT => Ok(()),
            _ => hv_result_err!(OutOfRange, "{:?} + 0x{:x}", hpa, size),
        }
    }

    /// Map `[gpa, gpa + size)` to `[hpa, hpa + size)` with `rights`.
    ///
    /// Existing translations in the range are replaced.
    pub fn add_mr(&self, hpa: Pa, gpa: Gpa, size: usize, rights: EptRights) -> HvResult {
        Self::check_range(gpa, size)?;
        Self::check_hpa(hpa, size)?;
        log::trace!("ept: map {:?} -> {:?} 0x{:x} {:?}", gpa, hpa, size, rights);
        let op = Op::Map {
            gpa: gpa.into_usize(),
            hpa: hpa.into_usize(),
            rights,
        };
        let start = gpa.into_usize();
        self.update(self.root, ROOT_LEVEL, start, start + size, &op)
            .map(|_| ())
    }

    /// Map the 4 KiB page at `gpa` to `hpa` unless a translation of it
    /// exists already.
    ///
    /// Returns false, leaving the table as it was, if one does. Of several
    /// vcpus racing on the same page exactly one gets true.
    pub fn map_page_if_absent(&self, hpa: Pa, gpa: Gpa, rights: EptRights) -> HvResult<bool> {
        Self::check_range(gpa, PAGE_SIZE)?;
        Self::check_hpa(hpa, PAGE_SIZE)?;
        let addr = gpa.into_usize();
        let mut table_pa = self.root;
        for level in (2..=ROOT_LEVEL).rev() {
            let table = self.table(table_pa).ok_or(HvError::Fault)?;
            let slot = &table[(addr >> shift(level)) & 511];
            let cur = slot.load(Ordering::Acquire);
            if cur != 0 && is_leaf(cur, level) {
                return Ok(false);
            }
            table_pa = self.descend(slot, level)?;
        }
        let table = self.table(table_pa).ok_or(HvError::Fault)?;
        let slot = &table[(addr >> shift(1)) & 511];
        Ok(slot
            .compare_exchange(
                0,
                hpa.into_usize() as u64 | rights.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok())
    }

    /// Remove the translations of `[gpa, gpa + size)` and free the tables
    /// left empty.
    pub fn del_mr(&self, gpa: Gpa, size: usize) -> HvResult {
        Self::check_range(gpa, size)?;
        log::trace!("ept: unmap {:?} 0x{:x}", gpa, size);
        let start = gpa.into_usize();
        self.update(self.root, ROOT_LEVEL, start, start + size, &Op::Unmap)
            .map(|_| ())
    }

    /// Set the `set` bits and clear the `clear` bits on the leaves mapping
    /// `[gpa, gpa + size)`. Holes in the range are skipped.
    pub fn modify_mr(&self, gpa: Gpa, size: usize, set: EptRights, clear: EptRights) -> HvResult {
        Self::check_range(gpa, size)?;
        let start = gpa.into_usize();
        self.update(
            self.root,
            ROOT_LEVEL,
            start,
            start + size,
            &Op::Modify { set, clear },
        )
        .map(|_| ())
    }

    // Returns true if the table is empty afterwards.
    fn update(&self, table_pa: Pa, level: usize, start: usize, end: usize, op: &Op) -> HvResult<bool> {
        let table = self.table(table_pa).ok_or(HvError::Fault)?;
        let size = 1usize << shift(level);
        let mut addr = start;
        while addr < end {
            let slot = &table[(addr >> shift(level)) & 511];
            let entry_start = addr & !(size - 1);
            let chunk_end = end.min(entry_start + size);
            let whole = addr == entry_start && chunk_end == entry_start + size;
            let cur = slot.load(Ordering::Acquire);

            match op {
                Op::Map { gpa, hpa, rights } => {
                    let target = hpa + (addr - gpa);
                    if whole && self.policy.allows(level) && target & (size - 1) == 0 {
                        let large = if level > 1 { ENTRY_LARGE } else { 0 };
                        slot.store(target as u64 | rights.bits() | large, Ordering::Release);
                        if cur != 0 && !is_leaf(cur, level) {
                            self.free_table(Self::child(cur)?, level - 1);
                        }
                    } else {
                        let child = self.descend(slot, level)?;
                        self.update(child, level - 1, addr, chunk_end, op)?;
                    }
                }
                Op::Unmap | Op::Modify { .. } if cur == 0 => (),
                Op::Unmap => {
                    if whole && is_leaf(cur, level) {
                        slot.store(0, Ordering::Release);
                    } else {
                        let child = self.descend(slot, level)?;
                        if self.update(child, level - 1, addr, chunk_end, op)? {
                            slot.store(0, Ordering::Release);
                            self.release(child);
                        }
                    }
                }
                Op::Modify { set, clear } => {
                    if whole && is_leaf(cur, level) {
                        let rights = (EptRights::from_bits_truncate(cur) - *clear) | *set;
                        slot.store((cur & !ENTRY_FLAGS_MASK) | rights.bits(), Ordering::Release);
                    } else {
                        let child = self.descend(slot, level)?;
                        self.update(child, level - 1, addr, chunk_end, op)?;
                    }
                }
            }
            addr = chunk_end;
        }
        Ok(table.iter().all(|e| e.load(Ordering::Acquire) == 0))
    }

    // Next-level table under `slot`, installing an empty one or splitting a
    // large leaf into one when needed.
    fn descend(&self, slot: &AtomicU64, level: usize) -> HvResult<Pa> {
        loop {
            let cur = slot.load(Ordering::Acquire);
            if cur != 0 && !is_leaf(cur, level) {
                return Self::child(cur);
            }
            let new = match self.pool.try_alloc_page() {
                Some(pa) => pa,
                None => hv_result_err!(OutOfMemory, "ept table pool exhausted"),
            };
            let table = self.table(new).ok_or(HvError::Fault)?;
            if cur != 0 {
                let child_size = 1u64 << shift(level - 1);
                let base = cur & ENTRY_ADDR_MASK;
                let large = if level - 1 > 1 { ENTRY_LARGE } else { 0 };
                for (i, e) in table.iter().enumerate() {
                    e.store(
                        (base + i as u64 * child_size) | (cur & ENTRY_FLAGS_MASK) | large,
                        Ordering::Relaxed,
                    );
                }
            }
            match slot.compare_exchange(
                cur,
                new.into_usize() as u64 | TABLE_RIGHTS,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(new),
                // Another vcpu installed a table first.
                Err(_) => self.release(new),
            }
        }
    }

    fn release(&self, pa: Pa) {
        if let Err(e) = self.pool.free_page(pa) {
            log::warn!("ept: failed to free table {:?}: {:?}", pa, e);
        }
    }

    fn free_table(&self, pa: Pa, level: usize) {
        if level > 1 {
            if let Some(table) = self.table(pa) {
                for e in table.iter() {
                    let entry = e.load(Ordering::Acquire);
                    if entry != 0 && !is_leaf(entry, level) {
                        if let Ok(child) = Self::child(entry) {
                            self.free_table(child, level - 1);
                        }
                    }
                }
            }
        }
        self.release(pa);
    }

    /// Walk the table for `gpa`.
    ///
    /// Returns the host physical address, the rights of the leaf and the size
    /// of the page that maps it.
    pub fn walk(&self, gpa: Gpa) -> Option<(Pa, EptRights, usize)> {
        let gpa = gpa.into_usize();
        let mut table_pa = self.root;
        let mut level = ROOT_LEVEL;
        loop {
            let entry = self.table(table_pa)?[(gpa >> shift(level)) & 511].load(Ordering::Acquire);
            if !is_present(entry) {
                return None;
            }
            if is_leaf(entry, level) {
                let size = 1usize << shift(level);
                let base = (entry & ENTRY_ADDR_MASK) as usize & !(size - 1);
                return Some((
                    Pa::new(base + (gpa & (size - 1)))?,
                    EptRights::from_bits_truncate(entry),
                    size,
                ));
            }
            table_pa = Self::child(entry).ok()?;
            level -= 1;
        }
    }

    /// Translate `gpa`, if mapped.
    #[inline]
    pub fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa> {
        self.walk(gpa).map(|(pa, _, _)| pa)
    }
}

impl Drop for Ept {
    fn drop(&mut self) {
        self.free_table(self.root, ROOT_LEVEL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abyss::addressing::LARGE_PAGE_SIZE_2M;
    use kecore::mm::PoolRegion;

    fn gpa(v: usize) -> Gpa {
        Gpa::new(v).unwrap()
    }

    fn pa(v: usize) -> Pa {
        Pa::new(v).unwrap()
    }

    fn ept(policy: LargePagePolicy) -> (Arc<PagePool>, Ept) {
        let pool = Arc::new(PagePool::new(PoolRegion::host_backed(64)));
        let ept = Ept::new(pool.clone(), policy);
        (pool, ept)
    }

    #[test]
    fn map_walk_unmap() {
        let (pool, ept) = ept(LargePagePolicy::none());
        let rw = EptRights::READ | EptRights::WRITE;
        ept.add_mr(pa(0x200000), gpa(0x100000), 0x100000, rw).unwrap();
        assert_eq!(
            ept.walk(gpa(0x180000)),
            Some((pa(0x280000), rw, PAGE_SIZE))
        );
        for off in (0..0x100000).step_by(PAGE_SIZE) {
            assert_eq!(ept.gpa2hpa(gpa(0x100000 + off)), Some(pa(0x200000 + off)));
        }
        assert_eq!(ept.gpa2hpa(gpa(0x200000)), None);

        ept.del_mr(gpa(0x100000), 0x100000).unwrap();
        assert_eq!(ept.walk(gpa(0x180000)), None);
        assert_eq!(pool.live_pages(), 1);
    }

    #[test]
    fn remap_updates_in_place() {
        let (pool, ept) = ept(LargePagePolicy::none());
        ept.add_mr(pa(0x10_0000), gpa(0x4000), 0x2000, EptRights::READ)
            .unwrap();
        let tables = pool.live_pages();
        ept.add_mr(pa(0x20_0000), gpa(0x4000), 0x2000, EptRights::RWX | EptRights::MT_WB)
            .unwrap();
        assert_eq!(pool.live_pages(), tables);
        let (hpa, rights, _) = ept.walk(gpa(0x5000)).unwrap();
        assert_eq!(hpa, pa(0x20_1000));
        assert_eq!(rights, EptRights::RWX | EptRights::MT_WB);
    }

    #[test]
    fn large_pages_split_on_partial_change() {
        let (pool, ept) = ept(LargePagePolicy::from_ept_vpid_cap(1 << 16));
        let rights = EptRights::RWX | EptRights::MT_WB;
        ept.add_mr(pa(0x4000_0000), gpa(0), 2 * LARGE_PAGE_SIZE_2M, rights)
            .unwrap();
        assert_eq!(
            ept.walk(gpa(0x1234)),
            Some((pa(0x4000_1234), rights, LARGE_PAGE_SIZE_2M))
        );
        // Root, PDPT and PD only.
        assert_eq!(pool.live_pages(), 3);

        ept.del_mr(gpa(0x1000), PAGE_SIZE).unwrap();
        assert_eq!(ept.walk(gpa(0x1000)), None);
        assert_eq!(ept.walk(gpa(0x2000)), Some((pa(0x4000_2000), rights, PAGE_SIZE)));
        assert_eq!(pool.live_pages(), 4);

        ept.modify_mr(gpa(LARGE_PAGE_SIZE_2M), LARGE_PAGE_SIZE_2M, EptRights::empty(), EptRights::WRITE)
            .unwrap();
        let (_, r, size) = ept.walk(gpa(LARGE_PAGE_SIZE_2M)).unwrap();
        assert_eq!(r, EptRights::READ | EptRights::EXECUTE | EptRights::MT_WB);
        assert_eq!(size, LARGE_PAGE_SIZE_2M);

        ept.del_mr(gpa(0), 2 * LARGE_PAGE_SIZE_2M).unwrap();
        assert_eq!(pool.live_pages(), 1);
    }

    #[test]
    fn misaligned_ranges_are_rejected() {
        let (pool, ept) = ept(LargePagePolicy::none());
        assert_eq!(
            ept.add_mr(pa(0x1000), gpa(0x1800), PAGE_SIZE, EptRights::READ),
            Err(HvError::InvalidArgument)
        );
        assert_eq!(
            ept.add_mr(pa(0x1010), gpa(0x1000), PAGE_SIZE, EptRights::READ),
            Err(HvError::InvalidArgument)
        );
        assert_eq!(ept.del_mr(gpa(0x1000), 0), Err(HvError::InvalidArgument));
        // Host frames beyond the 52-bit address field.
        assert_eq!(
            ept.add_mr(pa(1 << 52), gpa(0x1000), PAGE_SIZE, EptRights::READ),
            Err(HvError::OutOfRange)
        );
        assert_eq!(
            ept.add_mr(pa((1 << 52) - PAGE_SIZE), gpa(0x1000), 2 * PAGE_SIZE, EptRights::READ),
            Err(HvError::OutOfRange)
        );
        assert_eq!(ept.walk(gpa(0x1000)), None);
        assert_eq!(pool.live_pages(), 1);
    }

    #[test]
    fn racing_single_page_maps_keep_the_first() {
        let (pool, ept) = ept(LargePagePolicy::none());
        let wins: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8usize)
                .map(|t| {
                    let ept = &ept;
                    s.spawn(move || {
                        let hpa = pa(0x8000_0000 + t * PAGE_SIZE);
                        ept.map_page_if_absent(hpa, gpa(0x5000), EptRights::RWX).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let winner = wins.iter().position(|w| *w).unwrap();
        assert_eq!(wins.iter().filter(|w| **w).count(), 1);
        assert_eq!(ept.gpa2hpa(gpa(0x5000)), Some(pa(0x8000_0000 + winner * PAGE_SIZE)));
        // Root plus one table per lower level.
        assert_eq!(pool.live_pages(), 4);
    }

    #[test]
    fn single_page_map_respects_large_leaves() {
        let (_pool, ept) = ept(LargePagePolicy {
            pages_2m: true,
            pages_1g: false,
        });
        ept.add_mr(pa(0x20_0000), gpa(0x20_0000), LARGE_PAGE_SIZE_2M, EptRights::READ)
            .unwrap();
        assert_eq!(
            ept.map_page_if_absent(pa(0x9000), gpa(0x20_1000), EptRights::RWX),
            Ok(false)
        );
        assert_eq!(ept.gpa2hpa(gpa(0x20_1000)), Some(pa(0x20_1000)));
    }

    #[test]
    fn concurrent_demand_mapping_shares_tables() {
        let (pool, ept) = ept(LargePagePolicy::none());
        std::thread::scope(|s| {
            for t in 0..4usize {
                let ept = &ept;
                s.spawn(move || {
                    for i in 0..16usize {
                        let page = (t * 16 + i) * PAGE_SIZE;
                        ept.add_mr(pa(0x8000_0000 + page), gpa(page), PAGE_SIZE, EptRights::RWX)
                            .unwrap();
                    }
                });
            }
        });
        for page in (0..64 * PAGE_SIZE).step_by(PAGE_SIZE) {
            assert_eq!(ept.gpa2hpa(gpa(page)), Some(pa(0x8000_0000 + page)));
        }
        assert_eq!(pool.live_pages(), 4);
    }

    #[test]
    fn eptp_encodes_walk_and_memory_type() {
        let (_pool, ept) = ept(LargePagePolicy::none());
        assert_eq!(ept.eptp() & 0xfff, 0x1e);
        assert_eq!(ept.eptp() & !0xfff, ept.root().into_usize() as u64);
    }
}
