//! Boot information.
//!
//! The loader hands the hypervisor a multiboot2 information block and a
//! command line. [`multiboot`] turns the block into a [`BootInfo`];
//! [`cmdline`] extracts the debug options from the command line.

pub mod cmdline;
pub mod multiboot;

use crate::addressing::Pa;
use alloc::{string::String, vec::Vec};
use core::ops::Range;

/// A physically contigous memory region.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Region {
    pub addr: Range<Pa>,
    pub usable: bool,
}

impl Region {
    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.addr.end.into_usize() - self.addr.start.into_usize()
    }
}

/// A module loaded by the boot loader, such as a guest kernel image.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Module {
    pub addr: Range<Pa>,
    pub name: String,
}

/// What the boot loader told us.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BootInfo {
    pub cmdline: String,
    pub modules: Vec<Module>,
    /// Sorted by address. Adjacent regions of the same kind are merged.
    pub regions: Vec<Region>,
}

impl BootInfo {
    /// Iterate over the usable memory regions.
    pub fn usable(&self) -> impl Iterator<Item = &Region> + '_ {
        self.regions.iter().filter(|r| r.usable)
    }
}

/// Sort `regions` by start address and merge adjacent regions of the same kind.
pub fn normalize_regions(mut regions: Vec<Region>) -> Vec<Region> {
    regions.retain(|r| r.addr.start < r.addr.end);
    regions.sort_unstable_by(|a, b| a.addr.start.cmp(&b.addr.start));

    let mut merged: Vec<Region> = Vec::with_capacity(regions.len());
    for region in regions {
        match merged.last_mut() {
            // If mergable, extend end.
            Some(last) if last.addr.end == region.addr.start && last.usable == region.usable => {
                last.addr.end = region.addr.end;
            }
            _ => merged.push(region),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: usize, end: usize, usable: bool) -> Region {
        Region {
            addr: Pa::new(start).unwrap()..Pa::new(end).unwrap(),
            usable,
        }
    }

    #[test]
    fn merges_adjacent_regions_of_same_kind() {
        let merged = normalize_regions(vec![
            region(0x10_0000, 0x20_0000, true),
            region(0x0, 0x9_f000, true),
            region(0x20_0000, 0x40_0000, true),
            region(0x40_0000, 0x41_0000, false),
            region(0x50_0000, 0x50_0000, true),
        ]);
        assert_eq!(
            merged,
            vec![
                region(0x0, 0x9_f000, true),
                region(0x10_0000, 0x40_0000, true),
                region(0x40_0000, 0x41_0000, false),
            ]
        );
        assert_eq!(merged[1].size(), 0x30_0000);
    }
}
