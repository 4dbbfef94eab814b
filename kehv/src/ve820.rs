//! Guest physical memory map.
use crate::config::{MemRegionKind, VmConfig};
use alloc::vec::Vec;

/// Type of an e820 entry.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E820Type {
    /// Usable RAM.
    Ram = 1,
    /// Reserved, for device memory.
    Reserved = 2,
}

/// An entry of the guest e820 table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E820Entry {
    /// Guest physical base.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Type.
    pub kind: E820Type,
}

impl E820Entry {
    /// The 20-byte layout handed to the guest.
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0; 20];
        out[0..8].copy_from_slice(&self.base.to_le_bytes());
        out[8..16].copy_from_slice(&self.length.to_le_bytes());
        out[16..20].copy_from_slice(&(self.kind as u32).to_le_bytes());
        out
    }
}

/// Build the memory map of the vm described by `config`.
///
/// Entries are sorted by base; adjacent entries of the same type are merged.
pub fn build(config: &VmConfig) -> Vec<E820Entry> {
    let mut entries: Vec<E820Entry> = config
        .memory
        .iter()
        .map(|r| E820Entry {
            base: r.gpa.into_usize() as u64,
            length: r.size as u64,
            kind: match r.kind {
                MemRegionKind::Ram | MemRegionKind::LazyRam => E820Type::Ram,
                MemRegionKind::Mmio => E820Type::Reserved,
            },
        })
        .chain(
            config
                .pt_devices
                .iter()
                .flat_map(|d| d.bars.iter())
                .map(|b| E820Entry {
                    base: b.gpa.into_usize() as u64,
                    length: b.size as u64,
                    kind: E820Type::Reserved,
                }),
        )
        .collect();
    entries.sort_unstable_by_key(|e| e.base);

    let mut merged: Vec<E820Entry> = Vec::with_capacity(entries.len());
    for e in entries {
        match merged.last_mut() {
            Some(last) if last.kind == e.kind && last.base + last.length == e.base => {
                last.length += e.length
            }
            _ => merged.push(e),
        }
    }
    merged
}
