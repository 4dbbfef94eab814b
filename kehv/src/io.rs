//! Emulated port and memory-mapped devices of a vm.
//!
//! Device models register a handler for a port range or a guest physical
//! range. The ranges are kept in ordered maps keyed by intervals whose
//! ordering treats overlapping intervals as equal, so a lookup with a one-byte
//! interval finds the covering range and a registration that overlaps an
//! existing one is refused.
use crate::vm::Gpa;
use alloc::{
    collections::btree_map::{BTreeMap, Entry},
    sync::Arc,
};
use core::cmp::Ordering;
use kecore::{hv_result_err, HvResult};
use spin_lock::SpinLock;

/// Handler of a port range.
pub trait PioHandler
where
    Self: Send + Sync,
{
    /// Read `size` bytes from `port`.
    fn read(&self, port: u16, size: u8) -> u32;
    /// Write the low `size` bytes of `value` to `port`.
    fn write(&self, port: u16, size: u8, value: u32);
}

/// Handler of a guest physical range.
pub trait MmioHandler
where
    Self: Send + Sync,
{
    /// Read `size` bytes at `gpa`.
    fn read(&self, gpa: Gpa, size: u8) -> u64;
    /// Write the low `size` bytes of `value` at `gpa`.
    fn write(&self, gpa: Gpa, size: u8, value: u64);
}

/// Representation of a port interval.
#[derive(Eq, Clone, Copy)]
pub struct PioRegion {
    // [start, end)
    start: u32,
    end: u32,
}

impl PioRegion {
    /// Create a new PioRegion.
    #[inline(always)]
    pub fn new(port: u16, size: u16) -> Self {
        Self {
            start: port as u32,
            end: port as u32 + size as u32,
        }
    }
}

impl core::fmt::Debug for PioRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        write!(f, "PioRegion[0x{:x}, 0x{:x})", self.start, self.end)
    }
}

impl Ord for PioRegion {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.start < other.end && self.end > other.start {
            Ordering::Equal
        } else {
            self.start.cmp(&other.start)
        }
    }
}

impl PartialOrd for PioRegion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PioRegion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

/// Representation of a guest physical interval.
#[derive(Eq, Clone, Copy)]
pub struct MmioRegion {
    // [start, end)
    start: Gpa,
    end: Gpa,
}

impl MmioRegion {
    /// Create a new MmioRegion.
    #[inline(always)]
    pub fn new(gpa: Gpa, size: usize) -> Self {
        Self {
            start: gpa,
            end: gpa + size,
        }
    }
}

impl core::fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        write!(f, "MmioRegion[{:?}, {:?})", self.start, self.end)
    }
}

impl Ord for MmioRegion {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.start < other.end && self.end > other.start {
            Ordering::Equal
        } else {
            self.start.cmp(&other.start)
        }
    }
}

impl PartialOrd for MmioRegion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MmioRegion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

/// The device handlers of a vm.
#[derive(Default)]
pub struct IoHandlers {
    pio: SpinLock<BTreeMap<PioRegion, Arc<dyn PioHandler>>>,
    mmio: SpinLock<BTreeMap<MmioRegion, Arc<dyn MmioHandler>>>,
}

impl IoHandlers {
    /// No devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `[port, port + size)` to `handler`.
    pub fn register_pio(&self, port: u16, size: u16, handler: Arc<dyn PioHandler>) -> HvResult {
        let region = PioRegion::new(port, size);
        if size == 0 {
            hv_result_err!(InvalidArgument, "empty {:?}", region);
        }
        match self.pio.lock().entry(region) {
            Entry::Occupied(_) => hv_result_err!(AlreadyExists, "overlapping {:?}", region),
            Entry::Vacant(v) => {
                v.insert(handler);
                Ok(())
            }
        }
    }

    /// Route `[gpa, gpa + size)` to `handler`.
    pub fn register_mmio(&self, gpa: Gpa, size: usize, handler: Arc<dyn MmioHandler>) -> HvResult {
        let region = MmioRegion::new(gpa, size);
        if size == 0 {
            hv_result_err!(InvalidArgument, "empty {:?}", region);
        }
        match self.mmio.lock().entry(region) {
            Entry::Occupied(_) => hv_result_err!(AlreadyExists, "overlapping {:?}", region),
            Entry::Vacant(v) => {
                v.insert(handler);
                Ok(())
            }
        }
    }

    /// Handler covering `port`.
    pub fn find_pio(&self, port: u16) -> Option<Arc<dyn PioHandler>> {
        self.pio.lock().get(&PioRegion::new(port, 1)).cloned()
    }

    /// Handler covering `gpa`.
    pub fn find_mmio(&self, gpa: Gpa) -> Option<Arc<dyn MmioHandler>> {
        self.mmio.lock().get(&MmioRegion::new(gpa, 1)).cloned()
    }
}
