//! Virtual machine interface.
use crate::{
    config::{MemRegionKind, VmConfig, VmType},
    ept::{Ept, EptRights},
    io::IoHandlers,
    vcpu::{PendingRequest, Vcpu},
    ve820::{self, E820Entry},
};
use abyss::addressing::{Pa, PAGE_MASK};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU8, Ordering};
use kecore::{mm::PagePool, HvResult};

/// Guest virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Gva(usize);

impl Gva {
    /// Create a new virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Gpa(usize);

impl Gpa {
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

    /// Round down to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }
}

abyss::impl_address_arith!(Gva);
abyss::impl_address_arith!(Gpa);

impl core::fmt::Debug for Gva {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gva(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

impl core::fmt::Display for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Lifecycle state of a vm.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::TryFromPrimitive)]
pub enum VmState {
    /// Built, vcpus not yet started.
    Created = 0,
    /// Vcpus are launched.
    Started = 1,
    /// Vcpus are parked until resumed.
    Paused = 2,
    /// Shut down; the vm only waits for its removal.
    PoweredOff = 3,
}

/// The virtual machine.
pub struct Vm {
    config: VmConfig,
    ept: Ept,
    vcpus: Vec<Arc<Vcpu>>,
    io: IoHandlers,
    e820: Vec<E820Entry>,
    state: AtomicU8,
}

impl Vm {
    pub(crate) fn new(config: VmConfig, ept: Ept, vcpus: Vec<Arc<Vcpu>>) -> Self {
        let e820 = ve820::build(&config);
        Self {
            config,
            ept,
            vcpus,
            io: IoHandlers::new(),
            e820,
            state: AtomicU8::new(VmState::Created as u8),
        }
    }

    /// Id of this vm.
    #[inline]
    pub fn id(&self) -> u16 {
        self.config.id
    }

    /// Static configuration this vm was built from.
    #[inline]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Returns true if this is the service vm.
    #[inline]
    pub fn is_service_vm(&self) -> bool {
        self.config.vm_type == VmType::Service
    }

    /// Severity used to decide escalation of fatal errors.
    #[inline]
    pub fn severity(&self) -> u8 {
        self.config.severity
    }

    /// Second-level page table of this vm.
    #[inline]
    pub fn ept(&self) -> &Ept {
        &self.ept
    }

    /// Virtual cpus of this vm.
    #[inline]
    pub fn vcpus(&self) -> &[Arc<Vcpu>] {
        &self.vcpus
    }

    /// Get vcpu #idx.
    #[inline]
    pub fn vcpu(&self, idx: usize) -> Option<&Arc<Vcpu>> {
        self.vcpus.get(idx)
    }

    /// Emulated port and mmio devices.
    #[inline]
    pub fn io(&self) -> &IoHandlers {
        &self.io
    }

    /// Guest memory map.
    #[inline]
    pub fn e820(&self) -> &[E820Entry] {
        &self.e820
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VmState {
        VmState::try_from(self.state.load(Ordering::SeqCst)).unwrap_or(VmState::PoweredOff)
    }

    pub(crate) fn set_state(&self, state: VmState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Build the static part of the guest physical address space.
    ///
    /// RAM is mapped write-back, device memory uncached. Passthrough BARs
    /// appear at their host address in the service vm, whose drivers program
    /// devices with host physical addresses, and at the configured guest
    /// address elsewhere. Lazily mapped RAM is left to the EPT violation path.
    pub(crate) fn setup_memory(&self) -> HvResult {
        for region in self.config.memory.iter() {
            let rights = match region.kind {
                MemRegionKind::Ram => EptRights::RWX | EptRights::MT_WB,
                MemRegionKind::Mmio => EptRights::READ | EptRights::WRITE,
                MemRegionKind::LazyRam => continue,
            };
            self.ept
                .add_mr(region.start_hpa, region.gpa, region.size, rights)?;
        }
        for dev in self.config.pt_devices.iter() {
            for bar in dev.bars.iter() {
                let gpa = if self.is_service_vm() {
                    Gpa::new(bar.hpa.into_usize()).unwrap_or(bar.gpa)
                } else {
                    bar.gpa
                };
                log::debug!(
                    "VM{}: passthrough {} bar {:?} -> {:?}",
                    self.id(),
                    dev.pbdf,
                    gpa,
                    bar.hpa
                );
                self.ept
                    .add_mr(bar.hpa, gpa, bar.size, EptRights::READ | EptRights::WRITE)?;
            }
        }
        Ok(())
    }

    /// Returns true if `gpa` lies in a lazily mapped RAM region.
    pub fn is_lazy_ram(&self, gpa: Gpa) -> bool {
        self.config.memory.iter().any(|r| {
            r.kind == MemRegionKind::LazyRam && gpa >= r.gpa && gpa < r.gpa + r.size
        })
    }

    /// Returns true if `[gpa, gpa + size)` meets a lazily mapped RAM region.
    pub fn overlaps_lazy_ram(&self, gpa: Gpa, size: usize) -> bool {
        let (start, end) = (gpa.into_usize(), gpa.into_usize().saturating_add(size));
        self.config.memory.iter().any(|r| {
            let r_start = r.gpa.into_usize();
            r.kind == MemRegionKind::LazyRam && start < r_start + r.size && r_start < end
        })
    }

    /// Make every vcpu drop its EPT-derived translations before it enters
    /// again. The caller kicks the pCPUs of the vcpus.
    pub fn request_ept_flush(&self) {
        for vcpu in self.vcpus.iter() {
            vcpu.make_request(PendingRequest::EPT_FLUSH);
        }
    }

    /// Back the page of `gpa` with a page of `pool`, unless another vcpu did
    /// so first. Returns the page this call mapped.
    ///
    /// An exhausted pool backs the page with its dummy page.
    pub fn map_lazy_page(&self, pool: &PagePool, gpa: Gpa) -> HvResult<Option<Pa>> {
        let page = gpa.page_down();
        if self.ept.walk(page).is_some() {
            return Ok(None);
        }
        let hpa = pool.alloc_page_or_dummy();
        if pool.is_dummy(hpa) {
            log::warn!("VM{}: {:?} backed by the dummy page", self.id(), page);
        }
        match self
            .ept
            .map_page_if_absent(hpa, page, EptRights::RWX | EptRights::MT_WB)
        {
            Ok(true) => {
                log::trace!("VM{}: lazy map {:?} -> {:?}", self.id(), page, hpa);
                Ok(Some(hpa))
            }
            Ok(false) => {
                pool.free_page(hpa)?;
                Ok(None)
            }
            Err(e) => {
                pool.free_page(hpa)?;
                Err(e)
            }
        }
    }

    /// Host physical address backing `gpa`, if mapped.
    #[inline]
    pub fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa> {
        self.ept.walk(gpa).map(|(hpa, _, _)| hpa)
    }
}
