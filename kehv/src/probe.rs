//! Access to guest memory from the host.
use crate::{
    ept::Ept,
    vm::{Gpa, Gva},
    vmcs::{Field, VmcsAccess},
    VmError,
};
use abyss::{
    addressing::{Pa, PhysMapper, Va, PAGE_SIZE},
    x86_64::{Cr0, Cr4, Efer},
};

/// Traits to probe vcpu internal state.
pub trait Probe {
    /// Translate guest physical address to host physical address
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa>;
    /// Translate guest virtual address to guest physical address
    fn gva2gpa(&self, gva: Gva) -> Option<Gpa>;
    /// Translate host physical address to host virtual address
    fn hpa2hva(&self, hpa: Pa) -> Option<Va>;

    /// Translate guest physical address to host virtual address
    #[inline]
    fn gpa2hva(&self, gpa: Gpa) -> Option<Va> {
        self.hpa2hva(self.gpa2hpa(gpa)?)
    }

    /// Translate guest virtual address to host virtual address
    #[inline]
    fn gva2hva(&self, gva: Gva) -> Option<Va> {
        self.gpa2hva(self.gva2gpa(gva)?)
    }

    /// Copy guest physical memory at `gpa` into `buf`.
    fn copy_from_guest(&self, gpa: Gpa, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let at = gpa + done;
            let len = (PAGE_SIZE - (at.into_usize() & (PAGE_SIZE - 1))).min(buf.len() - done);
            let va = self.gpa2hva(at).ok_or(VmError::GuestMemoryFault(at))?;
            // Safety: the translation maps a whole guest page and `len` stays
            // within it.
            unsafe {
                core::ptr::copy_nonoverlapping(va.as_ptr::<u8>(), buf[done..].as_mut_ptr(), len)
            };
            done += len;
        }
        Ok(())
    }

    /// Copy `buf` into guest physical memory at `gpa`.
    fn copy_to_guest(&self, gpa: Gpa, buf: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let at = gpa + done;
            let len = (PAGE_SIZE - (at.into_usize() & (PAGE_SIZE - 1))).min(buf.len() - done);
            let va = self.gpa2hva(at).ok_or(VmError::GuestMemoryFault(at))?;
            // Safety: as in `copy_from_guest`.
            unsafe {
                core::ptr::copy_nonoverlapping(buf[done..].as_ptr(), va.as_mut_ptr::<u8>(), len)
            };
            done += len;
        }
        Ok(())
    }

    /// Copy guest virtual memory at `gva` into `buf`.
    fn copy_from_guest_va(&self, gva: Gva, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let at = gva + done;
            let len = (PAGE_SIZE - (at.into_usize() & (PAGE_SIZE - 1))).min(buf.len() - done);
            let gpa = self.gva2gpa(at).ok_or_else(|| {
                Gpa::new(at.into_usize() & 0x0000_ffff_ffff_ffff)
                    .map_or(VmError::FailedToDecodeInstruction, VmError::GuestMemoryFault)
            })?;
            self.copy_from_guest(gpa, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }
}

/// Paging state of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestPaging {
    /// Guest CR0.
    pub cr0: Cr0,
    /// Guest CR3.
    pub cr3: u64,
    /// Guest CR4.
    pub cr4: Cr4,
    /// Guest IA32_EFER.
    pub efer: Efer,
}

impl GuestPaging {
    /// Paging state saved in `vmcs`.
    pub fn from_vmcs(vmcs: &dyn VmcsAccess) -> Result<Self, VmError> {
        Ok(Self {
            cr0: Cr0::from_bits_truncate(vmcs.read(Field::GuestCr0)?),
            cr3: vmcs.read(Field::GuestCr3)?,
            cr4: Cr4::from_bits_truncate(vmcs.read(Field::GuestCr4)?),
            efer: Efer::from_bits_truncate(vmcs.read(Field::GuestIa32Efer)?),
        })
    }
}

const PTE_PRESENT: u64 = 1 << 0;
const PTE_PS: u64 = 1 << 7;
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Probe over the EPT of a vm and the paging state of one of its vcpus.
///
/// Guest virtual addresses are translated when paging is off (identity) and
/// in 4-level long mode paging.
pub struct GuestProbe<'a> {
    ept: &'a Ept,
    mem: &'a dyn PhysMapper,
    paging: GuestPaging,
}

impl<'a> GuestProbe<'a> {
    /// Create a new probe.
    pub fn new(ept: &'a Ept, mem: &'a dyn PhysMapper, paging: GuestPaging) -> Self {
        Self { ept, mem, paging }
    }

    fn read_u64(&self, gpa: Gpa) -> Option<u64> {
        let va = self.gpa2hva(gpa)?;
        // Safety: guest page table entries are naturally aligned and the
        // translation maps the whole page.
        Some(unsafe { core::ptr::read_volatile(va.as_ptr::<u64>()) })
    }
}

impl Probe for GuestProbe<'_> {
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa> {
        self.ept.gpa2hpa(gpa)
    }

    fn hpa2hva(&self, hpa: Pa) -> Option<Va> {
        self.mem.pa_to_va(hpa)
    }

    fn gva2gpa(&self, gva: Gva) -> Option<Gpa> {
        let gva = gva.into_usize();
        if !self.paging.cr0.contains(Cr0::PG) {
            return Gpa::new(gva);
        }
        if !self.paging.efer.contains(Efer::LMA) {
            log::debug!("guest walk: only long mode paging is supported");
            return None;
        }
        let mut table = self.paging.cr3 & PTE_ADDR_MASK;
        for level in (1..=4).rev() {
            let shift = 12 + 9 * (level - 1);
            let index = (gva >> shift) & 511;
            let entry = self.read_u64(Gpa::new(table as usize + index * 8)?)?;
            if entry & PTE_PRESENT == 0 {
                return None;
            }
            if level == 1 || ((level == 2 || level == 3) && entry & PTE_PS != 0) {
                let size = 1usize << shift;
                let base = (entry & PTE_ADDR_MASK) as usize & !(size - 1);
                return Gpa::new(base | (gva & (size - 1)));
            }
            table = entry & PTE_ADDR_MASK;
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ept::{EptRights, LargePagePolicy};
    use alloc::sync::Arc;
    use kecore::mm::{PagePool, PoolRegion};

    /// Guest RAM backed by pool pages, mapped at consecutive guest pages.
    pub(crate) struct GuestRam {
        pub(crate) ram: Arc<PagePool>,
        pub(crate) ept: Ept,
    }

    impl GuestRam {
        pub(crate) fn new(pages: usize) -> Self {
            let tables = Arc::new(PagePool::new(PoolRegion::host_backed(16)));
            let ram = Arc::new(PagePool::new(PoolRegion::host_backed(pages)));
            let ept = Ept::new(tables, LargePagePolicy::none());
            for i in 0..pages {
                let hpa = ram.alloc_page();
                ept.add_mr(hpa, Gpa::new(i * PAGE_SIZE).unwrap(), PAGE_SIZE, EptRights::RWX | EptRights::MT_WB)
                    .unwrap();
            }
            Self { ram, ept }
        }

        pub(crate) fn probe(&self, paging: GuestPaging) -> GuestProbe<'_> {
            GuestProbe::new(&self.ept, &*self.ram, paging)
        }
    }

    pub(crate) fn flat() -> GuestPaging {
        GuestPaging {
            cr0: Cr0::PE,
            cr3: 0,
            cr4: Cr4::empty(),
            efer: Efer::empty(),
        }
    }

    #[test]
    fn copies_cross_pages() {
        let guest = GuestRam::new(2);
        let probe = guest.probe(flat());
        let data: alloc::vec::Vec<u8> = (0..32).collect();
        let at = Gpa::new(PAGE_SIZE - 16).unwrap();
        probe.copy_to_guest(at, &data).unwrap();
        let mut back = [0u8; 32];
        probe.copy_from_guest(at, &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);

        let outside = Gpa::new(2 * PAGE_SIZE - 8).unwrap();
        assert_eq!(
            probe.copy_from_guest(outside, &mut back),
            Err(VmError::GuestMemoryFault(Gpa::new(2 * PAGE_SIZE).unwrap()))
        );
    }

    #[test]
    fn long_mode_walk() {
        let guest = GuestRam::new(8);
        let flat_probe = guest.probe(flat());
        // PML4 at 0x1000, PDPT at 0x2000, PD at 0x3000, PT at 0x4000.
        let entries = [
            (0x1000, 0x2000 | 3),
            (0x2000, 0x3000 | 3),
            (0x3000, 0x4000 | 3),
            // gva 0x5000 -> gpa 0x7000
            (0x4000 + 5 * 8, 0x7000 | 3),
            // gva 0x20_0000 is a 2 MiB page at gpa 0
            (0x3000 + 8, PTE_PS | 3),
        ];
        for (at, v) in entries {
            flat_probe
                .copy_to_guest(Gpa::new(at).unwrap(), &v.to_le_bytes())
                .unwrap();
        }
        let paging = GuestPaging {
            cr0: Cr0::PE | Cr0::PG,
            cr3: 0x1000,
            cr4: Cr4::PAE,
            efer: Efer::LME | Efer::LMA,
        };
        let probe = guest.probe(paging);
        assert_eq!(
            probe.gva2gpa(Gva::new(0x5123).unwrap()),
            Gpa::new(0x7123)
        );
        assert_eq!(
            probe.gva2gpa(Gva::new(0x20_0456).unwrap()),
            Gpa::new(0x456)
        );
        assert_eq!(probe.gva2gpa(Gva::new(0x6000).unwrap()), None);
    }
}
