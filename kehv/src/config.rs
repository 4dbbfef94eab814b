//! Static configuration of the virtual machines.
//!
//! The VM table is produced at build time for a board and consumed read-only
//! when the vms are created. [`HypervisorConfig::check`] rejects tables that
//! would break the isolation between vms before anything is built.
use crate::vm::Gpa;
use abyss::addressing::{Pa, PAGE_SIZE};
use alloc::{string::String, vec::Vec};
use kecore::{hv_result_err, HvResult};

/// Maximum number of vms.
pub const MAX_VM: usize = 8;
/// Maximum number of vcpus of a vm.
pub const MAX_VCPUS_PER_VM: usize = abyss::MAX_CPU;

/// Severity of a safety-critical vm.
pub const SEVERITY_SAFETY_VM: u8 = 0x40;
/// Severity of a real-time vm.
pub const SEVERITY_RTVM: u8 = 0x30;
/// Severity of the service vm.
pub const SEVERITY_SERVICE_VM: u8 = 0x20;
/// Severity of a standard vm.
pub const SEVERITY_STANDARD_VM: u8 = 0x10;

/// Kind of a vm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    /// Launched by the hypervisor at boot with statically partitioned
    /// resources.
    PreLaunched,
    /// The privileged vm that owns the remaining devices and launches
    /// post-launched vms.
    Service,
    /// Launched later on request of the service vm.
    PostLaunched,
}

/// Backing of a guest physical region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRegionKind {
    /// RAM mapped when the vm is created.
    Ram,
    /// RAM mapped page by page on first access.
    LazyRam,
    /// Passthrough device memory, mapped uncached.
    Mmio,
}

/// A guest physical region and its host backing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRegion {
    /// Host physical start. Unused for [`MemRegionKind::LazyRam`].
    pub start_hpa: Pa,
    /// Guest physical start.
    pub gpa: Gpa,
    /// Size in bytes.
    pub size: usize,
    /// Backing.
    pub kind: MemRegionKind,
}

/// Guest kernel image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelType {
    /// Linux bzImage.
    BzImage,
    /// Raw binary loaded and entered at fixed addresses.
    RawImage,
    /// ELF image.
    Elf,
}

/// How the guest os is booted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestOs {
    /// Image format.
    pub kernel_type: KernelType,
    /// Where the image is loaded.
    pub load_gpa: Gpa,
    /// Guest rip at the first entry.
    pub entry_gpa: Gpa,
    /// Kernel command line.
    pub bootargs: String,
}

/// PCI bus/device/function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bdf {
    /// Bus.
    pub bus: u8,
    /// Device, 5 bits.
    pub dev: u8,
    /// Function, 3 bits.
    pub func: u8,
}

impl core::fmt::Display for Bdf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.dev, self.func)
    }
}

/// An MMIO BAR of a passthrough device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciBar {
    /// Host physical base.
    pub hpa: Pa,
    /// Guest physical base for vms other than the service vm.
    pub gpa: Gpa,
    /// Size in bytes.
    pub size: usize,
}

/// A physical PCI device assigned to a vm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughDevice {
    /// Address seen by the guest.
    pub vbdf: Bdf,
    /// Address on the host.
    pub pbdf: Bdf,
    /// Memory BARs.
    pub bars: Vec<PciBar>,
}

/// A virtual 16550 assigned to a vm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualUart {
    /// ttyS index.
    pub index: u8,
    /// Base port.
    pub port_base: u16,
    /// Guest irq line.
    pub irq: u8,
}

/// CPUID bits hidden from a vm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuidMask {
    /// Leaf.
    pub leaf: u32,
    /// Subleaf.
    pub subleaf: u32,
    /// Bits cleared from eax.
    pub eax: u32,
    /// Bits cleared from ebx.
    pub ebx: u32,
    /// Bits cleared from ecx.
    pub ecx: u32,
    /// Bits cleared from edx.
    pub edx: u32,
}

/// Configuration of one vm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Index in the vm table.
    pub id: u16,
    /// Name.
    pub name: String,
    /// Kind.
    pub vm_type: VmType,
    /// Higher is more important. See `SEVERITY_*`.
    pub severity: u8,
    /// pCPUs of the vcpus, one vcpu per set bit.
    pub cpu_affinity: u64,
    /// Guest physical memory.
    pub memory: Vec<MemRegion>,
    /// Guest os.
    pub os: GuestOs,
    /// Passthrough devices.
    pub pt_devices: Vec<PassthroughDevice>,
    /// Virtual UARTs.
    pub vuarts: Vec<VirtualUart>,
    /// Hidden CPUID bits.
    pub cpuid_masks: Vec<CpuidMask>,
}

impl VmConfig {
    /// Number of vcpus.
    #[inline]
    pub fn vcpu_num(&self) -> usize {
        self.cpu_affinity.count_ones() as usize
    }

    /// pCPUs of the vcpus, in vcpu order.
    pub fn pcpus(&self) -> impl Iterator<Item = usize> + '_ {
        (0..64).filter(move |&pcpu| self.cpu_affinity & (1 << pcpu) != 0)
    }

    /// Validate this configuration on a machine with `nr_pcpus` pCPUs.
    pub fn check(&self, nr_pcpus: usize) -> HvResult {
        if self.cpu_affinity == 0 || (nr_pcpus < 64 && self.cpu_affinity >> nr_pcpus != 0) {
            hv_result_err!(
                InvalidArgument,
                "VM{}: affinity {:#x} outside of {} pCPUs",
                self.id,
                self.cpu_affinity,
                nr_pcpus
            );
        }
        if self.vcpu_num() > MAX_VCPUS_PER_VM {
            hv_result_err!(OutOfRange, "VM{}: {} vcpus", self.id, self.vcpu_num());
        }

        let mut ranges: Vec<(usize, usize)> = Vec::new();
        let bars = self.pt_devices.iter().flat_map(|d| d.bars.iter());
        let regions = self
            .memory
            .iter()
            .map(|r| (r.start_hpa, r.gpa, r.size))
            .chain(bars.map(|b| (b.hpa, b.gpa, b.size)));
        for (hpa, gpa, size) in regions {
            if size == 0
                || size % PAGE_SIZE != 0
                || !gpa.is_aligned(PAGE_SIZE)
                || !hpa.is_aligned(PAGE_SIZE)
            {
                hv_result_err!(
                    InvalidArgument,
                    "VM{}: region {:?} -> {:?} size {:#x}",
                    self.id,
                    gpa,
                    hpa,
                    size
                );
            }
            ranges.push((gpa.into_usize(), gpa.into_usize() + size));
        }
        ranges.sort_unstable();
        if ranges.windows(2).any(|w| w[0].1 > w[1].0) {
            hv_result_err!(AlreadyExists, "VM{}: overlapping guest regions", self.id);
        }
        Ok(())
    }
}

/// The whole static configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorConfig {
    /// Number of pCPUs of the board.
    pub nr_pcpus: usize,
    /// The vm table.
    pub vms: Vec<VmConfig>,
}

impl HypervisorConfig {
    /// Validate every vm and the table as a whole.
    pub fn check(&self) -> HvResult {
        if self.vms.len() > MAX_VM {
            hv_result_err!(OutOfRange, "{} vms", self.vms.len());
        }
        let mut ids = 0u64;
        for vm in self.vms.iter() {
            if vm.id as usize >= MAX_VM || ids & (1 << vm.id) != 0 {
                hv_result_err!(InvalidArgument, "bad or duplicated vm id {}", vm.id);
            }
            ids |= 1 << vm.id;
            vm.check(self.nr_pcpus)?;
        }
        if self
            .vms
            .iter()
            .filter(|vm| vm.vm_type == VmType::Service)
            .count()
            > 1
        {
            hv_result_err!(AlreadyExists, "more than one service vm");
        }
        Ok(())
    }

    /// Configuration of vm `id`.
    pub fn vm(&self, id: u16) -> Option<&VmConfig> {
        self.vms.iter().find(|vm| vm.id == id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec;
    use kecore::HvError;

    pub(crate) fn gpa(v: usize) -> Gpa {
        Gpa::new(v).unwrap()
    }

    pub(crate) fn pa(v: usize) -> Pa {
        Pa::new(v).unwrap()
    }

    /// A one-vcpu pre-launched vm with 2 MiB of RAM at gpa 0.
    pub(crate) fn small_vm(id: u16, cpu_affinity: u64) -> VmConfig {
        VmConfig {
            id,
            name: alloc::format!("vm{}", id),
            vm_type: VmType::PreLaunched,
            severity: SEVERITY_STANDARD_VM,
            cpu_affinity,
            memory: vec![MemRegion {
                start_hpa: pa(0x1_0000_0000 + id as usize * 0x20_0000),
                gpa: gpa(0),
                size: 0x20_0000,
                kind: MemRegionKind::Ram,
            }],
            os: GuestOs {
                kernel_type: KernelType::RawImage,
                load_gpa: gpa(0x10_0000),
                entry_gpa: gpa(0x10_0000),
                bootargs: String::new(),
            },
            pt_devices: Vec::new(),
            vuarts: vec![VirtualUart {
                index: 0,
                port_base: 0x3f8,
                irq: 4,
            }],
            cpuid_masks: Vec::new(),
        }
    }

    #[test]
    fn valid_table_passes() {
        let config = HypervisorConfig {
            nr_pcpus: 4,
            vms: vec![small_vm(0, 0b1), small_vm(1, 0b110)],
        };
        config.check().unwrap();
        assert_eq!(config.vm(1).unwrap().vcpu_num(), 2);
        assert_eq!(
            config.vm(1).unwrap().pcpus().collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn rejects_bad_vms() {
        assert_eq!(small_vm(0, 0).check(4), Err(HvError::InvalidArgument));
        assert_eq!(small_vm(0, 0b10000).check(4), Err(HvError::InvalidArgument));

        let mut vm = small_vm(0, 1);
        vm.memory[0].size = 0x1800;
        assert_eq!(vm.check(4), Err(HvError::InvalidArgument));

        let mut vm = small_vm(0, 1);
        vm.memory.push(MemRegion {
            start_hpa: pa(0x2_0000_0000),
            gpa: gpa(0x1f_f000),
            size: 0x2000,
            kind: MemRegionKind::LazyRam,
        });
        assert_eq!(vm.check(4), Err(HvError::AlreadyExists));
    }

    #[test]
    fn rejects_bad_tables() {
        let mut a = small_vm(0, 1);
        let mut b = small_vm(1, 2);
        a.vm_type = VmType::Service;
        b.vm_type = VmType::Service;
        let config = HypervisorConfig {
            nr_pcpus: 2,
            vms: vec![a.clone(), b],
        };
        assert_eq!(config.check(), Err(HvError::AlreadyExists));

        let config = HypervisorConfig {
            nr_pcpus: 2,
            vms: vec![a.clone(), a],
        };
        assert_eq!(config.check(), Err(HvError::InvalidArgument));
        assert_eq!(alloc::format!("{}", Bdf { bus: 0, dev: 0x1f, func: 3 }), "00:1f.3");
    }
}
