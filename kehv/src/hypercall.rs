//! Hypercalls of the service vm.
//!
//! A hypercall is a VMCALL with the call id in r8 and up to two parameters in
//! rdi and rsi. The status, zero or a negative errno, comes back sign-extended
//! in rax. Only the service vm running at CPL 0 may call; any other caller,
//! and any unknown id, gets `-EPERM`. Structures passed by guest physical
//! address are little-endian with the layouts given on each call.
use crate::{
    config::{MAX_VCPUS_PER_VM, MAX_VM},
    probe::{GuestPaging, GuestProbe, Probe},
    vm::Gpa,
    vmexits::{ExitContext, VmexitResult},
    VmError,
};
use abyss::{
    addressing::{PhysMapper, PAGE_SIZE},
    x86_64::PrivilegeLevel,
};
use kecore::{
    hv_result_err,
    sbuf::{SbufMemory, SBUF_HEAD_SIZE, SBUF_MAX_SIZE},
    HvError,
};

/// Get the hypercall API version.
pub const HC_GET_API_VERSION: u64 = 0x8000_0000;
/// Get the platform information.
pub const HC_GET_PLATFORM_INFO: u64 = 0x8000_0003;
/// Start a vm.
pub const HC_START_VM: u64 = 0x8000_0012;
/// Pause a vm.
pub const HC_PAUSE_VM: u64 = 0x8000_0013;
/// Translate a guest physical address of a vm.
pub const HC_VM_GPA2HPA: u64 = 0x8000_0041;
/// Register a shared buffer.
pub const HC_SETUP_SBUF: u64 = 0x8000_0060;

/// Major version of this API.
pub const API_MAJOR_VERSION: u32 = 1;
/// Minor version of this API.
pub const API_MINOR_VERSION: u32 = 0;
/// Version of [`PlatformInfo`].
pub const PLATFORM_INFO_VERSION: u16 = 1;

/// A resolved hypercall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypercall {
    /// Write `{ major: u32, minor: u32 }` to `gpa`.
    GetApiVersion {
        /// Output buffer.
        gpa: u64,
    },
    /// Write a [`PlatformInfo`] to `gpa`.
    GetPlatformInfo {
        /// Output buffer.
        gpa: u64,
    },
    /// Start vm `vm_id`.
    StartVm {
        /// Target vm.
        vm_id: u64,
    },
    /// Pause vm `vm_id`.
    PauseVm {
        /// Target vm.
        vm_id: u64,
    },
    /// Translate `{ gpa: u64, hpa: u64 }` at `gpa` in place for vm `vm_id`.
    ///
    /// `hpa` is set to `u64::MAX` when nothing maps the address.
    VmGpa2Hpa {
        /// Vm whose address is translated.
        vm_id: u64,
        /// Request buffer.
        gpa: u64,
    },
    /// Register `{ pcpu_id: u32, sbuf_id: u32, gpa: u64 }` read from `gpa`.
    ///
    /// A buffer gpa of zero drops the registration.
    SetupSbuf {
        /// Request buffer.
        gpa: u64,
    },
}

impl Hypercall {
    /// Resolve the call from the id and parameters.
    pub fn resolve(id: u64, param1: u64, param2: u64) -> Option<Self> {
        Some(match id {
            HC_GET_API_VERSION => Self::GetApiVersion { gpa: param1 },
            HC_GET_PLATFORM_INFO => Self::GetPlatformInfo { gpa: param1 },
            HC_START_VM => Self::StartVm { vm_id: param1 },
            HC_PAUSE_VM => Self::PauseVm { vm_id: param1 },
            HC_VM_GPA2HPA => Self::VmGpa2Hpa {
                vm_id: param1,
                gpa: param2,
            },
            HC_SETUP_SBUF => Self::SetupSbuf { gpa: param1 },
            _ => return None,
        })
    }
}

/// Platform description returned by [`HC_GET_PLATFORM_INFO`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Number of pCPUs.
    pub cpu_num: u16,
    /// [`PLATFORM_INFO_VERSION`].
    pub version: u16,
    /// Maximum number of vcpus of a vm.
    pub max_vcpus_per_vm: u16,
    /// Maximum number of vms.
    pub max_vms: u16,
}

impl PlatformInfo {
    /// Wire size.
    pub const SIZE: usize = 8;

    /// Wire format.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0; Self::SIZE];
        b[0..2].copy_from_slice(&self.cpu_num.to_le_bytes());
        b[2..4].copy_from_slice(&self.version.to_le_bytes());
        b[4..6].copy_from_slice(&self.max_vcpus_per_vm.to_le_bytes());
        b[6..8].copy_from_slice(&self.max_vms.to_le_bytes());
        b
    }
}

fn gpa_of(v: u64) -> Result<Gpa, VmError> {
    match Gpa::new(v as usize) {
        Some(gpa) => Ok(gpa),
        None => hv_result_err!(InvalidArgument, "bad gpa 0x{:x}", v),
    }
}

fn vm_id_of(ctx: &ExitContext<'_>, v: u64) -> Result<u16, VmError> {
    match u16::try_from(v) {
        Ok(id) if id != ctx.vm.id() => Ok(id),
        Ok(_) => hv_result_err!(InvalidArgument, "VM{} targets itself", ctx.vm.id()),
        Err(_) => hv_result_err!(NotFound, "no vm 0x{:x}", v),
    }
}

fn handle(ctx: &ExitContext<'_>, hc: Hypercall, probe: &dyn Probe) -> Result<(), VmError> {
    let hv = ctx.hv;
    match hc {
        Hypercall::GetApiVersion { gpa } => {
            let mut b = [0u8; 8];
            b[0..4].copy_from_slice(&API_MAJOR_VERSION.to_le_bytes());
            b[4..8].copy_from_slice(&API_MINOR_VERSION.to_le_bytes());
            probe.copy_to_guest(gpa_of(gpa)?, &b)
        }
        Hypercall::GetPlatformInfo { gpa } => {
            let info = PlatformInfo {
                cpu_num: hv.config().nr_pcpus as u16,
                version: PLATFORM_INFO_VERSION,
                max_vcpus_per_vm: MAX_VCPUS_PER_VM as u16,
                max_vms: MAX_VM as u16,
            };
            probe.copy_to_guest(gpa_of(gpa)?, &info.to_bytes())
        }
        Hypercall::StartVm { vm_id } => hv.start_vm(vm_id_of(ctx, vm_id)?, ctx.pcpu),
        Hypercall::PauseVm { vm_id } => hv.pause_vm(vm_id_of(ctx, vm_id)?, ctx.pcpu),
        Hypercall::VmGpa2Hpa { vm_id, gpa } => {
            let req = gpa_of(gpa)?;
            let target = match u16::try_from(vm_id).ok().and_then(|id| hv.get_vm(id)) {
                Some(vm) => vm,
                None => hv_result_err!(NotFound, "no vm 0x{:x}", vm_id),
            };
            let mut b = [0u8; 16];
            probe.copy_from_guest(req, &mut b[..8])?;
            let query = u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
            let hpa = Gpa::new(query as usize)
                .and_then(|q| target.gpa2hpa(q))
                .map(|hpa| hpa.into_usize() as u64)
                .unwrap_or(u64::MAX);
            b[8..16].copy_from_slice(&hpa.to_le_bytes());
            probe.copy_to_guest(req, &b)
        }
        Hypercall::SetupSbuf { gpa } => {
            let mut b = [0u8; 16];
            probe.copy_from_guest(gpa_of(gpa)?, &mut b)?;
            let pcpu = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize;
            let sbuf_id = u32::from_le_bytes([b[4], b[5], b[6], b[7]]);
            let buf = u64::from_le_bytes([b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]]);
            if buf == 0 {
                // Safety: no buffer is attached.
                return Ok(unsafe { hv.sbuf().share_setup(pcpu, sbuf_id, None) }?);
            }
            let buf = gpa_of(buf)?;
            let (va, len) = contiguous_buffer(ctx, probe, buf)?;
            let mem = SbufMemory {
                va,
                len,
                owner: ctx.vm.id() as usize,
            };
            // Safety: `len` bytes from `va` are host-contiguous RAM of the
            // service vm. Its shutdown drops the registration before the RAM
            // goes back to the pool.
            Ok(unsafe { hv.sbuf().share_setup(pcpu, sbuf_id, Some(mem)) }?)
        }
    }
}

// Host virtual address and length of the shared buffer at `buf`, provided
// the whole buffer is mapped to contiguous host memory.
fn contiguous_buffer(
    ctx: &ExitContext<'_>,
    probe: &dyn Probe,
    buf: Gpa,
) -> Result<(abyss::addressing::Va, usize), VmError> {
    if !buf.is_aligned(8) {
        hv_result_err!(InvalidArgument, "unaligned sbuf {:?}", buf);
    }
    // `size` sits at offset 36 of the header.
    let mut size = [0u8; 4];
    probe.copy_from_guest(buf + 36, &mut size)?;
    let size = u32::from_le_bytes(size) as usize;
    if size > SBUF_MAX_SIZE {
        hv_result_err!(InvalidArgument, "sbuf {:?} too large", buf);
    }
    let len = SBUF_HEAD_SIZE + size;
    let end = buf + len;
    let base = match ctx.vm.gpa2hpa(buf) {
        Some(hpa) => hpa,
        None => hv_result_err!(Fault, "sbuf {:?} is not mapped", buf),
    };
    let mut page = buf.page_down();
    while page < end {
        let expected = base.page_down() + (page.into_usize() - buf.page_down().into_usize());
        if ctx.vm.gpa2hpa(page) != Some(expected) {
            hv_result_err!(InvalidArgument, "sbuf {:?} is not contiguous", buf);
        }
        page = page + PAGE_SIZE;
    }
    match ctx.hv.mem().pa_to_va(base) {
        Some(va) => Ok((va, len)),
        None => Err(HvError::Fault.into()),
    }
}

/// VMCALL.
pub(crate) fn vmcall_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    let gprs = &ctx.arch.gprs;
    let (id, param1, param2) = (gprs.r8, gprs.rdi, gprs.rsi);
    let status = if !ctx.vm.is_service_vm() || ctx.vcpu.cpl()? != PrivilegeLevel::Ring0 {
        log::warn!(
            "VM{}:vcpu{}: hypercall 0x{:x} denied",
            ctx.vm.id(),
            ctx.vcpu.id(),
            id
        );
        HvError::PermissionDenied.code()
    } else {
        match Hypercall::resolve(id, param1, param2) {
            Some(hc) => {
                log::debug!("VM{}: {:?}", ctx.vm.id(), hc);
                let paging = GuestPaging::from_vmcs(ctx.vmcs())?;
                let (vm, hv) = (ctx.vm, ctx.hv);
                let probe = GuestProbe::new(vm.ept(), hv.mem(), paging);
                match handle(ctx, hc, &probe) {
                    Ok(()) => 0,
                    Err(e) => {
                        log::debug!("VM{}: {:?} failed: {}", vm.id(), hc, e);
                        e.code()
                    }
                }
            }
            None => {
                log::warn!("VM{}: unknown hypercall 0x{:x}", ctx.vm.id(), id);
                HvError::PermissionDenied.code()
            }
        }
    };
    ctx.arch.gprs.rax = status as u64;
    ctx.forward_rip()?;
    Ok(VmexitResult::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_ids() {
        assert_eq!(
            Hypercall::resolve(HC_VM_GPA2HPA, 2, 0x1000),
            Some(Hypercall::VmGpa2Hpa {
                vm_id: 2,
                gpa: 0x1000
            })
        );
        assert_eq!(
            Hypercall::resolve(HC_START_VM, 1, 0),
            Some(Hypercall::StartVm { vm_id: 1 })
        );
        assert_eq!(Hypercall::resolve(0x8000_00ff, 0, 0), None);
    }

    #[test]
    fn platform_info_layout() {
        let info = PlatformInfo {
            cpu_num: 4,
            version: PLATFORM_INFO_VERSION,
            max_vcpus_per_vm: 8,
            max_vms: 8,
        };
        assert_eq!(info.to_bytes(), [4, 0, 1, 0, 8, 0, 8, 0]);
    }
}
