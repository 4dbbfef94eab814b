//! EPT violations and misconfigurations.
use super::{ExitContext, VmexitResult};
use crate::{
    mmio,
    probe::{GuestPaging, GuestProbe},
    vm::{Gpa, Gva},
    vmcs::{fault_gpa, EptViolationQualification, Field},
    VmError,
};

/// EPT violation.
///
/// In order: demand-map lazily mapped RAM, emulate the access on a registered
/// MMIO handler, or inject #GP for an access the vm has no right to.
pub(super) fn ept_violation_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    let q = EptViolationQualification::from_bits_truncate(ctx.qualification);
    let gpa = fault_gpa(ctx.vmcs())?;

    if ctx.vm.is_lazy_ram(gpa) && !q.was_mapped() {
        return map_lazy_page(ctx, gpa);
    }
    if let Some(handler) = ctx.vm.io().find_mmio(gpa) {
        return match emulate_mmio(ctx, gpa, &*handler) {
            Ok(()) => Ok(VmexitResult::Continue),
            Err(VmError::FailedToDecodeInstruction) | Err(VmError::GuestMemoryFault(_)) => {
                ctx.inject_gp();
                Ok(VmexitResult::Continue)
            }
            Err(e) => Err(e),
        };
    }

    log::warn!(
        "VM{}:vcpu{}: ept violation at {:?} ({:?}), no backing",
        ctx.vm.id(),
        ctx.vcpu.id(),
        gpa,
        q
    );
    ctx.inject_gp();
    Ok(VmexitResult::Continue)
}

fn map_lazy_page(ctx: &mut ExitContext<'_>, gpa: Gpa) -> Result<VmexitResult, VmError> {
    // Losing a race with another vcpu leaves its mapping in place.
    ctx.vm.map_lazy_page(ctx.hv.ram_pool(), gpa)?;
    // The faulting access is retried.
    Ok(VmexitResult::Continue)
}

fn emulate_mmio(
    ctx: &mut ExitContext<'_>,
    gpa: Gpa,
    handler: &dyn crate::io::MmioHandler,
) -> Result<(), VmError> {
    let vmcs = ctx.vmcs();
    let rip = vmcs.read(Field::GuestRip)?;
    let paging = GuestPaging::from_vmcs(vmcs)?;
    let probe = GuestProbe::new(ctx.vm.ept(), ctx.hv.mem(), paging);
    let gva = Gva::new(rip as usize).ok_or(VmError::FailedToDecodeInstruction)?;
    let (bytes, len) = mmio::fetch_instruction(&probe, gva)?;
    let insn = mmio::decode(&bytes[..len], rip, &ctx.arch.gprs)?;
    mmio::emulate(&insn, gpa, handler, &mut ctx.arch.gprs);
    vmcs.write(Field::GuestRip, rip + insn.len as u64)
}

/// EPT misconfiguration: the hypervisor built a broken entry.
pub(super) fn ept_misconfig_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    log::error!(
        "VM{}:vcpu{}: ept misconfiguration at {:?}",
        ctx.vm.id(),
        ctx.vcpu.id(),
        fault_gpa(ctx.vmcs())?
    );
    Ok(VmexitResult::Fatal)
}
