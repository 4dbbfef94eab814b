use super::{ExitContext, VmexitResult};
use crate::{
    vcpu::PendingRequest,
    vmcs::{ExternalIntInfo, Field},
    VmError,
};
use abyss::x86_64::{cpuid::LEAF_XSAVE, Cr4, PrivilegeLevel};

const XCR0_X87: u64 = 1 << 0;
const XCR0_SSE: u64 = 1 << 1;
const XCR0_AVX: u64 = 1 << 2;

/// External interrupt: run the host handler of the vector.
pub(super) fn external_interrupt_vmexit_handler(
    ctx: &mut ExitContext<'_>,
) -> Result<VmexitResult, VmError> {
    let info = ctx.vmcs().read(Field::VmexitInterruptionInfo)? as u32;
    match ExternalIntInfo::from_raw(info) {
        Some(info) => ctx.hv.handle_host_interrupt(ctx.pcpu, info.host_int),
        None => log::warn!("pCPU{}: external interrupt exit without a vector", ctx.pcpu),
    }
    Ok(VmexitResult::Continue)
}

/// Triple fault: the vm shuts down at the next entry.
pub(super) fn triple_fault_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    log::warn!("VM{}:vcpu{}: triple fault", ctx.vm.id(), ctx.vcpu.id());
    ctx.vcpu.make_request(PendingRequest::TRP_FAULT);
    Ok(VmexitResult::Continue)
}

/// INIT signal: ignored.
pub(super) fn init_signal_vmexit_handler(_ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    Ok(VmexitResult::Continue)
}

/// HLT: give the pCPU away once the exit is done.
pub(super) fn hlt_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    ctx.forward_rip()?;
    ctx.yield_requested = true;
    Ok(VmexitResult::Continue)
}

/// XSETBV.
pub(super) fn xsetbv_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    if !ctx.arch.cr4.contains(Cr4::OSXSAVE) {
        ctx.inject_ud();
        return Ok(VmexitResult::Continue);
    }
    if ctx.arch.gprs.rcx as u32 != 0 || ctx.vcpu.cpl()? != PrivilegeLevel::Ring0 {
        ctx.inject_gp();
        return Ok(VmexitResult::Continue);
    }
    let value = (ctx.arch.gprs.rdx << 32) | (ctx.arch.gprs.rax & 0xffff_ffff);
    let leaf = ctx.vcpu.cpuid().guest_cpuid(LEAF_XSAVE, 0, ctx.arch.cr4);
    let supported = leaf.eax as u64 | (leaf.edx as u64) << 32;
    if value & XCR0_X87 == 0
        || (value & XCR0_AVX != 0 && value & XCR0_SSE == 0)
        || value & !supported != 0
    {
        ctx.inject_gp();
        return Ok(VmexitResult::Continue);
    }
    ctx.arch.xcr0 = value;
    ctx.forward_rip()?;
    Ok(VmexitResult::Continue)
}

/// VMX instructions and VMFUNC: VMX is not exposed, so they are undefined.
pub(super) fn undefined_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    ctx.inject_ud();
    Ok(VmexitResult::Continue)
}

/// Every other reason.
pub(super) fn unhandled_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    Err(VmError::HandleVmexitFailed(*ctx.reason.get_basic_reason()))
}
