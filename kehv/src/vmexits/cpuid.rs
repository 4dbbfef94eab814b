use super::{ExitContext, VmexitResult};
use crate::VmError;

/// CPUID: answer from the table built when the vcpu was created.
pub(super) fn cpuid_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    let (leaf, subleaf) = (ctx.arch.gprs.rax as u32, ctx.arch.gprs.rcx as u32);
    let r = ctx.vcpu.cpuid().guest_cpuid(leaf, subleaf, ctx.arch.cr4);
    let gprs = &mut ctx.arch.gprs;
    gprs.rax = r.eax as u64;
    gprs.rbx = r.ebx as u64;
    gprs.rcx = r.ecx as u64;
    gprs.rdx = r.edx as u64;
    ctx.forward_rip()?;
    Ok(VmexitResult::Continue)
}
