//! VM exit dispatch.
//!
//! Every exit is looked up by its [`BasicExitReason`] in a fixed table whose
//! entries name the handler and whether the exit qualification has to be read
//! for it. A handler consumes the vcpu through an [`ExitContext`] and returns
//! [`VmexitResult::Continue`] to resume the guest or [`VmexitResult::Fatal`]
//! to park the vcpu.
//!
//! Guest-triggered errors never reach the host: handlers turn them into
//! injected faults and continue. A handler that does not know the exit returns
//! [`VmError::HandleVmexitFailed`], which hands the exit to the
//! [`VmexitController`] installed in the hypervisor; if that one declines
//! too, the exit is fatal.
use crate::{
    hypervisor::Hypervisor,
    vcpu::{ArchState, Vcpu},
    vm::Vm,
    vmcs::{BasicExitReason, ExitReason, Field, VmcsAccess},
    VmError,
};
use alloc::sync::Arc;
use kecore::percpu::PcpuId;

mod cpuid;
mod cr;
mod ept;
mod io;
mod misc;
mod msr;

/// Outcome of a handled VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmexitResult {
    /// Resume the guest.
    Continue,
    /// The vcpu can not run anymore.
    Fatal,
}

/// Everything a handler may touch while the vcpu is in HANDLING.
pub struct ExitContext<'a> {
    /// The hypervisor.
    pub hv: &'a Hypervisor,
    /// The vm of the exiting vcpu.
    pub vm: &'a Arc<Vm>,
    /// The exiting vcpu.
    pub vcpu: &'a Arc<Vcpu>,
    /// Its state outside the VMCS, locked for the whole exit.
    pub arch: &'a mut ArchState,
    /// The pCPU handling the exit.
    pub pcpu: PcpuId,
    /// Why the guest exited.
    pub reason: ExitReason,
    /// Exit qualification, read only for the reasons that define one.
    pub qualification: u64,
    /// Set by handlers that want the pCPU to yield after the exit.
    pub yield_requested: bool,
}

impl<'a> ExitContext<'a> {
    /// Context for the exit `reason` of `vcpu`.
    pub fn new(
        hv: &'a Hypervisor,
        vm: &'a Arc<Vm>,
        vcpu: &'a Arc<Vcpu>,
        arch: &'a mut ArchState,
        pcpu: PcpuId,
        reason: ExitReason,
    ) -> Self {
        Self {
            hv,
            vm,
            vcpu,
            arch,
            pcpu,
            reason,
            qualification: 0,
            yield_requested: false,
        }
    }

    /// The VMCS of the exiting vcpu.
    #[inline]
    pub fn vmcs(&self) -> &'a dyn VmcsAccess {
        self.vcpu.vmcs()
    }

    /// Skip the exiting instruction.
    #[inline]
    pub fn forward_rip(&self) -> Result<(), VmError> {
        self.vmcs().forward_rip()
    }

    /// Inject #GP(0). The guest rip is left on the faulting instruction.
    pub fn inject_gp(&mut self) {
        log::debug!(
            "VM{}:vcpu{}: #GP on {:?}",
            self.vm.id(),
            self.vcpu.id(),
            self.reason.get_basic_reason()
        );
        self.vcpu.inject_gp(self.arch, 0)
    }

    /// Inject #UD.
    pub fn inject_ud(&mut self) {
        self.vcpu.inject_ud(self.arch)
    }
}

/// Controller of the exits the built-in handlers do not take.
///
/// Controllers compose as tuples: `(a, b)` asks `a` first and falls back to
/// `b` when `a` returns [`VmError::HandleVmexitFailed`].
pub trait VmexitController
where
    Self: Send + Sync,
{
    /// Handle the vmexit on this controller.
    ///
    /// Returns [`VmError::HandleVmexitFailed`] when failed to handle vmexit on
    /// this controller.
    fn handle(&self, reason: BasicExitReason, ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError>;
}

impl VmexitController for () {
    fn handle(&self, reason: BasicExitReason, _ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
        Err(VmError::HandleVmexitFailed(reason))
    }
}

impl<A: VmexitController, B: VmexitController> VmexitController for (A, B) {
    fn handle(&self, reason: BasicExitReason, ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
        let (a, b) = self;
        match a.handle(reason, ctx) {
            Err(VmError::HandleVmexitFailed(reason)) => b.handle(reason, ctx),
            r => r,
        }
    }
}

type Handler = fn(&mut ExitContext<'_>) -> Result<VmexitResult, VmError>;

#[derive(Clone, Copy)]
struct DispatchEntry {
    handler: Handler,
    need_qualification: bool,
}

const fn entry(handler: Handler, need_qualification: bool) -> DispatchEntry {
    DispatchEntry {
        handler,
        need_qualification,
    }
}

fn dispatch_entry(reason: BasicExitReason) -> DispatchEntry {
    use BasicExitReason::*;
    match reason {
        ExternalInt => entry(misc::external_interrupt_vmexit_handler, false),
        TripleFault => entry(misc::triple_fault_vmexit_handler, false),
        InitSignal => entry(misc::init_signal_vmexit_handler, false),
        Cpuid => entry(cpuid::cpuid_vmexit_handler, false),
        Hlt => entry(misc::hlt_vmexit_handler, false),
        Vmcall => entry(crate::hypercall::vmcall_vmexit_handler, false),
        Vmclear | Vmlaunch | Vmptrld | Vmptrst | Vmread | Vmresume | Vmwrite | Vmxoff | Vmxon
        | Invept | Invvpid | Vmfunc => entry(misc::undefined_vmexit_handler, false),
        MovCr => entry(cr::cr_access_vmexit_handler, true),
        IoInstruction => entry(io::pio_instr_vmexit_handler, true),
        Rdmsr => entry(msr::rdmsr_vmexit_handler, false),
        Wrmsr => entry(msr::wrmsr_vmexit_handler, false),
        EptViolation => entry(ept::ept_violation_vmexit_handler, true),
        EptMisconfig => entry(ept::ept_misconfig_vmexit_handler, true),
        Xsetbv => entry(misc::xsetbv_vmexit_handler, false),
        _ => entry(misc::unhandled_vmexit_handler, false),
    }
}

/// Handle the exit described by `ctx`.
pub fn dispatch(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    let basic = match ctx.reason {
        ExitReason::BasicExitReason(reason) => reason,
        ExitReason::EntryFailure(_) | ExitReason::ExitFromVmxRootOperation(_) => {
            log::error!(
                "VM{}:vcpu{}: vm entry failed: {:?}",
                ctx.vm.id(),
                ctx.vcpu.id(),
                ctx.reason
            );
            return Ok(VmexitResult::Fatal);
        }
    };
    let entry = dispatch_entry(basic);
    if entry.need_qualification {
        ctx.qualification = ctx.vmcs().read(Field::VmexitQualification)?;
    }
    match (entry.handler)(ctx) {
        Err(VmError::HandleVmexitFailed(reason)) => unhandled(ctx, reason),
        r => r,
    }
}

fn unhandled(ctx: &mut ExitContext<'_>, reason: BasicExitReason) -> Result<VmexitResult, VmError> {
    let hv = ctx.hv;
    match hv.controller().handle(reason, ctx) {
        Err(VmError::HandleVmexitFailed(reason)) => {
            log::error!(
                "VM{}:vcpu{}: unhandled vmexit {:?} at rip 0x{:x}, qualification 0x{:x}",
                ctx.vm.id(),
                ctx.vcpu.id(),
                reason,
                ctx.vmcs().read(Field::GuestRip).unwrap_or(0),
                ctx.vmcs().read(Field::VmexitQualification).unwrap_or(0),
            );
            Ok(VmexitResult::Fatal)
        }
        r => r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualification_is_read_where_defined() {
        for reason in [
            BasicExitReason::MovCr,
            BasicExitReason::IoInstruction,
            BasicExitReason::EptViolation,
        ] {
            assert!(dispatch_entry(reason).need_qualification, "{:?}", reason);
        }
        for reason in [
            BasicExitReason::Cpuid,
            BasicExitReason::Hlt,
            BasicExitReason::Vmcall,
            BasicExitReason::Rdmsr,
        ] {
            assert!(!dispatch_entry(reason).need_qualification, "{:?}", reason);
        }
    }
}
