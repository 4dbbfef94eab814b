//! The virtual machine monitor.
//!
//! This crate turns the core services of [`kecore`] into a partitioning
//! hypervisor. A [`hypervisor::Hypervisor`] owns the VM table built from the
//! static [`config`]; every [`vm::Vm`] owns its [`ept::Ept`] and a fixed set of
//! [`vcpu::Vcpu`]s, each pinned to one pCPU through a scheduler thread object.
//!
//! A vcpu leaves the guest through a VM exit. The exit is classified by its
//! [`vmcs::BasicExitReason`] and dispatched through the table in [`vmexits`],
//! whose handlers either emulate the operation and continue the guest, inject
//! a fault into the guest, or report a fatal error that parks the vcpu.
//!
//! ## Hosted runs
//! VMX instructions only exist on the bare-metal target. Everywhere else the
//! VMCS is backed by [`vmcs::SoftVmcs`] and VM entries are scripted through
//! [`vcpu::ScriptedEntry`], so the exit path runs unchanged in unit tests.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config;
pub mod ept;
pub mod hypercall;
pub mod hypervisor;
pub mod io;
pub mod mmio;
pub mod probe;
pub mod vcpu;
pub mod vcpuid;
pub mod ve820;
pub mod vm;
pub mod vm_control;
pub mod vmcs;
pub mod vmexits;

use kecore::HvError;
use vm::Gpa;
use vmcs::{BasicExitReason, InstructionError};

pub use probe::Probe;

/// Possible errors of the virtual machine monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// A core service failed.
    Hv(HvError),
    /// A VMX instruction failed.
    InstructionError(InstructionError),
    /// No handler took the vmexit.
    HandleVmexitFailed(BasicExitReason),
    /// The instruction at guest rip could not be decoded.
    FailedToDecodeInstruction,
    /// The vcpu can not move between these states.
    InvalidVcpuState {
        /// Current state.
        from: vcpu::VcpuState,
        /// Requested state.
        to: vcpu::VcpuState,
    },
    /// Access to a port without a handler.
    UnhandledIo(u16),
    /// Access to guest physical memory without a handler.
    UnhandledMmio(Gpa),
    /// Guest memory at this address is not accessible.
    GuestMemoryFault(Gpa),
}

impl VmError {
    /// The negative errno reported across the hypercall boundary.
    pub fn code(&self) -> i64 {
        match self {
            VmError::Hv(e) => e.code(),
            VmError::InstructionError(_) | VmError::GuestMemoryFault(_) => HvError::Fault.code(),
            VmError::HandleVmexitFailed(_)
            | VmError::UnhandledIo(_)
            | VmError::UnhandledMmio(_) => HvError::Unsupported.code(),
            VmError::FailedToDecodeInstruction => HvError::InvalidArgument.code(),
            VmError::InvalidVcpuState { .. } => HvError::Busy.code(),
        }
    }
}

impl From<HvError> for VmError {
    fn from(e: HvError) -> Self {
        VmError::Hv(e)
    }
}

impl From<InstructionError> for VmError {
    fn from(e: InstructionError) -> Self {
        VmError::InstructionError(e)
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::Hv(e) => write!(f, "{}", e),
            VmError::InstructionError(e) => write!(f, "vmx instruction error: {:?}", e),
            VmError::HandleVmexitFailed(r) => write!(f, "unhandled vmexit: {:?}", r),
            VmError::FailedToDecodeInstruction => write!(f, "failed to decode instruction"),
            VmError::InvalidVcpuState { from, to } => {
                write!(f, "invalid vcpu transition {:?} -> {:?}", from, to)
            }
            VmError::UnhandledIo(port) => write!(f, "unhandled io port 0x{:x}", port),
            VmError::UnhandledMmio(gpa) => write!(f, "unhandled mmio at {}", gpa),
            VmError::GuestMemoryFault(gpa) => write!(f, "guest memory fault at {}", gpa),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(VmError::from(HvError::OutOfMemory).code(), -12);
        assert_eq!(VmError::UnhandledIo(0x3f8).code(), -19);
        assert_eq!(VmError::FailedToDecodeInstruction.code(), -22);
        assert_eq!(
            VmError::GuestMemoryFault(Gpa::new(0x1000).unwrap()).code(),
            -14
        );
    }
}
