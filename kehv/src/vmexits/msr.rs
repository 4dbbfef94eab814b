//! RDMSR/WRMSR.
//!
//! The vm sees a small set of virtual MSRs. Anything else raises #GP, as it
//! would on a processor without the MSR.
use super::{ExitContext, VmexitResult};
use crate::{vmcs::Field, VmError};
use abyss::x86_64::{
    msr::{IA32_APIC_BASE, IA32_EFER, IA32_FEATURE_CONTROL, IA32_MTRR_DEF_TYPE, IA32_PAT, IA32_TSC_AUX},
    Cr0, Efer,
};

const APIC_BASE_DEFAULT: u64 = 0xfee0_0000;
const APIC_BASE_ENABLE: u64 = 1 << 11;
const APIC_BASE_BSP: u64 = 1 << 8;
/// Locked, VMX off.
const FEATURE_CONTROL_LOCKED: u64 = 1;

fn pat_is_valid(value: u64) -> bool {
    value
        .to_le_bytes()
        .into_iter()
        .all(|ty| matches!(ty, 0 | 1 | 4 | 5 | 6 | 7))
}

fn read_msr(ctx: &ExitContext<'_>, msr: u32) -> Result<Option<u64>, VmError> {
    Ok(Some(match msr {
        IA32_TSC_AUX => ctx
            .arch
            .msrs
            .get(&msr)
            .copied()
            .unwrap_or(ctx.vcpu.id() as u64),
        IA32_PAT => ctx.vmcs().read(Field::GuestIa32Pat)?,
        IA32_EFER => ctx.vmcs().read(Field::GuestIa32Efer)?,
        IA32_APIC_BASE => {
            let bsp = if ctx.vcpu.id() == 0 { APIC_BASE_BSP } else { 0 };
            APIC_BASE_DEFAULT | APIC_BASE_ENABLE | bsp
        }
        IA32_FEATURE_CONTROL => FEATURE_CONTROL_LOCKED,
        IA32_MTRR_DEF_TYPE => ctx.arch.msrs.get(&msr).copied().unwrap_or(0),
        _ => return Ok(None),
    }))
}

// Returns false if the write is refused.
fn write_msr(ctx: &mut ExitContext<'_>, msr: u32, value: u64) -> Result<bool, VmError> {
    match msr {
        IA32_TSC_AUX | IA32_MTRR_DEF_TYPE => {
            ctx.arch.msrs.insert(msr, value);
        }
        IA32_PAT => {
            if !pat_is_valid(value) {
                return Ok(false);
            }
            ctx.vmcs().write(Field::GuestIa32Pat, value)?;
        }
        IA32_EFER => {
            let new = match Efer::from_bits(value) {
                Some(new) => new,
                None => return Ok(false),
            };
            let cur = ctx.vcpu.efer()?;
            // LMA is read-only; LME is frozen while paging is on.
            let new = (new - Efer::LMA) | (cur & Efer::LMA);
            if new.contains(Efer::LME) != cur.contains(Efer::LME) && ctx.arch.cr0.contains(Cr0::PG) {
                return Ok(false);
            }
            ctx.vmcs().write(Field::GuestIa32Efer, new.bits())?;
        }
        // Relocating the local APIC is not supported; the write is dropped.
        IA32_APIC_BASE => (),
        _ => return Ok(false),
    }
    Ok(true)
}

/// RDMSR.
pub(super) fn rdmsr_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    let msr = ctx.arch.gprs.rcx as u32;
    match read_msr(ctx, msr)? {
        Some(value) => {
            ctx.arch.gprs.rax = value & 0xffff_ffff;
            ctx.arch.gprs.rdx = value >> 32;
            ctx.forward_rip()?;
        }
        None => {
            log::debug!("VM{}:vcpu{}: rdmsr 0x{:x}", ctx.vm.id(), ctx.vcpu.id(), msr);
            ctx.inject_gp();
        }
    }
    Ok(VmexitResult::Continue)
}

/// WRMSR.
pub(super) fn wrmsr_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    let msr = ctx.arch.gprs.rcx as u32;
    let value = (ctx.arch.gprs.rdx << 32) | (ctx.arch.gprs.rax & 0xffff_ffff);
    if write_msr(ctx, msr, value)? {
        ctx.forward_rip()?;
    } else {
        log::debug!(
            "VM{}:vcpu{}: wrmsr 0x{:x} <- 0x{:x} refused",
            ctx.vm.id(),
            ctx.vcpu.id(),
            msr,
            value
        );
        ctx.inject_gp();
    }
    Ok(VmexitResult::Continue)
}

#[cfg(test)]
mod tests {
    use super::pat_is_valid;
    use crate::vcpu::DEFAULT_PAT;

    #[test]
    fn pat_types() {
        assert!(pat_is_valid(DEFAULT_PAT));
        assert!(!pat_is_valid(0x0007_0406_0007_0402));
        assert!(!pat_is_valid(0x0800_0000_0000_0000));
    }
}
