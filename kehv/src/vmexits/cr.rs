//! Control register accesses.
//!
//! Only the host-owned bits of CR0 and CR4 trap. The guest sees its own
//! value through the read shadow while the VMCS holds the value the processor
//! really runs with: CR0.NE and CR4.VMXE stay set underneath.
use super::{ExitContext, VmexitResult};
use crate::{
    vcpu::PendingRequest,
    vm_control::VmcsEntryCtl,
    vmcs::{BasicExitReason, CrAccessQualification, CrAccessType, Field},
    VmError,
};
use abyss::x86_64::{Cr0, Cr4, Efer};

const CR0_RESERVED_HIGH: u64 = 0xffff_ffff_0000_0000;
const CR3_PCID_MASK: u64 = 0xfff;

// Changing these invalidates the combined guest/EPT translations.
const CR0_PAGING: Cr0 = Cr0::from_bits_truncate(Cr0::PG.bits() | Cr0::WP.bits());
const CR4_PAGING: Cr4 = Cr4::from_bits_truncate(
    Cr4::PGE.bits()
        | Cr4::PSE.bits()
        | Cr4::PAE.bits()
        | Cr4::SMEP.bits()
        | Cr4::SMAP.bits()
        | Cr4::PKE.bits(),
);

/// MOV to CR0/CR4, CLTS and LMSW.
pub(super) fn cr_access_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    let q = CrAccessQualification::from(ctx.qualification);
    let accepted = match (q.access_type, q.cr) {
        (CrAccessType::MovToCr, 0) => {
            let value = ctx.vcpu.read_gpr(ctx.arch, q.gpr)?;
            set_cr0(ctx, value)?
        }
        (CrAccessType::MovToCr, 4) => {
            let value = ctx.vcpu.read_gpr(ctx.arch, q.gpr)?;
            set_cr4(ctx, value)?
        }
        (CrAccessType::Clts, _) => {
            let value = (ctx.arch.cr0 - Cr0::TS).bits();
            set_cr0(ctx, value)?
        }
        (CrAccessType::Lmsw, _) => {
            // LMSW loads PE, MP, EM and TS but can not clear PE.
            let cur = ctx.arch.cr0.bits();
            let value = (cur & !0xe) | (q.lmsw_source as u64 & 0xf);
            set_cr0(ctx, value)?
        }
        _ => {
            log::warn!("unexpected cr access {:?}", q);
            return Err(VmError::HandleVmexitFailed(BasicExitReason::MovCr));
        }
    };
    if accepted {
        ctx.forward_rip()?;
    }
    Ok(VmexitResult::Continue)
}

fn set_entry_ia32e(ctx: &ExitContext<'_>, on: bool) -> Result<(), VmError> {
    let vmcs = ctx.vmcs();
    let mut ctl = VmcsEntryCtl::from_bits_truncate(vmcs.read(Field::VmentryControls)? as u32);
    ctl.set(VmcsEntryCtl::IA32E_MODE_GUEST, on);
    vmcs.write(Field::VmentryControls, ctl.bits() as u64)
}

/// Load guest CR0 with `value`.
///
/// Returns false if the value is illegal; #GP is injected then.
pub(super) fn set_cr0(ctx: &mut ExitContext<'_>, value: u64) -> Result<bool, VmError> {
    let new = Cr0::from_bits_truncate(value);
    if value & CR0_RESERVED_HIGH != 0
        || (new.contains(Cr0::PG) && !new.contains(Cr0::PE))
        || (new.contains(Cr0::NW) && !new.contains(Cr0::CD))
    {
        ctx.inject_gp();
        return Ok(false);
    }

    let old = ctx.arch.cr0;
    let vmcs = ctx.vmcs();
    let mut efer = ctx.vcpu.efer()?;
    if new.contains(Cr0::PG) && !old.contains(Cr0::PG) {
        if efer.contains(Efer::LME) {
            if !ctx.arch.cr4.contains(Cr4::PAE) {
                ctx.inject_gp();
                return Ok(false);
            }
            efer |= Efer::LMA;
            vmcs.write(Field::GuestIa32Efer, efer.bits())?;
            set_entry_ia32e(ctx, true)?;
        }
    } else if !new.contains(Cr0::PG) && old.contains(Cr0::PG) {
        if ctx.arch.cr4.contains(Cr4::PCIDE) {
            ctx.inject_gp();
            return Ok(false);
        }
        if efer.contains(Efer::LMA) {
            efer -= Efer::LMA;
            vmcs.write(Field::GuestIa32Efer, efer.bits())?;
            set_entry_ia32e(ctx, false)?;
        }
    }

    vmcs.write(Field::GuestCr0, (new | Cr0::NE).bits())?;
    vmcs.write(Field::Cr0ReadShadow, new.bits())?;
    log::trace!("VM{}:vcpu{}: cr0 {:?} -> {:?}", ctx.vm.id(), ctx.vcpu.id(), old, new);
    if (old ^ new).intersects(CR0_PAGING) {
        ctx.vcpu.make_request(PendingRequest::EPT_FLUSH);
    }
    ctx.arch.cr0 = new;
    Ok(true)
}

/// Load guest CR4 with `value`.
///
/// Returns false if the value is illegal; #GP is injected then.
pub(super) fn set_cr4(ctx: &mut ExitContext<'_>, value: u64) -> Result<bool, VmError> {
    let new = match Cr4::from_bits(value) {
        // VMX is not exposed to guests.
        Some(new) if !new.contains(Cr4::VMXE) => new,
        _ => {
            ctx.inject_gp();
            return Ok(false);
        }
    };
    let vmcs = ctx.vmcs();
    let long_mode = ctx.vcpu.efer()?.contains(Efer::LMA);
    if long_mode && !new.contains(Cr4::PAE) {
        ctx.inject_gp();
        return Ok(false);
    }
    if new.contains(Cr4::PCIDE)
        && !ctx.arch.cr4.contains(Cr4::PCIDE)
        && (!long_mode || vmcs.read(Field::GuestCr3)? & CR3_PCID_MASK != 0)
    {
        ctx.inject_gp();
        return Ok(false);
    }

    vmcs.write(Field::GuestCr4, (new | Cr4::VMXE).bits())?;
    vmcs.write(Field::Cr4ReadShadow, new.bits())?;
    if (ctx.arch.cr4 ^ new).intersects(CR4_PAGING) {
        ctx.vcpu.make_request(PendingRequest::EPT_FLUSH);
    }
    ctx.arch.cr4 = new;
    Ok(true)
}
