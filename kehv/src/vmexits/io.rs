use super::{ExitContext, VmexitResult};
use crate::{vmcs::IoQualification, VmError};

fn size_mask(size: u8) -> u64 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

/// IN/OUT on a port.
///
/// Ports without a handler and string instructions raise #GP in the guest.
pub(super) fn pio_instr_vmexit_handler(ctx: &mut ExitContext<'_>) -> Result<VmexitResult, VmError> {
    let q = IoQualification::from(ctx.qualification);
    if q.string {
        log::warn!(
            "VM{}:vcpu{}: string io on port 0x{:x} is not emulated",
            ctx.vm.id(),
            ctx.vcpu.id(),
            q.port
        );
        ctx.inject_gp();
        return Ok(VmexitResult::Continue);
    }
    let handler = match ctx.vm.io().find_pio(q.port) {
        Some(handler) => handler,
        None => {
            log::debug!(
                "VM{}: {:?}",
                ctx.vm.id(),
                VmError::UnhandledIo(q.port)
            );
            ctx.inject_gp();
            return Ok(VmexitResult::Continue);
        }
    };

    let mask = size_mask(q.size);
    let gprs = &mut ctx.arch.gprs;
    if q.input {
        let value = handler.read(q.port, q.size) as u64 & mask;
        // A 32-bit IN clears the upper half of rax like any 32-bit write.
        gprs.rax = if q.size == 4 {
            value
        } else {
            (gprs.rax & !mask) | value
        };
    } else {
        handler.write(q.port, q.size, (gprs.rax & mask) as u32);
    }
    ctx.forward_rip()?;
    Ok(VmexitResult::Continue)
}
