//! Emulation of guest accesses to emulated device memory.
//!
//! An access to a guest physical range with an [`MmioHandler`] traps as an EPT
//! violation. The instruction at guest rip is fetched through the probe,
//! decoded with iced-x86 and replayed against the handler. Plain `MOV` loads
//! and stores and `MOVZX` loads cover what device drivers emit for register
//! accesses.
use crate::{
    io::MmioHandler,
    probe::Probe,
    vm::{Gpa, Gva},
    VmError,
};
use abyss::{addressing::PAGE_SIZE, interrupt::GeneralPurposeRegisters};
use iced_x86::{Code, Decoder, DecoderOptions, Instruction, OpKind, Register};

/// The longest x86 instruction.
pub const MAX_INSN_LEN: usize = 15;

const GPR8: [Register; 16] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::SPL,
    Register::BPL,
    Register::SIL,
    Register::DIL,
    Register::R8L,
    Register::R9L,
    Register::R10L,
    Register::R11L,
    Register::R12L,
    Register::R13L,
    Register::R14L,
    Register::R15L,
];

const GPR16: [Register; 16] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
    Register::R8W,
    Register::R9W,
    Register::R10W,
    Register::R11W,
    Register::R12W,
    Register::R13W,
    Register::R14W,
    Register::R15W,
];

const GPR32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const GPR64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

/// A general purpose register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GprOperand {
    /// Register number in x86 encoding.
    pub index: usize,
    /// Width in bytes.
    pub size: u8,
    /// AH, CH, DH or BH.
    pub high8: bool,
}

impl GprOperand {
    /// Operand for `reg`, if it is a general purpose register.
    pub fn from_register(reg: Register) -> Option<Self> {
        let high = [Register::AH, Register::CH, Register::DH, Register::BH];
        if let Some(index) = high.iter().position(|r| *r == reg) {
            return Some(Self {
                index,
                size: 1,
                high8: true,
            });
        }
        [(1, &GPR8), (2, &GPR16), (4, &GPR32), (8, &GPR64)]
            .into_iter()
            .find_map(|(size, table)| {
                table.iter().position(|r| *r == reg).map(|index| Self {
                    index,
                    size,
                    high8: false,
                })
            })
    }

    /// Current value, zero-extended.
    pub fn read(&self, gprs: &GeneralPurposeRegisters) -> u64 {
        let v = gprs.get(self.index);
        match (self.size, self.high8) {
            (1, true) => (v >> 8) & 0xff,
            (1, false) => v & 0xff,
            (2, _) => v & 0xffff,
            (4, _) => v & 0xffff_ffff,
            _ => v,
        }
    }

    /// Store `value` the way a `MOV` to this register does: 8 and 16-bit
    /// writes keep the upper bits, 32-bit writes clear them.
    pub fn write(&self, gprs: &mut GeneralPurposeRegisters, value: u64) {
        let old = gprs.get(self.index);
        let new = match (self.size, self.high8) {
            (1, true) => (old & !0xff00) | ((value & 0xff) << 8),
            (1, false) => (old & !0xff) | (value & 0xff),
            (2, _) => (old & !0xffff) | (value & 0xffff),
            (4, _) => value & 0xffff_ffff,
            _ => value,
        };
        gprs.set(self.index, new);
    }
}

/// Direction of an emulated access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioOp {
    /// Store of a value.
    Write {
        /// The stored value, truncated to the access size.
        value: u64,
    },
    /// Load into a register.
    Read {
        /// Destination; wider than the access for `MOVZX`.
        dst: GprOperand,
    },
}

/// A decoded memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioInstruction {
    /// Access size in bytes.
    pub size: u8,
    /// Direction.
    pub op: MmioOp,
    /// Instruction length.
    pub len: usize,
}

fn mask(size: u8) -> u64 {
    match size {
        8 => u64::MAX,
        s => (1u64 << (s as u32 * 8)) - 1,
    }
}

fn access_size(code: Code) -> Option<u8> {
    Some(match code {
        Code::Mov_rm8_r8 | Code::Mov_r8_rm8 | Code::Mov_rm8_imm8 => 1,
        Code::Movzx_r16_rm8 | Code::Movzx_r32_rm8 | Code::Movzx_r64_rm8 => 1,
        Code::Mov_rm16_r16 | Code::Mov_r16_rm16 | Code::Mov_rm16_imm16 => 2,
        Code::Movzx_r16_rm16 | Code::Movzx_r32_rm16 | Code::Movzx_r64_rm16 => 2,
        Code::Mov_rm32_r32 | Code::Mov_r32_rm32 | Code::Mov_rm32_imm32 => 4,
        Code::Mov_rm64_r64 | Code::Mov_r64_rm64 | Code::Mov_rm64_imm32 => 8,
        _ => return None,
    })
}

fn source_value(insn: &Instruction, gprs: &GeneralPurposeRegisters) -> Option<u64> {
    Some(match insn.op1_kind() {
        OpKind::Register => GprOperand::from_register(insn.op1_register())?.read(gprs),
        OpKind::Immediate8 => insn.immediate8() as u64,
        OpKind::Immediate16 => insn.immediate16() as u64,
        OpKind::Immediate32 => insn.immediate32() as u64,
        OpKind::Immediate32to64 => insn.immediate32to64() as u64,
        _ => return None,
    })
}

/// Decode the access done by the instruction in `bytes`.
pub fn decode(bytes: &[u8], rip: u64, gprs: &GeneralPurposeRegisters) -> Result<MmioInstruction, VmError> {
    let mut decoder = Decoder::with_ip(64, bytes, rip, DecoderOptions::NONE);
    let insn = decoder.decode();
    if insn.is_invalid() {
        return Err(VmError::FailedToDecodeInstruction);
    }
    let size = match access_size(insn.code()) {
        Some(size) => size,
        None => {
            log::warn!("mmio: unsupported instruction {:?} at 0x{:x}", insn.code(), rip);
            return Err(VmError::FailedToDecodeInstruction);
        }
    };
    let op = match (insn.op0_kind(), insn.op1_kind()) {
        (OpKind::Memory, _) => MmioOp::Write {
            value: source_value(&insn, gprs).ok_or(VmError::FailedToDecodeInstruction)? & mask(size),
        },
        (OpKind::Register, OpKind::Memory) => MmioOp::Read {
            dst: GprOperand::from_register(insn.op0_register())
                .ok_or(VmError::FailedToDecodeInstruction)?,
        },
        _ => return Err(VmError::FailedToDecodeInstruction),
    };
    Ok(MmioInstruction {
        size,
        op,
        len: insn.len(),
    })
}

/// Replay `insn` on `handler` for an access at `gpa`.
pub fn emulate(
    insn: &MmioInstruction,
    gpa: Gpa,
    handler: &dyn MmioHandler,
    gprs: &mut GeneralPurposeRegisters,
) {
    match insn.op {
        MmioOp::Write { value } => handler.write(gpa, insn.size, value),
        MmioOp::Read { dst } => {
            let value = handler.read(gpa, insn.size) & mask(insn.size);
            dst.write(gprs, value);
        }
    }
}

/// Fetch the bytes of the instruction at `rip`.
///
/// The page of `rip` must be mapped; the following page is read only if it
/// is, since the instruction may end before it.
pub fn fetch_instruction(probe: &dyn Probe, rip: Gva) -> Result<([u8; MAX_INSN_LEN], usize), VmError> {
    let mut bytes = [0; MAX_INSN_LEN];
    let first = (PAGE_SIZE - (rip.into_usize() & (PAGE_SIZE - 1))).min(MAX_INSN_LEN);
    probe.copy_from_guest_va(rip, &mut bytes[..first])?;
    let mut len = first;
    if first < MAX_INSN_LEN && probe.copy_from_guest_va(rip + first, &mut bytes[first..]).is_ok() {
        len = MAX_INSN_LEN;
    }
    Ok((bytes, len))
}
