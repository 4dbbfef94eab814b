//! Model-specific register (MSR).

/// IA32_APIC_BASE.
pub const IA32_APIC_BASE: u32 = 0x1b;
/// IA32_FEATURE_CONTROL.
pub const IA32_FEATURE_CONTROL: u32 = 0x3a;
/// IA32_TSC_DEADLINE: one-shot deadline of the local APIC timer.
pub const IA32_TSC_DEADLINE: u32 = 0x6e0;
/// IA32_PAT.
pub const IA32_PAT: u32 = 0x277;
/// IA32_MTRR_DEF_TYPE.
pub const IA32_MTRR_DEF_TYPE: u32 = 0x2ff;
/// IA32_VMX_BASIC.
pub const IA32_VMX_BASIC: u32 = 0x480;
/// IA32_VMX_EPT_VPID_CAP.
pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x48c;
/// IA32_EFER.
pub const IA32_EFER: u32 = 0xc000_0080;
/// IA32_FS_BASE.
pub const IA32_FS_BASE: u32 = 0xc000_0100;
/// IA32_GS_BASE.
pub const IA32_GS_BASE: u32 = 0xc000_0101;
/// IA32_KERNEL_GS_BASE.
pub const IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;
/// IA32_TSC_AUX.
pub const IA32_TSC_AUX: u32 = 0xc000_0103;

/// Model specific register.
#[cfg(target_os = "none")]
pub struct Msr<const ADDR: u32>;

#[cfg(target_os = "none")]
impl<const ADDR: u32> Msr<ADDR> {
    /// Read the current value.
    #[inline(always)]
    pub fn read() -> u64 {
        read(ADDR)
    }

    /// Write to the msr.
    ///
    /// # Safety
    /// Writing an MSR changes processor state behind the compiler's back.
    #[inline(always)]
    pub unsafe fn write(v: u64) {
        write(ADDR, v)
    }
}

/// Read an msr by its index.
#[cfg(target_os = "none")]
#[inline(always)]
pub fn read(msr: u32) -> u64 {
    let hi: u32;
    let lo: u32;
    unsafe {
        core::arch::asm!("rdmsr", out("edx") hi, out("eax") lo, in("ecx") msr, options(nomem, nostack));
    }
    ((hi as u64) << 32) | (lo as u64)
}

/// Write an msr by its index.
///
/// # Safety
/// Writing an MSR changes processor state behind the compiler's back.
#[cfg(target_os = "none")]
#[inline(always)]
pub unsafe fn write(msr: u32, v: u64) {
    core::arch::asm!(
        "wrmsr",
        in("edx") (v >> 32) as u32,
        in("eax") v as u32,
        in("ecx") msr,
        options(nomem, nostack)
    );
}
