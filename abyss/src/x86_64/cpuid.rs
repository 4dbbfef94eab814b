//! CPUID leaves and feature bits.

/// Register output of one CPUID leaf.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidResult {
    /// Build from the four registers.
    pub const fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        Self { eax, ebx, ecx, edx }
    }
}

/// Basic information and highest basic leaf.
pub const LEAF_BASIC: u32 = 0x0;
/// Version and feature information.
pub const LEAF_FEATURES: u32 = 0x1;
/// Structured extended features.
pub const LEAF_EXTENDED_FEATURES: u32 = 0x7;
/// Processor extended state enumeration.
pub const LEAF_XSAVE: u32 = 0xd;
/// Hypervisor vendor leaf.
pub const LEAF_HYPERVISOR: u32 = 0x4000_0000;
/// Highest extended leaf.
pub const LEAF_EXTENDED_MAX: u32 = 0x8000_0000;
/// Extended processor signature and feature bits.
pub const LEAF_EXTENDED_FEATURES_1: u32 = 0x8000_0001;

/// Leaf 1 ECX: VMX.
pub const FEAT_1_ECX_VMX: u32 = 1 << 5;
/// Leaf 1 ECX: SMX.
pub const FEAT_1_ECX_SMX: u32 = 1 << 6;
/// Leaf 1 ECX: x2APIC.
pub const FEAT_1_ECX_X2APIC: u32 = 1 << 21;
/// Leaf 1 ECX: TSC deadline timer.
pub const FEAT_1_ECX_TSC_DEADLINE: u32 = 1 << 24;
/// Leaf 1 ECX: XSAVE.
pub const FEAT_1_ECX_XSAVE: u32 = 1 << 26;
/// Leaf 1 ECX: OSXSAVE.
pub const FEAT_1_ECX_OSXSAVE: u32 = 1 << 27;
/// Leaf 1 ECX: running under a hypervisor.
pub const FEAT_1_ECX_HYPERVISOR: u32 = 1 << 31;
/// Leaf 1 EDX: MTRR.
pub const FEAT_1_EDX_MTRR: u32 = 1 << 12;
/// Leaf 1 EDX: machine check architecture.
pub const FEAT_1_EDX_MCA: u32 = 1 << 14;
/// Leaf 7 EBX: SGX.
pub const FEAT_7_EBX_SGX: u32 = 1 << 2;
/// Leaf 7 EBX: Intel processor trace.
pub const FEAT_7_EBX_PT: u32 = 1 << 25;

/// Execute CPUID on the running processor.
#[cfg(target_arch = "x86_64")]
pub fn native(leaf: u32, subleaf: u32) -> CpuidResult {
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
    CpuidResult::new(r.eax, r.ebx, r.ecx, r.edx)
}
