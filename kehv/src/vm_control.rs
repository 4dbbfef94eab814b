//! Flags and MSRs for VMX capabilities.
use crate::{
    vmcs::{Field, VmcsAccess},
    VmError,
};
use abyss::platform::Platform;
use kecore::HvError;

// VMX Capalibility MSRs
/// Basic VMX information.
pub const IA32_VMX_BASIC: u32 = 0x480;
/// Capability MSR for pin-based VM-execution controls.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
/// Capability MSR for primary processor-based VM-execution controls.
pub const IA32_VMX_PROC_BASED_CTLS: u32 = 0x482;
/// Capability MSR for secondary processor-based VM-execution controls.
pub const IA32_VMX_PROC_BASED_CTLS2: u32 = 0x48B;
/// Capability MSR for VM-exit controls.
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
/// Capability MSR for VM-entry controls.
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
/// Capability MSR for EPT and VPID.
pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x48C;

bitflags::bitflags! {
    /// Pin-based VM-execution controls.
    ///
    /// See Table 24-5. Definitions of Pin-Based VM-Execution Controls
    pub struct VmcsPinBasedVmexecCtl: u32 {
        /// External interrupts cause VM exits.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// NMIs cause VM exits.
        const NMI_EXITING = 1 << 3;
        /// Virtual NMIs.
        const VIRTUAL_NMIS = 1 << 5;
        /// VMX preemption timer.
        const ACTIVE_VMX_PREEMPTION_TIMER = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Primary processor-based VM-execution controls.
    ///
    /// See Table 24-6. Definitions of Primary Processor-Based VM-Execution Controls
    pub struct VmcsProcBasedVmexecCtl: u32 {
        /// Exit at the beginning of the interrupt window.
        const INTRWINEXIT = 1 << 2;
        /// Use TSC offsetting.
        const USETSCOFF = 1 << 3;
        /// HLT causes VM exits.
        const HLT_EXITING = 1 << 7;
        /// INVLPG causes VM exits.
        const INVLPGEXIT = 1 << 9;
        /// RDTSC causes VM exits.
        const RDTSCEXIT = 1 << 12;
        /// MOV to CR3 causes VM exits.
        const CR3LOADEXIT = 1 << 15;
        /// MOV from CR3 causes VM exits.
        const CR3STOREXIT = 1 << 16;
        /// Exit at the beginning of the NMI window.
        const NMIWINEXIT = 1 << 22;
        /// Every I/O instruction causes VM exits.
        const UNCONDIOEXIT = 1 << 24;
        /// Use I/O bitmaps.
        const USEIOBMP = 1 << 25;
        /// Use MSR bitmaps.
        const USEMSRBMP = 1 << 28;
        /// Activate secondary controls.
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Secondary processor-based VM-execution controls.
    ///
    /// See Table 24-7. Definitions of Secondary Processor-Based VM-Execution Controls
    pub struct VmcsProcBasedSecondaryVmexecCtl: u32 {
        /// Virtualize APIC accesses.
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        /// Enable EPT.
        const ENABLE_EPT = 1 << 1;
        /// Enable RDTSCP.
        const ENABLE_RDTSCP = 1 << 3;
        /// Enable VPID.
        const ENABLE_VPID = 1 << 5;
        /// WBINVD causes VM exits.
        const WBINVD_EXITING = 1 << 6;
        /// Unrestricted guest.
        const UNRESTRICTED_GUEST = 1 << 7;
        /// RDRAND causes VM exits.
        const RDRAND_EXITING = 1 << 11;
        /// Enable INVPCID.
        const ENABLE_INVPCID = 1 << 12;
        /// Enable XSAVES/XRSTORS.
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
    }
}

bitflags::bitflags! {
    /// VM-entry controls.
    ///
    /// See Table 24-13. Definitions of VM-Entry Controls
    pub struct VmcsEntryCtl: u32 {
        /// Load debug controls.
        const LOAD_DEBUG_CTL = 1 << 2;
        /// The guest is in IA-32e mode after entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// Load IA32_PAT.
        const LOAD_IA32_PAT = 1 << 14;
        /// Load IA32_EFER.
        const LOAD_IA32_EFER = 1 << 15;
    }
}

bitflags::bitflags! {
    /// VM-exit controls.
    ///
    /// See Table 24-11. Definitions of VM-Exit Controls
    pub struct VmcsExitCtl: u32 {
        /// Save debug controls.
        const SAVE_DEBUG_CTLS = 1 << 2;
        /// The host is in 64-bit mode after exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// Acknowledge the external interrupt on exit.
        const ACK_INTR_ON_EXIT = 1 << 15;
        /// Save IA32_PAT.
        const SAVE_IA32_PAT = 1 << 18;
        /// Load IA32_PAT.
        const LOAD_IA32_PAT = 1 << 19;
        /// Save IA32_EFER.
        const SAVE_IA32_EFER = 1 << 20;
        /// Load IA32_EFER.
        const LOAD_IA32_EFER = 1 << 21;
    }
}

/// Clamp `desired` to what the capability MSR `msr` permits.
///
/// The low half of a capability MSR holds the bits that must be 1, the high
/// half the bits that may be 1.
pub fn adjust_controls(platform: &dyn Platform, msr: u32, desired: u32) -> u32 {
    let cap = platform.read_msr(msr);
    let (must_be_1, may_be_1) = (cap as u32, (cap >> 32) as u32);
    (desired | must_be_1) & may_be_1
}

/// The VM-execution, exit and entry controls of every vcpu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxControls {
    /// Pin-based controls.
    pub pin: VmcsPinBasedVmexecCtl,
    /// Primary processor-based controls.
    pub proc: VmcsProcBasedVmexecCtl,
    /// Secondary processor-based controls.
    pub proc2: VmcsProcBasedSecondaryVmexecCtl,
    /// Exit controls.
    pub exit: VmcsExitCtl,
    /// Entry controls.
    pub entry: VmcsEntryCtl,
}

impl VmxControls {
    /// Controls this hypervisor runs guests with, adjusted to the processor.
    ///
    /// Fails with `Unsupported` if the processor lacks EPT, secondary
    /// controls or a 64-bit host on exit.
    pub fn compute(platform: &dyn Platform) -> Result<Self, VmError> {
        let pin = VmcsPinBasedVmexecCtl::from_bits_truncate(adjust_controls(
            platform,
            IA32_VMX_PINBASED_CTLS,
            (VmcsPinBasedVmexecCtl::EXTERNAL_INTERRUPT_EXITING | VmcsPinBasedVmexecCtl::NMI_EXITING)
                .bits(),
        ));
        let proc = VmcsProcBasedVmexecCtl::from_bits_truncate(adjust_controls(
            platform,
            IA32_VMX_PROC_BASED_CTLS,
            (VmcsProcBasedVmexecCtl::HLT_EXITING
                | VmcsProcBasedVmexecCtl::UNCONDIOEXIT
                | VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL)
                .bits(),
        ));
        let proc2 = VmcsProcBasedSecondaryVmexecCtl::from_bits_truncate(adjust_controls(
            platform,
            IA32_VMX_PROC_BASED_CTLS2,
            (VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT
                | VmcsProcBasedSecondaryVmexecCtl::ENABLE_RDTSCP
                | VmcsProcBasedSecondaryVmexecCtl::UNRESTRICTED_GUEST
                | VmcsProcBasedSecondaryVmexecCtl::ENABLE_INVPCID)
                .bits(),
        ));
        let exit = VmcsExitCtl::from_bits_truncate(adjust_controls(
            platform,
            IA32_VMX_EXIT_CTLS,
            (VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE
                | VmcsExitCtl::ACK_INTR_ON_EXIT
                | VmcsExitCtl::SAVE_IA32_PAT
                | VmcsExitCtl::LOAD_IA32_PAT
                | VmcsExitCtl::SAVE_IA32_EFER
                | VmcsExitCtl::LOAD_IA32_EFER)
                .bits(),
        ));
        let entry = VmcsEntryCtl::from_bits_truncate(adjust_controls(
            platform,
            IA32_VMX_ENTRY_CTLS,
            (VmcsEntryCtl::LOAD_IA32_PAT | VmcsEntryCtl::LOAD_IA32_EFER).bits(),
        ));

        if !proc.contains(VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL)
            || !proc2.contains(VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT)
            || !exit.contains(VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE)
        {
            log::error!("vmx: processor lacks EPT or 64-bit host support");
            return Err(HvError::Unsupported.into());
        }
        Ok(Self {
            pin,
            proc,
            proc2,
            exit,
            entry,
        })
    }

    /// Write the controls into `vmcs`.
    pub fn apply(&self, vmcs: &dyn VmcsAccess) -> Result<(), VmError> {
        vmcs.write(Field::PinBasedExecControls, self.pin.bits() as u64)?;
        vmcs.write(Field::ProcessorBasedVmexecControls, self.proc.bits() as u64)?;
        vmcs.write(Field::SecondaryVmexecControls, self.proc2.bits() as u64)?;
        vmcs.write(Field::VmexitControls, self.exit.bits() as u64)?;
        vmcs.write(Field::VmentryControls, self.entry.bits() as u64)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::vmcs::SoftVmcs;
    use abyss::platform::mock::MockPlatform;

    /// A processor that allows every control and forces none.
    pub(crate) fn permissive_vmx(platform: &MockPlatform) {
        for msr in [
            IA32_VMX_PINBASED_CTLS,
            IA32_VMX_PROC_BASED_CTLS,
            IA32_VMX_PROC_BASED_CTLS2,
            IA32_VMX_EXIT_CTLS,
            IA32_VMX_ENTRY_CTLS,
        ] {
            platform.set_msr(msr, 0xffff_ffff_0000_0000);
        }
    }

    #[test]
    fn controls_follow_capabilities() {
        let platform = MockPlatform::new();
        // Bit 1 forced on, only bits 0..8 may be set.
        platform.set_msr(IA32_VMX_PINBASED_CTLS, (0xff << 32) | 0x2);
        assert_eq!(adjust_controls(&platform, IA32_VMX_PINBASED_CTLS, 0x109), 0x0b);

        permissive_vmx(&platform);
        let controls = VmxControls::compute(&platform).unwrap();
        assert!(controls
            .proc
            .contains(VmcsProcBasedVmexecCtl::HLT_EXITING | VmcsProcBasedVmexecCtl::UNCONDIOEXIT));
        let vmcs = SoftVmcs::new();
        controls.apply(&vmcs).unwrap();
        assert_eq!(
            vmcs.read(Field::SecondaryVmexecControls).unwrap() as u32,
            controls.proc2.bits()
        );
    }

    #[test]
    fn missing_ept_is_unsupported() {
        let platform = MockPlatform::new();
        permissive_vmx(&platform);
        platform.set_msr(IA32_VMX_PROC_BASED_CTLS2, 0);
        assert_eq!(
            VmxControls::compute(&platform),
            Err(VmError::Hv(HvError::Unsupported))
        );
    }
}
