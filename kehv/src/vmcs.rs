//! Virtual-Machine Control State (VMCS) related apis.
//!
//! Handlers reach the VMCS of the current vcpu through [`VmcsAccess`]. On the
//! bare-metal target it is the hardware VMCS loaded on the pCPU
//! ([`ActiveVmcs`]); in hosted runs it is a [`SoftVmcs`].
use crate::{vm::Gpa, VmError};
use alloc::collections::BTreeMap;
use spin_lock::SpinLock;

/// Possible errors for vm-related instructions.
///
/// # Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 30-1. Vm-Instruction Error Numbers.
#[repr(u32)]
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, num_enum::FromPrimitive)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation
    VmcallInVmxRoot = 1,
    /// VMCLEAR with invalid physical address
    VmclearWithInvAddr = 2,
    /// VMCLEAR with VMXON pointer
    VmclearWithVmxon = 3,
    /// VMLAUNCH with non-clear VMCS
    VmlaunchWithNonclearVmcs = 4,
    /// VMRESUME with non-launched VMCS
    VmresumeWithNonlaunchedVmcs = 5,
    /// VMRESUME after VMXOFF
    VmresumeAfterVmxoff = 6,
    /// VM entry with invalid control field(s)
    InvalidCs = 7,
    /// VM entry with invalid host-state field(s)
    InvalidHostState = 8,
    /// VMPTRLD with invalid physical address
    VmPtrLdWithInvAddr = 9,
    /// VMPTRLD with VMXON pointer
    VmPtrLdWithVmxOn = 10,
    /// VMPTRLD with incorrect VMCS revision identifier
    VmPtrLdWithIncorrectRevId = 11,
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedVmcsField = 12,
    /// VMWRITE to read-only VMCS component
    WriteToRoField = 13,
    /// VMXON executed in VMX root operation
    VmxonInVmxRoot = 15,
    /// VM entry with invalid executive-VMCS pointer
    VmEntryWithInvalidExecVmcs = 16,
    /// VM entry with non-launched executive VMCS
    VmEntryWithNonlaunchedExecVmcs = 17,
    /// VM entry with executive-VMCS pointer not VMXON pointer
    VmEntryWithExecVmcs = 18,
    /// VMCALL with non-clear VMCS
    VmcallWithNonclearVmcs = 19,
    /// VMCALL with invalid VM-exit control fields
    VmcallWithInvVmexitCs = 20,
    /// VMCALL with incorrect MSEG revision identifier
    VmcallWithIncorrectMsegRevId = 22,
    /// VMXOFF under dual-monitor treatment of SMIs and SMM
    VmxoffUnderDualMonitorTreatment = 23,
    /// VMCALL with invalid SMM-monitor features
    VmcallWithInvSmmMonitor = 24,
    /// VM entry with invalid VM-execution control fields in executive VMCS
    VmentryWithInvVmExecCs = 25,
    /// VM entry with events blocked by MOV SS.
    VmentryWithEventBlockedByMovss = 26,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidOperandToInveptInvvpid = 28,
    /// Unknown error.
    #[num_enum(default)]
    Unknown = 0xffff,
}

/// Vmcs field.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum Field {
    // 16bit fields
    Vpid = 0x00000000,
    GuestCsSelector = 0x00000802,
    GuestSsSelector = 0x00000804,
    // 64bit fields
    IoBitmapA = 0x00002000,
    IoBitmapB = 0x00002002,
    MsrBitmaps = 0x00002004,
    TscOffset = 0x00002010,
    Eptptr = 0x0000201A,
    GuestPhysicalAddr = 0x00002400,
    GuestLinkPointer = 0x00002800,
    GuestIa32Pat = 0x00002804,
    GuestIa32Efer = 0x00002806,
    HostIa32Pat = 0x00002C00,
    HostIa32Efer = 0x00002C02,
    // 32bit fields
    PinBasedExecControls = 0x00004000,
    ProcessorBasedVmexecControls = 0x00004002,
    ExceptionBitmap = 0x00004004,
    VmexitControls = 0x0000400C,
    VmentryControls = 0x00004012,
    VmentryInterruptionInfo = 0x00004016,
    VmentryExceptionErrCode = 0x00004018,
    VmentryInstructionLength = 0x0000401A,
    SecondaryVmexecControls = 0x0000401E,
    InstructionError = 0x00004400,
    VmexitReason = 0x00004402,
    VmexitInterruptionInfo = 0x00004404,
    VmexitInterruptionErrCode = 0x00004406,
    IdtVectoringInfo = 0x00004408,
    IdtVectoringErrCode = 0x0000440A,
    VmexitInstructionLength = 0x0000440C,
    VmexitInstructionInfo = 0x0000440E,
    GuestCsAccessRights = 0x00004816,
    GuestSsAccessRights = 0x00004818,
    GuestInterruptibilityState = 0x00004824,
    GuestActivityState = 0x00004826,
    // Natural-width fields
    Cr0GuestHostMask = 0x00006000,
    Cr4GuestHostMask = 0x00006002,
    Cr0ReadShadow = 0x00006004,
    Cr4ReadShadow = 0x00006006,
    VmexitQualification = 0x00006400,
    GuestLinearAddr = 0x0000640A,
    GuestCr0 = 0x00006800,
    GuestCr3 = 0x00006802,
    GuestCr4 = 0x00006804,
    GuestRsp = 0x0000681C,
    GuestRip = 0x0000681E,
    GuestRflags = 0x00006820,
    HostCr0 = 0x00006C00,
    HostCr3 = 0x00006C02,
    HostCr4 = 0x00006C04,
    HostRsp = 0x00006C14,
    HostRip = 0x00006C16,
}

/// Access to the VMCS of the running vcpu.
pub trait VmcsAccess: Send + Sync {
    /// Read from the vmcs field.
    fn read(&self, field: Field) -> Result<u64, VmError>;

    /// Write to the vmcs field.
    fn write(&self, field: Field, v: u64) -> Result<(), VmError>;

    /// Forward to the next instruction.
    fn forward_rip(&self) -> Result<(), VmError> {
        self.write(
            Field::GuestRip,
            self.read(Field::GuestRip)? + self.read(Field::VmexitInstructionLength)?,
        )
    }

    /// Resolve the exit reason.
    fn exit_reason(&self) -> Result<ExitReason, VmError> {
        Ok(ExitReason::from_raw(self.read(Field::VmexitReason)?))
    }
}

/// A VMCS kept in memory.
///
/// Unwritten fields read as zero.
#[derive(Default)]
pub struct SoftVmcs {
    fields: SpinLock<BTreeMap<u32, u64>>,
}

impl SoftVmcs {
    /// An all-zero vmcs.
    pub fn new() -> Self {
        Self::default()
    }
}

impl VmcsAccess for SoftVmcs {
    fn read(&self, field: Field) -> Result<u64, VmError> {
        Ok(self
            .fields
            .lock()
            .get(&(field as u32))
            .copied()
            .unwrap_or(0))
    }

    fn write(&self, field: Field, v: u64) -> Result<(), VmError> {
        self.fields.lock().insert(field as u32, v);
        Ok(())
    }
}

#[cfg(target_os = "none")]
pub use hw::{ActiveVmcs, Vmcs};

#[cfg(target_os = "none")]
mod hw {
    use super::{Field, InstructionError, VmcsAccess};
    use crate::VmError;
    use abyss::{
        addressing::Pa,
        x86_64::msr::{Msr, IA32_VMX_BASIC},
    };
    use core::arch::asm;

    /// Virtual Machine Control State.
    ///
    /// ## Details
    /// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, 24.2 FORTMAT OF VMCS.
    #[repr(C, align(4096))]
    pub struct Vmcs {
        /// Bits 30:0: VMCS revision identifier
        /// Bit 31: shadow-VMCS indicator
        rev_id: u32,
        /// VMX-abort indicator
        indicator: u32,
        _data: [u8; 0x1000 - 8],
    }

    impl Vmcs {
        /// Create a new Vmcs region with the revision of this processor.
        pub fn new() -> Self {
            Self {
                rev_id: Msr::<IA32_VMX_BASIC>::read() as u32 & 0x7fff_ffff,
                indicator: 0,
                _data: [0; 0x1000 - 8],
            }
        }

        /// Read the error of the last failed vmx instruction.
        pub fn instruction_error() -> InstructionError {
            let v: u64;
            unsafe {
                asm!("vmread {}, {}", out(reg) v, in(reg) Field::InstructionError as u64);
            }
            InstructionError::from(v as u32)
        }

        fn check(err: u8) -> Result<(), VmError> {
            if err != 0 {
                Err(VmError::InstructionError(Self::instruction_error()))
            } else {
                Ok(())
            }
        }

        /// Clear the launch state of the region at `pa`.
        pub fn clear(pa: Pa) -> Result<(), VmError> {
            let err: u8;
            let pa = pa.into_usize() as u64;
            unsafe {
                asm!(
                    "clc",
                    "vmclear [{}]",
                    "setna {}",
                    in(reg) &pa,
                    out(reg_byte) err,
                );
            }
            Self::check(err)
        }

        /// Make the region at `pa` the current vmcs of this pCPU.
        pub fn activate(pa: Pa) -> Result<ActiveVmcs, VmError> {
            let err: u8;
            let pa = pa.into_usize() as u64;
            unsafe {
                asm!(
                    "clc",
                    "vmptrld [{}]",
                    "setna {}",
                    in(reg) &pa,
                    out(reg_byte) err,
                );
            }
            Self::check(err).map(|_| ActiveVmcs { _p: () })
        }

        /// Invalidate the translations derived from the EPT `eptp`
        /// (single-context INVEPT).
        pub fn invept(eptp: u64) -> Result<(), VmError> {
            let err: u8;
            let desc: [u64; 2] = [eptp, 0];
            unsafe {
                asm!(
                    "clc",
                    "invept {}, [{}]",
                    "setna {}",
                    in(reg) 1u64,
                    in(reg) &desc,
                    out(reg_byte) err,
                );
            }
            Self::check(err)
        }

        /// Invalidate the translations tagged with `vpid`
        /// (single-context INVVPID).
        pub fn invvpid(vpid: u16) -> Result<(), VmError> {
            let err: u8;
            let desc: [u64; 2] = [vpid as u64, 0];
            unsafe {
                asm!(
                    "clc",
                    "invvpid {}, [{}]",
                    "setna {}",
                    in(reg) 1u64,
                    in(reg) &desc,
                    out(reg_byte) err,
                );
            }
            Self::check(err)
        }
    }

    /// A representation of active vmcs.
    pub struct ActiveVmcs {
        _p: (),
    }

    impl ActiveVmcs {
        /// Handle to whatever vmcs is current on the executing pCPU.
        pub(crate) const fn current() -> Self {
            Self { _p: () }
        }
    }

    impl VmcsAccess for ActiveVmcs {
        fn write(&self, field: Field, v: u64) -> Result<(), VmError> {
            let err: u8;
            unsafe {
                asm!(
                    "clc",
                    "vmwrite {}, {}",
                    "setna {}",
                    in(reg) field as u64,
                    in(reg) v,
                    out(reg_byte) err
                );
            }
            Vmcs::check(err)
        }

        fn read(&self, field: Field) -> Result<u64, VmError> {
            let err: u8;
            let v: u64;
            unsafe {
                asm!(
                    "clc",
                    "vmread {}, {}",
                    "setna {}",
                    out(reg) v,
                    in(reg) field as u64,
                    out(reg_byte) err
                );
            }
            Vmcs::check(err).map(|_| v)
        }
    }
}

/// Interruption type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, num_enum::TryFromPrimitive)]
pub enum InterruptionType {
    /// External interrupt.
    ExternalInt = 0,
    /// Non-maskable interrupt.
    Nmi = 2,
    /// Hardware exception.
    HardwareException = 3,
    /// Software interrupt.
    SoftwareInt = 4,
    /// Privileged software exception.
    PrivSoftwareException = 5,
    /// Software exception.
    SoftwareException = 6,
}

/// External Interrupt Information
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ExternalIntInfo {
    /// Vector of interrupt or exception: BIT 7~0
    pub host_int: u8,
    /// Interruption type: BIT 10~8
    pub interruption_type: InterruptionType,
    /// Error code is valid: BIT 11.
    pub error_code_valid: bool,
    /// NMI unblocking due to IRET: BIT 12.
    pub nmi_unblocked_by_iret: bool,
}

impl ExternalIntInfo {
    /// Decode the VM-exit interruption-information field.
    ///
    /// See Table 24-18. Format of the VM-Exit Interruption-Information Field
    pub fn from_raw(info: u32) -> Option<Self> {
        if info & 0x8000_0000 == 0 {
            return None;
        }
        Some(Self {
            host_int: info as u8,
            interruption_type: InterruptionType::try_from(((info >> 8) & 7) as u8).ok()?,
            error_code_valid: info & (1 << 11) != 0,
            nmi_unblocked_by_iret: info & (1 << 12) != 0,
        })
    }
}

/// Encode the VM-entry interruption-information field for an event.
pub const fn entry_interruption_info(vector: u8, ty: InterruptionType, has_error: bool) -> u32 {
    (1 << 31) | ((has_error as u32) << 11) | ((ty as u32) << 8) | vector as u32
}

/// Possible list of basic vmexit reasons.
///
/// See Table C-1. Basic Exit Reasons for details.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, num_enum::FromPrimitive)]
#[allow(missing_docs)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0x0,
    ExternalInt = 0x1,
    TripleFault = 0x2,
    InitSignal = 0x3,
    StartupIpi = 0x4,
    IoSmi = 0x5,
    OtherSmi = 0x6,
    InterruptWindow = 0x7,
    NmiWindow = 0x8,
    TaskSwitch = 0x9,
    Cpuid = 0xA,
    Getsec = 0xB,
    Hlt = 0xC,
    Invd = 0xD,
    Invlpg = 0xE,
    Rdpmc = 0xF,
    Rdtsc = 0x10,
    Rsm = 0x11,
    Vmcall = 0x12,
    Vmclear = 0x13,
    Vmlaunch = 0x14,
    Vmptrld = 0x15,
    Vmptrst = 0x16,
    Vmread = 0x17,
    Vmresume = 0x18,
    Vmwrite = 0x19,
    Vmxoff = 0x1A,
    Vmxon = 0x1B,
    MovCr = 0x1C,
    MovDr = 0x1D,
    IoInstruction = 0x1E,
    Rdmsr = 0x1F,
    Wrmsr = 0x20,
    EntfailGuestState = 0x21,
    EntfailMsrLoading = 0x22,
    Mwait = 0x24,
    Mtf = 0x25,
    Monitor = 0x27,
    Pause = 0x28,
    EntfailMachineChk = 0x29,
    TprBelowThreshold = 0x2B,
    ApicAccess = 0x2C,
    VirtualizedEoi = 0x2D,
    AccessGdtrOrIdtr = 0x2E,
    AccessLdtrOrTr = 0x2F,
    EptViolation = 0x30,
    EptMisconfig = 0x31,
    Invept = 0x32,
    Rdtscp = 0x33,
    VmxPreemptTimer = 0x34,
    Invvpid = 0x35,
    Wbinvd = 0x36,
    Xsetbv = 0x37,
    ApicWrite = 0x38,
    Rdrand = 0x39,
    Invpcid = 0x3A,
    Vmfunc = 0x3B,
    Encls = 0x3C,
    Rdseed = 0x3D,
    PmlFull = 0x3E,
    Xsaves = 0x3F,
    Xrstors = 0x40,
    #[num_enum(default)]
    Unknown = 0xffff,
}

/// Enumeration of vmexit reasons.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExitReason {
    /// Exit during the run.
    BasicExitReason(BasicExitReason),
    /// Failed on vmlaunch or vmresume.
    EntryFailure(BasicExitReason),
    /// Exit from vmx root operation.
    ExitFromVmxRootOperation(BasicExitReason),
}

impl ExitReason {
    /// Decode the exit-reason field.
    pub fn from_raw(reason: u64) -> Self {
        let basic = BasicExitReason::from(reason as u16);
        if reason & 0x8000_0000 != 0 {
            Self::EntryFailure(basic)
        } else if reason & 0x2000_0000 != 0 {
            Self::ExitFromVmxRootOperation(basic)
        } else {
            Self::BasicExitReason(basic)
        }
    }

    /// get basic exit reason of the exit reason.
    pub fn get_basic_reason(&self) -> &BasicExitReason {
        match self {
            Self::BasicExitReason(e)
            | Self::EntryFailure(e)
            | Self::ExitFromVmxRootOperation(e) => e,
        }
    }
}

bitflags::bitflags! {
    /// Exit Qualification for EPT Violations
    ///
    /// See Intel Manual volume 3C. Table 28-7. Exit Qualification for EPT Violations
    pub struct EptViolationQualification: u64 {
        /// Set if the access causing the EPT violation was a data read.
        const READ = 1 << 0;
        /// Set if the access causing the EPT violation was a data write.
        const WRITE = 1 << 1;
        /// Set if the access causing the EPT violation was an instruction fetch.
        const FETCH = 1 << 2;
        /// Whether the guest-physical address was readable.
        const READABLE = 1 << 3;
        /// Whether the guest-physical address was writeable.
        const WRITABLE = 1 << 4;
        /// Whether the guest-physical address was executable.
        const EXECUTABLE = 1 << 5;
        /// Set if the guest linear-address field is valid.
        const GLA_VALID = 1 << 7;
        /// The access is the translation of a linear address, not a page walk.
        const GLA_TRANSLATED = 1 << 8;
        /// NMI unblocking due to IRET.
        const NMI_UNBLOCKING = 1 << 12;
    }
}

impl EptViolationQualification {
    /// Returns true if the faulting access was present in the EPT with some
    /// rights.
    #[inline]
    pub fn was_mapped(&self) -> bool {
        self.intersects(Self::READABLE | Self::WRITABLE | Self::EXECUTABLE)
    }
}

/// Access type of a control-register access.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, num_enum::TryFromPrimitive)]
pub enum CrAccessType {
    /// MOV to CR.
    MovToCr = 0,
    /// MOV from CR.
    MovFromCr = 1,
    /// CLTS.
    Clts = 2,
    /// LMSW.
    Lmsw = 3,
}

/// Exit qualification for control-register accesses.
///
/// See Table 28-3. Exit Qualification for Control-Register Accesses
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CrAccessQualification {
    /// Number of the control register.
    pub cr: u8,
    /// Access type.
    pub access_type: CrAccessType,
    /// General purpose register operand, in x86 encoding.
    pub gpr: usize,
    /// Source data of LMSW.
    pub lmsw_source: u16,
}

impl From<u64> for CrAccessQualification {
    fn from(q: u64) -> Self {
        Self {
            cr: (q & 0xf) as u8,
            access_type: match (q >> 4) & 3 {
                0 => CrAccessType::MovToCr,
                1 => CrAccessType::MovFromCr,
                2 => CrAccessType::Clts,
                _ => CrAccessType::Lmsw,
            },
            gpr: ((q >> 8) & 0xf) as usize,
            lmsw_source: (q >> 16) as u16,
        }
    }
}

/// Exit qualification for I/O instructions.
///
/// See Table 28-5. Exit Qualification for I/O Instructions
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct IoQualification {
    /// Size of access in bytes.
    pub size: u8,
    /// IN or INS.
    pub input: bool,
    /// INS or OUTS.
    pub string: bool,
    /// REP prefixed.
    pub rep: bool,
    /// Port number.
    pub port: u16,
}

impl From<u64> for IoQualification {
    fn from(q: u64) -> Self {
        Self {
            size: ((q & 7) + 1) as u8,
            input: q & (1 << 3) != 0,
            string: q & (1 << 4) != 0,
            rep: q & (1 << 5) != 0,
            port: (q >> 16) as u16,
        }
    }
}

/// Fault address of an EPT violation.
pub fn fault_gpa(vmcs: &dyn VmcsAccess) -> Result<Gpa, VmError> {
    let gpa = vmcs.read(Field::GuestPhysicalAddr)? as usize;
    Gpa::new(gpa).ok_or(VmError::FailedToDecodeInstruction)
}
