//! Virtual CPU implementation.
//!
//! ## State machine
//! ```text
//!  CREATED --> INITIALIZED --> RUNNING <==> HANDLING
//!                   |             |            |
//!                   +---------> PAUSED <-------+
//!                                 |
//!            any but ZOMBIE ----> ZOMBIE
//! ```
//! RUNNING to HANDLING is the VM exit and HANDLING to RUNNING the next entry.
//! Entries pass through [`Vcpu::entry_gate`], which consumes the requests
//! other pCPUs posted into the pending-request bitmap. Cross-pCPU code never
//! touches the VMCS of a vcpu; it only posts requests and kicks the pCPU.
use crate::{
    config::VmConfig,
    vcpuid::VcpuidTable,
    vm::Gpa,
    vm_control::VmxControls,
    vmcs::{entry_interruption_info, Field, InterruptionType, VmcsAccess},
    VmError,
};
use abyss::{
    interrupt::GeneralPurposeRegisters,
    platform::Platform,
    x86_64::{Cr0, Cr4, Efer, ExceptionVector, PrivilegeLevel, Rflags},
};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use kecore::{percpu::PcpuId, sched::ThreadObject};
use spin_lock::SpinLock;

/// Lifecycle state of a vcpu.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
pub enum VcpuState {
    /// Allocated, VMCS not built.
    Created = 0,
    /// VMCS built, never entered.
    Initialized = 1,
    /// In guest context, or about to enter it.
    Running = 2,
    /// Handling a VM exit on the host side.
    Handling = 3,
    /// Parked until resumed.
    Paused = 4,
    /// Dead. Terminal.
    Zombie = 5,
}

impl VcpuState {
    /// Returns true if a vcpu in this state may move to `to`.
    pub fn can_become(self, to: VcpuState) -> bool {
        use VcpuState::*;
        match (self, to) {
            (Zombie, _) => false,
            (_, Zombie) => true,
            (Created, Initialized) => true,
            (Initialized, Running | Paused) => true,
            (Running, Handling | Paused) => true,
            (Handling, Running | Paused) => true,
            (Paused, Running) => true,
            _ => false,
        }
    }
}

bitflags::bitflags! {
    /// Requests serviced at the next VM entry.
    pub struct PendingRequest: u64 {
        /// Inject the queued exception.
        const EXCEPTION = 1 << 0;
        /// Inject an NMI.
        const NMI = 1 << 3;
        /// Invalidate EPT-derived translations.
        const EPT_FLUSH = 1 << 5;
        /// The guest triple faulted.
        const TRP_FAULT = 1 << 6;
        /// Invalidate VPID-tagged translations.
        const VPID_FLUSH = 1 << 7;
    }
}

/// An exception waiting for injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingException {
    /// Vector.
    pub vector: ExceptionVector,
    /// Error code, for vectors that push one.
    pub error_code: Option<u32>,
}

#[derive(PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
}

fn exception_class(vector: ExceptionVector) -> ExceptionClass {
    match vector {
        ExceptionVector::DivideError
        | ExceptionVector::InvalidTss
        | ExceptionVector::SegmentNotPresent
        | ExceptionVector::StackFault
        | ExceptionVector::GeneralProtection => ExceptionClass::Contributory,
        ExceptionVector::PageFault => ExceptionClass::PageFault,
        _ => ExceptionClass::Benign,
    }
}

/// Architectural state of a vcpu that lives outside the VMCS.
#[derive(Debug, Clone)]
pub struct ArchState {
    /// General purpose registers, except rsp.
    pub gprs: GeneralPurposeRegisters,
    /// CR0 as the guest believes it is.
    pub cr0: Cr0,
    /// CR4 as the guest believes it is.
    pub cr4: Cr4,
    /// Guest XCR0.
    pub xcr0: u64,
    /// Emulated MSRs.
    pub msrs: BTreeMap<u32, u64>,
    exception: Option<PendingException>,
    launched: bool,
}

impl Default for ArchState {
    fn default() -> Self {
        Self {
            gprs: GeneralPurposeRegisters::default(),
            cr0: Cr0::empty(),
            cr4: Cr4::empty(),
            xcr0: 1,
            msrs: BTreeMap::new(),
            exception: None,
            launched: false,
        }
    }
}

impl ArchState {
    /// Returns true if the VMCS of this vcpu was launched.
    pub fn launched(&self) -> bool {
        self.launched
    }

    /// The exception waiting for injection.
    pub fn pending_exception(&self) -> Option<PendingException> {
        self.exception
    }
}

/// Verdict of the entry gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryGate {
    /// Enter the guest.
    Enter,
    /// The vcpu is paused; do not enter.
    Paused,
    /// The vm has to shut down.
    Shutdown,
}

/// How a vcpu enters the guest.
pub trait VmxBackend
where
    Self: Send + Sync,
{
    /// VMCS for a vcpu that will run on `pcpu`.
    fn create_vmcs(&self, pcpu: PcpuId) -> Result<Box<dyn VmcsAccess>, VmError>;

    /// Prepare the host side of the VMCS of `vcpu`.
    fn prepare(&self, vcpu: &Vcpu) -> Result<(), VmError>;

    /// Run `vcpu` in the guest until the next VM exit.
    fn enter(&self, vcpu: &Vcpu, arch: &mut ArchState) -> Result<(), VmError>;

    /// Drop the cached translations of the EPT `eptp` on this pCPU.
    fn invept(&self, eptp: u64) -> Result<(), VmError>;

    /// Drop the cached linear translations tagged with `vpid` on this pCPU.
    fn invvpid(&self, vpid: u16) -> Result<(), VmError>;
}

/// Virtual cpu.
pub struct Vcpu {
    vm_id: u16,
    id: usize,
    pcpu: PcpuId,
    state: AtomicU8,
    pending: AtomicU64,
    pause_requested: AtomicBool,
    arch: SpinLock<ArchState>,
    vmcs: Box<dyn VmcsAccess>,
    cpuid: VcpuidTable,
    thread: Arc<ThreadObject>,
}

impl Vcpu {
    /// Create vcpu #`id` of the vm described by `config`, pinned to `pcpu`.
    pub fn new(
        platform: &dyn Platform,
        config: &VmConfig,
        id: usize,
        pcpu: PcpuId,
        vmcs: Box<dyn VmcsAccess>,
    ) -> Self {
        Self {
            vm_id: config.id,
            id,
            pcpu,
            state: AtomicU8::new(VcpuState::Created as u8),
            pending: AtomicU64::new(0),
            pause_requested: AtomicBool::new(false),
            arch: SpinLock::new(ArchState::default()),
            vmcs,
            cpuid: VcpuidTable::build(platform, config, id as u8),
            thread: ThreadObject::new(alloc::format!("vm{}:vcpu{}", config.id, id), pcpu),
        }
    }

    /// Id of the vm owning this vcpu.
    #[inline]
    pub fn vm_id(&self) -> u16 {
        self.vm_id
    }

    /// Index of this vcpu in its vm.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// The pCPU this vcpu is pinned to.
    #[inline]
    pub fn pcpu(&self) -> PcpuId {
        self.pcpu
    }

    /// The scheduler thread of this vcpu.
    #[inline]
    pub fn thread(&self) -> &Arc<ThreadObject> {
        &self.thread
    }

    /// The VMCS of this vcpu.
    #[inline]
    pub fn vmcs(&self) -> &dyn VmcsAccess {
        &*self.vmcs
    }

    /// The CPUID view of this vcpu.
    #[inline]
    pub fn cpuid(&self) -> &VcpuidTable {
        &self.cpuid
    }

    /// State outside the VMCS.
    #[inline]
    pub fn arch(&self) -> &SpinLock<ArchState> {
        &self.arch
    }

    /// Current state.
    pub fn state(&self) -> VcpuState {
        VcpuState::try_from(self.state.load(Ordering::SeqCst)).unwrap_or(VcpuState::Zombie)
    }

    /// Move to `to`, if the state machine allows it.
    pub fn set_state(&self, to: VcpuState) -> Result<(), VmError> {
        let mut from = self.state();
        loop {
            if from == to {
                return Ok(());
            }
            if !from.can_become(to) {
                return Err(VmError::InvalidVcpuState { from, to });
            }
            match self.state.compare_exchange(
                from as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    log::trace!("VM{}:vcpu{}: {:?} -> {:?}", self.vm_id, self.id, from, to);
                    return Ok(());
                }
                Err(v) => from = VcpuState::try_from(v).unwrap_or(VcpuState::Zombie),
            }
        }
    }

    /// Build the VMCS and put the guest at its entry point.
    ///
    /// The guest starts in protected mode without paging, as unrestricted
    /// guests allow.
    pub fn init(
        &self,
        controls: &VmxControls,
        eptp: u64,
        entry: Gpa,
        backend: &dyn VmxBackend,
    ) -> Result<(), VmError> {
        let state = self.state();
        if state != VcpuState::Created {
            return Err(VmError::InvalidVcpuState {
                from: state,
                to: VcpuState::Initialized,
            });
        }
        backend.prepare(self)?;
        let vmcs = self.vmcs();
        controls.apply(vmcs)?;
        vmcs.write(Field::Eptptr, eptp)?;
        vmcs.write(
            Field::Vpid,
            (self.vm_id as u64) * abyss::MAX_CPU as u64 + self.id as u64 + 1,
        )?;
        vmcs.write(Field::GuestLinkPointer, u64::MAX)?;
        vmcs.write(Field::ExceptionBitmap, 0)?;

        // Bits the guest may not change trap into the CR handler.
        vmcs.write(Field::Cr0GuestHostMask, CR0_HOST_OWNED.bits())?;
        vmcs.write(Field::Cr4GuestHostMask, CR4_HOST_OWNED.bits())?;
        let cr0 = Cr0::PE | Cr0::ET;
        vmcs.write(Field::GuestCr0, (cr0 | Cr0::NE).bits())?;
        vmcs.write(Field::Cr0ReadShadow, cr0.bits())?;
        vmcs.write(Field::GuestCr4, Cr4::VMXE.bits())?;
        vmcs.write(Field::Cr4ReadShadow, 0)?;
        vmcs.write(Field::GuestCr3, 0)?;
        vmcs.write(Field::GuestIa32Efer, 0)?;
        vmcs.write(Field::GuestIa32Pat, DEFAULT_PAT)?;
        vmcs.write(Field::GuestRflags, Rflags::_1.bits())?;
        vmcs.write(Field::GuestRip, entry.into_usize() as u64)?;
        vmcs.write(Field::GuestRsp, 0)?;
        vmcs.write(Field::GuestActivityState, 0)?;
        vmcs.write(Field::GuestInterruptibilityState, 0)?;
        // The root and the VPID may have belonged to a vcpu that is gone.
        self.make_request(PendingRequest::EPT_FLUSH | PendingRequest::VPID_FLUSH);

        {
            let mut arch = self.arch.lock();
            *arch = ArchState {
                cr0,
                ..ArchState::default()
            };
        }
        self.set_state(VcpuState::Initialized)
    }

    /// Post `req`, to be serviced at the next entry.
    ///
    /// The caller kicks the pCPU of this vcpu if it is not the local one.
    pub fn make_request(&self, req: PendingRequest) {
        self.pending.fetch_or(req.bits(), Ordering::SeqCst);
    }

    /// Requests not yet serviced.
    pub fn pending_requests(&self) -> PendingRequest {
        PendingRequest::from_bits_truncate(self.pending.load(Ordering::SeqCst))
    }

    /// Ask the vcpu to park at its next entry.
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Let a paused vcpu enter again.
    pub fn resume(&self) -> Result<(), VmError> {
        self.pause_requested.store(false, Ordering::SeqCst);
        if self.state() == VcpuState::Paused {
            self.set_state(VcpuState::Running)?;
        }
        Ok(())
    }

    /// Queue `vector` for injection, merging it with an exception already
    /// queued the way the processor does: two contributory faults, or a
    /// page fault followed by a contributory fault or a page fault, become a
    /// double fault, and a fault while delivering a double fault is a triple
    /// fault.
    pub fn queue_exception(&self, arch: &mut ArchState, vector: ExceptionVector, error_code: u32) {
        let new_class = exception_class(vector);
        let error_code = vector.has_error_code().then_some(error_code);
        let next = match arch.exception {
            Some(prev) if prev.vector == ExceptionVector::DoubleFault
                && new_class != ExceptionClass::Benign =>
            {
                log::warn!("VM{}:vcpu{}: triple fault", self.vm_id, self.id);
                arch.exception = None;
                self.make_request(PendingRequest::TRP_FAULT);
                return;
            }
            Some(prev)
                if (exception_class(prev.vector) == ExceptionClass::Contributory
                    && new_class == ExceptionClass::Contributory)
                    || (exception_class(prev.vector) == ExceptionClass::PageFault
                        && new_class != ExceptionClass::Benign) =>
            {
                PendingException {
                    vector: ExceptionVector::DoubleFault,
                    error_code: Some(0),
                }
            }
            _ => PendingException { vector, error_code },
        };
        arch.exception = Some(next);
        self.make_request(PendingRequest::EXCEPTION);
    }

    /// Inject a general protection fault.
    pub fn inject_gp(&self, arch: &mut ArchState, error_code: u32) {
        self.queue_exception(arch, ExceptionVector::GeneralProtection, error_code)
    }

    /// Inject an invalid opcode exception.
    pub fn inject_ud(&self, arch: &mut ArchState) {
        self.queue_exception(arch, ExceptionVector::InvalidOpcode, 0)
    }

    /// Inject an NMI at the next entry.
    pub fn inject_nmi(&self) {
        self.make_request(PendingRequest::NMI)
    }

    /// Current privilege level of the guest.
    pub fn cpl(&self) -> Result<PrivilegeLevel, VmError> {
        Ok(PrivilegeLevel::from_access_rights(
            self.vmcs.read(Field::GuestSsAccessRights)?,
        ))
    }

    /// Guest EFER.
    pub fn efer(&self) -> Result<Efer, VmError> {
        Ok(Efer::from_bits_truncate(self.vmcs.read(Field::GuestIa32Efer)?))
    }

    /// Read guest register `index`, taking rsp from the VMCS.
    pub fn read_gpr(&self, arch: &ArchState, index: usize) -> Result<u64, VmError> {
        if index == 4 {
            self.vmcs.read(Field::GuestRsp)
        } else {
            Ok(arch.gprs.get(index))
        }
    }

    /// Write guest register `index`, putting rsp into the VMCS.
    pub fn write_gpr(&self, arch: &mut ArchState, index: usize, v: u64) -> Result<(), VmError> {
        if index == 4 {
            self.vmcs.write(Field::GuestRsp, v)
        } else {
            arch.gprs.set(index, v);
            Ok(())
        }
    }

    /// The gate every VM entry passes.
    ///
    /// Services the pending requests and injects at most one event. TLB
    /// flushes run through `backend` on the executing pCPU. Only the pCPU of
    /// this vcpu calls it.
    pub fn entry_gate(
        &self,
        arch: &mut ArchState,
        backend: &dyn VmxBackend,
    ) -> Result<EntryGate, VmError> {
        if self.state() == VcpuState::Zombie {
            return Ok(EntryGate::Shutdown);
        }
        if self.pending_requests().contains(PendingRequest::TRP_FAULT) {
            self.pending
                .fetch_and(!PendingRequest::TRP_FAULT.bits(), Ordering::SeqCst);
            return Ok(EntryGate::Shutdown);
        }
        if self.pause_requested.load(Ordering::SeqCst) {
            self.set_state(VcpuState::Paused)?;
            return Ok(EntryGate::Paused);
        }
        if self.state() == VcpuState::Paused {
            return Ok(EntryGate::Paused);
        }

        let taken = PendingRequest::from_bits_truncate(
            self.pending.swap(0, Ordering::SeqCst),
        );
        if taken.contains(PendingRequest::EPT_FLUSH) {
            backend.invept(self.vmcs.read(Field::Eptptr)?)?;
        }
        if taken.contains(PendingRequest::VPID_FLUSH) {
            backend.invvpid(self.vmcs.read(Field::Vpid)? as u16)?;
        }

        let mut injected = false;
        if let Some(e) = arch.exception.take() {
            self.vmcs.write(
                Field::VmentryInterruptionInfo,
                entry_interruption_info(
                    e.vector as u8,
                    InterruptionType::HardwareException,
                    e.error_code.is_some(),
                ) as u64,
            )?;
            if let Some(code) = e.error_code {
                self.vmcs.write(Field::VmentryExceptionErrCode, code as u64)?;
            }
            injected = true;
        } else {
            // Redeliver the event the exit interrupted.
            let idt = self.vmcs.read(Field::IdtVectoringInfo)?;
            if idt & (1 << 31) != 0 {
                self.vmcs.write(Field::VmentryInterruptionInfo, idt & !(1 << 12))?;
                if idt & (1 << 11) != 0 {
                    let code = self.vmcs.read(Field::IdtVectoringErrCode)?;
                    self.vmcs.write(Field::VmentryExceptionErrCode, code)?;
                }
                injected = true;
            }
        }
        if taken.contains(PendingRequest::NMI) {
            if injected {
                self.make_request(PendingRequest::NMI);
            } else {
                self.vmcs.write(
                    Field::VmentryInterruptionInfo,
                    entry_interruption_info(ExceptionVector::Nmi as u8, InterruptionType::Nmi, false)
                        as u64,
                )?;
                injected = true;
            }
        }
        if !injected {
            self.vmcs.write(Field::VmentryInterruptionInfo, 0)?;
        }

        self.set_state(VcpuState::Running)?;
        Ok(EntryGate::Enter)
    }

    pub(crate) fn mark_launched(arch: &mut ArchState) {
        arch.launched = true;
    }
}

impl core::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu")
            .field("vm", &self.vm_id)
            .field("id", &self.id)
            .field("pcpu", &self.pcpu)
            .field("state", &self.state())
            .finish()
    }
}

/// CR0 bits the guest may not change without a trap.
pub const CR0_HOST_OWNED: Cr0 = Cr0::from_bits_truncate(
    Cr0::PE.bits()
        | Cr0::PG.bits()
        | Cr0::WP.bits()
        | Cr0::CD.bits()
        | Cr0::NW.bits()
        | Cr0::NE.bits(),
);

/// CR4 bits the guest may not change without a trap.
pub const CR4_HOST_OWNED: Cr4 = Cr4::from_bits_truncate(
    Cr4::PSE.bits()
        | Cr4::PAE.bits()
        | Cr4::VMXE.bits()
        | Cr4::PCIDE.bits()
        | Cr4::SMXE.bits(),
);

/// Power-on value of IA32_PAT.
pub const DEFAULT_PAT: u64 = 0x0007_0406_0007_0406;

/// VM entries replayed from a script, for hosted runs.
///
/// Every [`VmxBackend::enter`] takes the next [`ScriptedExit`] and stores it
/// into the exit fields of the VMCS as the processor would.
#[cfg(any(test, feature = "mock"))]
#[derive(Default)]
pub struct ScriptedEntry {
    exits: SpinLock<alloc::collections::VecDeque<ScriptedExit>>,
    entries: AtomicU64,
    flushes: SpinLock<alloc::vec::Vec<TlbFlush>>,
}

/// A TLB invalidation done by a [`ScriptedEntry`].
#[cfg(any(test, feature = "mock"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbFlush {
    /// INVEPT of an EPT pointer.
    Ept(u64),
    /// INVVPID of a VPID.
    Vpid(u16),
}

/// One scripted VM exit.
#[cfg(any(test, feature = "mock"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedExit {
    /// Raw exit reason.
    pub reason: u64,
    /// Exit qualification.
    pub qualification: u64,
    /// Faulting guest physical address, for EPT exits.
    pub gpa: u64,
    /// Length of the exiting instruction.
    pub instruction_length: u64,
    /// VM-exit interruption information.
    pub interruption_info: u32,
}

#[cfg(any(test, feature = "mock"))]
impl ScriptedExit {
    /// An exit for `reason` with an instruction of `instruction_length` bytes.
    pub fn new(reason: crate::vmcs::BasicExitReason, instruction_length: u64) -> Self {
        Self {
            reason: reason as u64,
            qualification: 0,
            gpa: 0,
            instruction_length,
            interruption_info: 0,
        }
    }

    /// Set the exit qualification.
    pub fn qualification(mut self, qualification: u64) -> Self {
        self.qualification = qualification;
        self
    }

    /// Set the faulting guest physical address.
    pub fn gpa(mut self, gpa: u64) -> Self {
        self.gpa = gpa;
        self
    }

    /// Set the interruption information.
    pub fn interruption_info(mut self, info: u32) -> Self {
        self.interruption_info = info;
        self
    }
}

#[cfg(any(test, feature = "mock"))]
impl ScriptedEntry {
    /// Empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `exit` to the script.
    pub fn push(&self, exit: ScriptedExit) {
        self.exits.lock().push_back(exit);
    }

    /// Number of entries done.
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }

    /// Drain the TLB invalidations done so far.
    pub fn take_flushes(&self) -> alloc::vec::Vec<TlbFlush> {
        core::mem::take(&mut *self.flushes.lock())
    }
}

#[cfg(any(test, feature = "mock"))]
impl VmxBackend for ScriptedEntry {
    fn create_vmcs(&self, _pcpu: PcpuId) -> Result<Box<dyn VmcsAccess>, VmError> {
        Ok(Box::new(crate::vmcs::SoftVmcs::new()))
    }

    fn prepare(&self, _vcpu: &Vcpu) -> Result<(), VmError> {
        Ok(())
    }

    fn enter(&self, vcpu: &Vcpu, arch: &mut ArchState) -> Result<(), VmError> {
        let exit = match self.exits.lock().pop_front() {
            Some(exit) => exit,
            None => kecore::hv_result_err!(NotFound, "script exhausted"),
        };
        self.entries.fetch_add(1, Ordering::SeqCst);
        Vcpu::mark_launched(arch);
        let vmcs = vcpu.vmcs();
        vmcs.write(Field::VmexitReason, exit.reason)?;
        vmcs.write(Field::VmexitQualification, exit.qualification)?;
        vmcs.write(Field::GuestPhysicalAddr, exit.gpa)?;
        vmcs.write(Field::VmexitInstructionLength, exit.instruction_length)?;
        vmcs.write(Field::VmexitInterruptionInfo, exit.interruption_info as u64)?;
        vmcs.write(Field::IdtVectoringInfo, 0)
    }

    fn invept(&self, eptp: u64) -> Result<(), VmError> {
        self.flushes.lock().push(TlbFlush::Ept(eptp));
        Ok(())
    }

    fn invvpid(&self, vpid: u16) -> Result<(), VmError> {
        self.flushes.lock().push(TlbFlush::Vpid(vpid));
        Ok(())
    }
}

#[cfg(target_os = "none")]
pub use hw::HwEntry;

#[cfg(target_os = "none")]
mod hw {
    use super::{ArchState, Vcpu, VmxBackend};
    use crate::{
        vmcs::{ActiveVmcs, Field, Vmcs, VmcsAccess},
        VmError,
    };
    use abyss::{
        addressing::Pa,
        interrupt::GeneralPurposeRegisters,
        x86_64::{msr, Cr0, Cr4},
    };
    use alloc::{boxed::Box, vec::Vec};
    use core::arch::asm;
    use kecore::{hv_result_err, percpu::PcpuId};

    core::arch::global_asm!(
        ".text",
        ".global kehv_vmx_enter",
        "kehv_vmx_enter:",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "push rdi",
        "mov rax, 0x6c14", // HostRsp.
        "vmwrite rax, rsp",
        "jbe 3f",
        "mov rax, 0x6c16", // HostRip.
        "lea rbx, [rip + kehv_vmx_exit]",
        "vmwrite rax, rbx",
        "jbe 3f",
        "cmp rsi, 0",
        "mov rax, [rdi]",
        "mov rcx, [rdi + 0x8]",
        "mov rdx, [rdi + 0x10]",
        "mov rbx, [rdi + 0x18]",
        "mov rbp, [rdi + 0x28]",
        "mov rsi, [rdi + 0x30]",
        "mov r8, [rdi + 0x40]",
        "mov r9, [rdi + 0x48]",
        "mov r10, [rdi + 0x50]",
        "mov r11, [rdi + 0x58]",
        "mov r12, [rdi + 0x60]",
        "mov r13, [rdi + 0x68]",
        "mov r14, [rdi + 0x70]",
        "mov r15, [rdi + 0x78]",
        "mov rdi, [rdi + 0x38]",
        "je 1f",
        "vmresume",
        "jmp 3f",
        "1:",
        "vmlaunch",
        "3:",
        "pop rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "mov rax, 1",
        "ret",
        ".global kehv_vmx_exit",
        "kehv_vmx_exit:",
        "push rdi",
        "mov rdi, [rsp + 0x8]",
        "mov [rdi], rax",
        "mov [rdi + 0x8], rcx",
        "mov [rdi + 0x10], rdx",
        "mov [rdi + 0x18], rbx",
        "mov [rdi + 0x28], rbp",
        "mov [rdi + 0x30], rsi",
        "mov [rdi + 0x40], r8",
        "mov [rdi + 0x48], r9",
        "mov [rdi + 0x50], r10",
        "mov [rdi + 0x58], r11",
        "mov [rdi + 0x60], r12",
        "mov [rdi + 0x68], r13",
        "mov [rdi + 0x70], r14",
        "mov [rdi + 0x78], r15",
        "pop rax",
        "mov [rdi + 0x38], rax",
        "pop rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "xor eax, eax",
        "ret",
    );

    extern "C" {
        fn kehv_vmx_enter(gprs: *mut GeneralPurposeRegisters, launched: u64) -> u64;
    }

    /// VM entry through VMLAUNCH/VMRESUME.
    ///
    /// Each pCPU owns one VMCS region, loaded by the first entry of the vcpu
    /// pinned there.
    pub struct HwEntry {
        regions: Vec<Pa>,
    }

    impl HwEntry {
        /// Backend over the VMCS region of every pCPU, indexed by pCPU.
        pub fn new(regions: Vec<Pa>) -> Self {
            Self { regions }
        }
    }

    impl VmxBackend for HwEntry {
        fn create_vmcs(&self, pcpu: PcpuId) -> Result<Box<dyn VmcsAccess>, VmError> {
            match self.regions.get(pcpu) {
                Some(pa) => {
                    Vmcs::clear(*pa)?;
                    Ok(Box::new(ActiveVmcs::current()))
                }
                None => hv_result_err!(NotFound, "no vmcs region for pCPU{}", pcpu),
            }
        }

        fn prepare(&self, vcpu: &Vcpu) -> Result<(), VmError> {
            match self.regions.get(vcpu.pcpu()) {
                Some(pa) => drop(Vmcs::activate(*pa)?),
                None => hv_result_err!(NotFound, "no vmcs region for pCPU{}", vcpu.pcpu()),
            }
            let vmcs = vcpu.vmcs();
            let cr3: u64;
            unsafe { asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack)) };
            vmcs.write(Field::HostCr0, Cr0::current().bits())?;
            vmcs.write(Field::HostCr3, cr3)?;
            vmcs.write(Field::HostCr4, Cr4::current().bits())?;
            vmcs.write(Field::HostIa32Efer, msr::read(msr::IA32_EFER))?;
            vmcs.write(Field::HostIa32Pat, msr::read(msr::IA32_PAT))
        }

        fn enter(&self, _vcpu: &Vcpu, arch: &mut ArchState) -> Result<(), VmError> {
            // Safety: the VMCS of the vcpu is current on this pCPU and its
            // host state was filled by `prepare`.
            match unsafe { kehv_vmx_enter(&mut arch.gprs, arch.launched as u64) } {
                0 => {
                    Vcpu::mark_launched(arch);
                    Ok(())
                }
                _ => Err(VmError::InstructionError(Vmcs::instruction_error())),
            }
        }

        fn invept(&self, eptp: u64) -> Result<(), VmError> {
            Vmcs::invept(eptp)
        }

        fn invvpid(&self, vpid: u16) -> Result<(), VmError> {
            Vmcs::invvpid(vpid)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::tests::small_vm,
        vm_control::tests::permissive_vmx,
        vmcs::{BasicExitReason, SoftVmcs},
    };
    use abyss::platform::mock::MockPlatform;

    pub(crate) fn ready_vcpu(platform: &MockPlatform) -> Vcpu {
        permissive_vmx(platform);
        let config = small_vm(0, 1);
        let vcpu = Vcpu::new(platform, &config, 0, 0, Box::new(SoftVmcs::new()));
        let controls = VmxControls::compute(platform).unwrap();
        vcpu.init(&controls, 0x1e, config.os.entry_gpa, &ScriptedEntry::new())
            .unwrap();
        vcpu
    }

    #[test]
    fn state_transitions() {
        let platform = MockPlatform::new();
        let vcpu = ready_vcpu(&platform);
        assert_eq!(vcpu.state(), VcpuState::Initialized);
        assert_eq!(
            vcpu.set_state(VcpuState::Handling),
            Err(VmError::InvalidVcpuState {
                from: VcpuState::Initialized,
                to: VcpuState::Handling
            })
        );
        vcpu.set_state(VcpuState::Running).unwrap();
        vcpu.set_state(VcpuState::Handling).unwrap();
        vcpu.set_state(VcpuState::Zombie).unwrap();
        assert!(vcpu.set_state(VcpuState::Running).is_err());
        assert_eq!(vcpu.vmcs().read(Field::GuestRip).unwrap(), 0x10_0000);
    }

    #[test]
    fn gate_injects_one_event_per_entry() {
        let platform = MockPlatform::new();
        let vcpu = ready_vcpu(&platform);
        let mut arch = vcpu.arch().lock().clone();
        vcpu.inject_gp(&mut arch, 0);
        vcpu.inject_nmi();

        assert_eq!(vcpu.entry_gate(&mut arch, &ScriptedEntry::new()), Ok(EntryGate::Enter));
        assert_eq!(
            vcpu.vmcs().read(Field::VmentryInterruptionInfo).unwrap(),
            (1 << 31) | (1 << 11) | (3 << 8) | 13
        );
        // The NMI waits for the next entry.
        assert_eq!(vcpu.pending_requests(), PendingRequest::NMI);
        assert_eq!(vcpu.entry_gate(&mut arch, &ScriptedEntry::new()), Ok(EntryGate::Enter));
        assert_eq!(
            vcpu.vmcs().read(Field::VmentryInterruptionInfo).unwrap(),
            (1 << 31) | (2 << 8) | 2
        );
        assert_eq!(vcpu.entry_gate(&mut arch, &ScriptedEntry::new()), Ok(EntryGate::Enter));
        assert_eq!(vcpu.vmcs().read(Field::VmentryInterruptionInfo).unwrap(), 0);
        assert!(vcpu.pending_requests().is_empty());
    }

    #[test]
    fn gate_flushes_translations_of_this_vcpu() {
        let platform = MockPlatform::new();
        let vcpu = ready_vcpu(&platform);
        let script = ScriptedEntry::new();
        let mut arch = vcpu.arch().lock().clone();

        // A freshly built vcpu starts from clean TLBs.
        assert_eq!(vcpu.entry_gate(&mut arch, &script), Ok(EntryGate::Enter));
        assert_eq!(script.take_flushes(), vec![TlbFlush::Ept(0x1e), TlbFlush::Vpid(1)]);
        assert_eq!(vcpu.entry_gate(&mut arch, &script), Ok(EntryGate::Enter));
        assert!(script.take_flushes().is_empty());

        // Posted from another pCPU, serviced once at the next entry.
        vcpu.make_request(PendingRequest::EPT_FLUSH);
        vcpu.make_request(PendingRequest::EPT_FLUSH);
        assert_eq!(vcpu.entry_gate(&mut arch, &script), Ok(EntryGate::Enter));
        assert_eq!(script.take_flushes(), vec![TlbFlush::Ept(0x1e)]);
        assert!(vcpu.pending_requests().is_empty());

        // A paused vcpu keeps the request until it enters.
        vcpu.make_request(PendingRequest::EPT_FLUSH);
        vcpu.request_pause();
        assert_eq!(vcpu.entry_gate(&mut arch, &script), Ok(EntryGate::Paused));
        assert!(script.take_flushes().is_empty());
        vcpu.resume().unwrap();
        assert_eq!(vcpu.entry_gate(&mut arch, &script), Ok(EntryGate::Enter));
        assert_eq!(script.take_flushes(), vec![TlbFlush::Ept(0x1e)]);
    }

    #[test]
    fn faults_escalate_to_double_and_triple_fault() {
        let platform = MockPlatform::new();
        let vcpu = ready_vcpu(&platform);
        let mut arch = ArchState::default();
        vcpu.queue_exception(&mut arch, ExceptionVector::PageFault, 2);
        vcpu.inject_gp(&mut arch, 0);
        assert_eq!(
            arch.pending_exception(),
            Some(PendingException {
                vector: ExceptionVector::DoubleFault,
                error_code: Some(0)
            })
        );
        vcpu.inject_gp(&mut arch, 0);
        assert_eq!(arch.pending_exception(), None);
        assert!(vcpu.pending_requests().contains(PendingRequest::TRP_FAULT));
        assert_eq!(vcpu.entry_gate(&mut arch, &ScriptedEntry::new()), Ok(EntryGate::Shutdown));

        // Benign exceptions simply replace each other.
        vcpu.inject_ud(&mut arch);
        assert_eq!(arch.pending_exception().unwrap().error_code, None);
    }

    #[test]
    fn pause_takes_effect_at_the_gate() {
        let platform = MockPlatform::new();
        let vcpu = ready_vcpu(&platform);
        let mut arch = ArchState::default();
        vcpu.request_pause();
        assert_eq!(vcpu.state(), VcpuState::Initialized);
        assert_eq!(vcpu.entry_gate(&mut arch, &ScriptedEntry::new()), Ok(EntryGate::Paused));
        assert_eq!(vcpu.state(), VcpuState::Paused);
        assert_eq!(vcpu.entry_gate(&mut arch, &ScriptedEntry::new()), Ok(EntryGate::Paused));
        vcpu.resume().unwrap();
        assert_eq!(vcpu.entry_gate(&mut arch, &ScriptedEntry::new()), Ok(EntryGate::Enter));
        assert_eq!(vcpu.state(), VcpuState::Running);
    }

    #[test]
    fn scripted_entry_fills_exit_fields() {
        let platform = MockPlatform::new();
        let vcpu = ready_vcpu(&platform);
        let script = ScriptedEntry::new();
        script.push(ScriptedExit::new(BasicExitReason::Cpuid, 2));
        let mut arch = ArchState::default();
        script.enter(&vcpu, &mut arch).unwrap();
        assert!(arch.launched());
        assert_eq!(
            vcpu.vmcs().exit_reason().unwrap(),
            crate::vmcs::ExitReason::BasicExitReason(BasicExitReason::Cpuid)
        );
        assert_eq!(
            script.enter(&vcpu, &mut arch),
            Err(VmError::Hv(kecore::HvError::NotFound))
        );
    }
}
