//! The hypervisor context.
//!
//! [`Hypervisor`] ties the core services of one machine together: the
//! scheduler, cross-pCPU calls, timers, softirqs and shared buffers, plus the
//! table of live vms. Every pCPU drives its vcpu through
//! [`Hypervisor::run_vcpu_once`], one VM entry and exit per call.
//!
//! ## Lifecycle
//! ```text
//!  create_vm --> CREATED --start_vm--> STARTED <==pause/resume==> PAUSED
//!                   |                     |                         |
//!                   +---------------------+------ shutdown_vm ------+--> POWERED_OFF
//! ```
//! Lifecycle requests from other pCPUs only post to the vcpus and kick their
//! pCPUs. The vcpus act on them at their next entry gate.
use crate::{
    config::{HypervisorConfig, MemRegionKind, VmType},
    ept::{Ept, EptRights, LargePagePolicy},
    vcpu::{EntryGate, Vcpu, VcpuState, VmxBackend},
    vm::{Gpa, Vm, VmState},
    vm_control::VmxControls,
    vmexits::{self, ExitContext, VmexitController, VmexitResult},
    VmError,
};
use abyss::{
    addressing::{PhysMapper, PAGE_SIZE},
    platform::{Platform, NOTIFY_VECTOR, TIMER_VECTOR},
    x86_64::msr::IA32_VMX_EPT_VPID_CAP,
};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};
use kecore::{
    hv_result_err,
    mm::PagePool,
    percpu::{PcpuId, PerCpu},
    sbuf::SbufRegistry,
    sched::{NoopPolicy, Scheduler, ThreadObject},
    smp_call::SmpCall,
    softirq::{Softirq, SoftirqBuilder, SoftirqLine},
    timer::TimerService,
};
use spin_lock::SpinLock;

/// Host memory handed to the hypervisor.
pub struct HostMemory {
    /// Pages for EPT tables. Exhaustion is a hard error.
    pub tables: Arc<PagePool>,
    /// Pages for lazily mapped guest RAM. Should carry a dummy page.
    pub ram: Arc<PagePool>,
    /// Host mapping of every physical address guests may be backed by.
    pub mem: Arc<dyn PhysMapper>,
}

/// What one step of a pCPU did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No vcpu runs here; the softirqs were serviced.
    Idle,
    /// The guest exited and will be entered again.
    Continue,
    /// The vcpu parked itself.
    Paused,
    /// The vm of the vcpu shut down.
    Shutdown,
    /// The vcpu hit a fatal error and became a zombie.
    Fatal,
    /// The host was shut down; the pCPU must halt for good.
    HostDown,
}

type Assignment = Option<(Arc<Vm>, Arc<Vcpu>)>;

/// The hypervisor.
pub struct Hypervisor {
    platform: Arc<dyn Platform>,
    config: HypervisorConfig,
    memory: HostMemory,
    large_pages: LargePagePolicy,
    controls: VmxControls,
    backend: Arc<dyn VmxBackend>,
    controller: Box<dyn VmexitController>,
    scheduler: Scheduler,
    smp: SmpCall,
    timers: Arc<TimerService>,
    softirq: Softirq,
    sbuf: SbufRegistry,
    vms: SpinLock<BTreeMap<u16, Arc<Vm>>>,
    assigned: PerCpu<SpinLock<Assignment>>,
    host_down: Arc<AtomicU64>,
}

impl Hypervisor {
    /// Bring up the hypervisor of a machine described by `config`.
    ///
    /// Exits the built-in handlers do not take go to `controller`.
    pub fn new(
        platform: Arc<dyn Platform>,
        config: HypervisorConfig,
        memory: HostMemory,
        backend: Arc<dyn VmxBackend>,
        controller: Box<dyn VmexitController>,
    ) -> Result<Self, VmError> {
        config.check()?;
        let nr_pcpus = config.nr_pcpus;
        let controls = VmxControls::compute(&*platform)?;
        let large_pages =
            LargePagePolicy::from_ept_vpid_cap(platform.read_msr(IA32_VMX_EPT_VPID_CAP));

        let scheduler = Scheduler::new(platform.clone(), nr_pcpus, |_| Box::new(NoopPolicy::new()));
        for pcpu in 0..nr_pcpus {
            scheduler.init_idle(pcpu, ThreadObject::new(alloc::format!("idle{}", pcpu), pcpu));
        }
        let timers = Arc::new(TimerService::new(platform.clone(), nr_pcpus));
        let softirq = SoftirqBuilder::new()
            .register(SoftirqLine::Timer, timers.clone().softirq_handler())
            .build(platform.clone(), nr_pcpus);
        log::info!(
            "hypervisor: {} pCPUs, {} vms, {:?}",
            nr_pcpus,
            config.vms.len(),
            large_pages
        );

        Ok(Self {
            smp: SmpCall::new(platform.clone(), nr_pcpus),
            sbuf: SbufRegistry::new(nr_pcpus),
            assigned: PerCpu::new(nr_pcpus, |_| SpinLock::new(None)),
            vms: SpinLock::new(BTreeMap::new()),
            host_down: Arc::new(AtomicU64::new(0)),
            platform,
            config,
            memory,
            large_pages,
            controls,
            backend,
            controller,
            scheduler,
            timers,
            softirq,
        })
    }

    /// The platform.
    #[inline]
    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    /// The static configuration.
    #[inline]
    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    /// The scheduler.
    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Cross-pCPU calls.
    #[inline]
    pub fn smp(&self) -> &SmpCall {
        &self.smp
    }

    /// Timers.
    #[inline]
    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    /// Softirqs.
    #[inline]
    pub fn softirq(&self) -> &Softirq {
        &self.softirq
    }

    /// Shared buffers.
    #[inline]
    pub fn sbuf(&self) -> &SbufRegistry {
        &self.sbuf
    }

    /// Controller of the exits without a built-in handler.
    #[inline]
    pub fn controller(&self) -> &dyn VmexitController {
        &*self.controller
    }

    /// Pool backing lazily mapped guest RAM.
    #[inline]
    pub fn ram_pool(&self) -> &PagePool {
        &self.memory.ram
    }

    /// Host mapping of guest memory.
    #[inline]
    pub fn mem(&self) -> &dyn PhysMapper {
        &*self.memory.mem
    }

    /// Returns true if `pcpu` took part in a host shutdown.
    pub fn host_halted(&self, pcpu: PcpuId) -> bool {
        self.host_down.load(Ordering::SeqCst) & (1 << pcpu) != 0
    }

    /// Host interrupt `vector` arrived on `pcpu`.
    pub fn handle_host_interrupt(&self, pcpu: PcpuId, vector: u8) {
        match vector {
            NOTIFY_VECTOR => self.smp.handle_notification(pcpu),
            TIMER_VECTOR => self.timers.handle_timer_irq(pcpu, &self.softirq),
            _ => log::debug!("pCPU{}: spurious vector 0x{:x}", pcpu, vector),
        }
    }

    /// Vm `id`, if live.
    pub fn get_vm(&self, id: u16) -> Option<Arc<Vm>> {
        self.vms.lock().get(&id).cloned()
    }

    /// Build vm `id` from its configuration.
    ///
    /// Each vcpu is pinned to one pCPU of the affinity, which must not run
    /// a vcpu yet.
    pub fn create_vm(&self, id: u16) -> Result<Arc<Vm>, VmError> {
        let config = match self.config.vm(id) {
            Some(config) => config.clone(),
            None => hv_result_err!(NotFound, "VM{} is not configured", id),
        };
        if self.vms.lock().contains_key(&id) {
            hv_result_err!(AlreadyExists, "VM{} exists", id);
        }

        let ept = Ept::new(self.memory.tables.clone(), self.large_pages);
        let mut vcpus = Vec::with_capacity(config.vcpu_num());
        for (idx, pcpu) in config.pcpus().enumerate() {
            let vmcs = self.backend.create_vmcs(pcpu)?;
            vcpus.push(Arc::new(Vcpu::new(&*self.platform, &config, idx, pcpu, vmcs)));
        }
        let vm = Arc::new(Vm::new(config, ept, vcpus));
        vm.setup_memory()?;

        let mut vms = self.vms.lock();
        if vms.contains_key(&id) {
            hv_result_err!(AlreadyExists, "VM{} exists", id);
        }
        let mut slots = Vec::with_capacity(vm.vcpus().len());
        for vcpu in vm.vcpus() {
            let slot = self.assigned[vcpu.pcpu()].lock();
            if slot.is_some() {
                hv_result_err!(Busy, "VM{}: pCPU{} is taken", id, vcpu.pcpu());
            }
            slots.push(slot);
        }
        for (mut slot, vcpu) in slots.into_iter().zip(vm.vcpus()) {
            *slot = Some((vm.clone(), vcpu.clone()));
        }
        vms.insert(id, vm.clone());
        log::info!("VM{} ({}) created with {} vcpus", id, vm.config().name, vm.vcpus().len());
        Ok(vm)
    }

    fn vm_in(&self, id: u16, expected: VmState) -> Result<Arc<Vm>, VmError> {
        let vm = self.live_vm(id)?;
        if vm.state() != expected {
            hv_result_err!(Busy, "VM{} is {:?}, not {:?}", id, vm.state(), expected);
        }
        Ok(vm)
    }

    /// Let the vcpus of a created vm run. `local` is the calling pCPU.
    pub fn start_vm(&self, id: u16, local: PcpuId) -> Result<(), VmError> {
        let vm = self.vm_in(id, VmState::Created)?;
        vm.set_state(VmState::Started);
        for vcpu in vm.vcpus() {
            self.scheduler.wake_thread(vcpu.thread(), local);
        }
        log::info!("VM{} started", id);
        Ok(())
    }

    /// Park the vcpus of a started vm at their next entry.
    pub fn pause_vm(&self, id: u16, local: PcpuId) -> Result<(), VmError> {
        let vm = self.vm_in(id, VmState::Started)?;
        for vcpu in vm.vcpus() {
            vcpu.request_pause();
            if vcpu.pcpu() != local {
                self.smp.kick_pcpu(vcpu.pcpu());
            }
        }
        vm.set_state(VmState::Paused);
        log::info!("VM{} paused", id);
        Ok(())
    }

    /// Let the vcpus of a paused vm run again.
    pub fn resume_vm(&self, id: u16, local: PcpuId) -> Result<(), VmError> {
        let vm = self.vm_in(id, VmState::Paused)?;
        for vcpu in vm.vcpus() {
            vcpu.resume()?;
            self.scheduler.wake_thread(vcpu.thread(), local);
        }
        vm.set_state(VmState::Started);
        log::info!("VM{} resumed", id);
        Ok(())
    }

    /// Remove `[gpa, gpa + size)` from the address space of vm `id`.
    ///
    /// Its vcpus flush their EPT-derived translations before they enter
    /// again. Lazily mapped RAM stays until shutdown. `local` is the calling
    /// pCPU.
    pub fn unmap_guest(
        &self,
        id: u16,
        gpa: Gpa,
        size: usize,
        local: PcpuId,
    ) -> Result<(), VmError> {
        let vm = self.live_vm(id)?;
        if vm.overlaps_lazy_ram(gpa, size) {
            hv_result_err!(InvalidArgument, "VM{}: {:?} is lazily mapped", id, gpa);
        }
        vm.ept().del_mr(gpa, size)?;
        self.flush_ept(&vm, local);
        Ok(())
    }

    /// Set the `set` rights and clear the `clear` rights on the mapping of
    /// `[gpa, gpa + size)` in vm `id`, then flush like [`Self::unmap_guest`].
    pub fn protect_guest(
        &self,
        id: u16,
        gpa: Gpa,
        size: usize,
        set: EptRights,
        clear: EptRights,
        local: PcpuId,
    ) -> Result<(), VmError> {
        let vm = self.live_vm(id)?;
        vm.ept().modify_mr(gpa, size, set, clear)?;
        self.flush_ept(&vm, local);
        Ok(())
    }

    fn live_vm(&self, id: u16) -> Result<Arc<Vm>, VmError> {
        match self.get_vm(id) {
            Some(vm) => Ok(vm),
            None => hv_result_err!(NotFound, "no VM{}", id),
        }
    }

    fn flush_ept(&self, vm: &Vm, local: PcpuId) {
        vm.request_ept_flush();
        for vcpu in vm.vcpus() {
            if vcpu.pcpu() != local {
                self.smp.kick_pcpu(vcpu.pcpu());
            }
        }
    }

    /// Tear vm `id` down and return its lazily mapped RAM to the pool.
    pub fn shutdown_vm(&self, id: u16, local: PcpuId) -> Result<(), VmError> {
        let vm = match self.vms.lock().remove(&id) {
            Some(vm) => vm,
            None => hv_result_err!(NotFound, "no VM{}", id),
        };
        for vcpu in vm.vcpus() {
            vcpu.set_state(VcpuState::Zombie)?;
            self.scheduler.sleep_thread(vcpu.thread(), local);
            self.unassign(vcpu);
            if vcpu.pcpu() != local {
                self.smp.kick_pcpu(vcpu.pcpu());
            }
        }
        // Shared buffers may live in the RAM about to be freed.
        let released = self.sbuf.release_owner(id as usize);
        if released != 0 {
            log::info!("VM{}: dropped {} shared buffers", id, released);
        }
        for region in vm
            .config()
            .memory
            .iter()
            .filter(|r| r.kind == MemRegionKind::LazyRam)
        {
            for offset in (0..region.size).step_by(PAGE_SIZE) {
                if let Some(hpa) = vm.gpa2hpa(region.gpa + offset) {
                    self.memory.ram.free_page(hpa)?;
                }
            }
        }
        vm.set_state(VmState::PoweredOff);
        log::info!("VM{} powered off", id);
        Ok(())
    }

    /// Create every configured vm, and start all but the post-launched ones,
    /// which wait for the service vm.
    pub fn launch_vms(&self, local: PcpuId) -> Result<(), VmError> {
        for config in self.config.vms.iter() {
            self.create_vm(config.id)?;
            if config.vm_type != VmType::PostLaunched {
                self.start_vm(config.id, local)?;
            }
        }
        Ok(())
    }

    fn unassign(&self, vcpu: &Arc<Vcpu>) {
        let mut slot = self.assigned[vcpu.pcpu()].lock();
        if matches!(&*slot, Some((_, v)) if Arc::ptr_eq(v, vcpu)) {
            *slot = None;
        }
    }

    /// One step of `pcpu`: reschedule if asked, then enter the assigned vcpu
    /// once and handle its exit.
    pub fn run_vcpu_once(&self, pcpu: PcpuId) -> Result<RunOutcome, VmError> {
        if self.host_halted(pcpu) {
            return Ok(RunOutcome::HostDown);
        }
        if self.scheduler.need_reschedule(pcpu) {
            self.scheduler.schedule(pcpu);
        }
        let assigned = self.assigned.get(pcpu).and_then(|slot| slot.lock().clone());
        let current = self.scheduler.current(pcpu);
        let (vm, vcpu) = match assigned {
            Some((vm, vcpu))
                if current
                    .as_ref()
                    .map(|c| Arc::ptr_eq(c, vcpu.thread()))
                    .unwrap_or(false) =>
            {
                (vm, vcpu)
            }
            _ => {
                self.softirq.do_softirq(pcpu);
                return Ok(RunOutcome::Idle);
            }
        };

        if vcpu.state() == VcpuState::Created {
            vcpu.init(
                &self.controls,
                vm.ept().eptp(),
                vm.config().os.entry_gpa,
                &*self.backend,
            )?;
        }

        let mut arch = vcpu.arch().lock();
        match vcpu.entry_gate(&mut arch, &*self.backend)? {
            EntryGate::Enter => (),
            EntryGate::Paused => {
                drop(arch);
                self.scheduler.sleep_thread(vcpu.thread(), pcpu);
                self.scheduler.schedule(pcpu);
                return Ok(RunOutcome::Paused);
            }
            EntryGate::Shutdown => {
                drop(arch);
                self.shutdown_vm(vm.id(), pcpu)?;
                self.scheduler.schedule(pcpu);
                return Ok(RunOutcome::Shutdown);
            }
        }

        if let Err(e) = self.backend.enter(&vcpu, &mut arch) {
            drop(arch);
            log::error!("VM{}:vcpu{}: vm entry failed: {}", vm.id(), vcpu.id(), e);
            return self.park_fatal(&vm, &vcpu, pcpu);
        }
        vcpu.set_state(VcpuState::Handling)?;
        let reason = vcpu.vmcs().exit_reason()?;
        let mut ctx = ExitContext::new(self, &vm, &vcpu, &mut arch, pcpu, reason);
        let result = vmexits::dispatch(&mut ctx);
        let yield_requested = ctx.yield_requested;
        drop(arch);

        match result {
            Ok(VmexitResult::Continue) => (),
            Ok(VmexitResult::Fatal) => return self.park_fatal(&vm, &vcpu, pcpu),
            Err(e) => {
                log::error!("VM{}:vcpu{}: exit handling failed: {}", vm.id(), vcpu.id(), e);
                return self.park_fatal(&vm, &vcpu, pcpu);
            }
        }
        self.softirq.do_softirq(pcpu);
        if yield_requested {
            self.scheduler.yield_current(pcpu);
        }
        Ok(RunOutcome::Continue)
    }

    // The vcpu can not run anymore. Losing the last vcpu of the most severe
    // vm brings the whole host down.
    fn park_fatal(&self, vm: &Arc<Vm>, vcpu: &Arc<Vcpu>, pcpu: PcpuId) -> Result<RunOutcome, VmError> {
        vcpu.set_state(VcpuState::Zombie)?;
        self.scheduler.sleep_thread(vcpu.thread(), pcpu);
        self.unassign(vcpu);
        log::error!("VM{}:vcpu{} is a zombie", vm.id(), vcpu.id());

        let live = vm.vcpus().iter().any(|v| v.state() != VcpuState::Zombie);
        let most_severe = self
            .vms
            .lock()
            .values()
            .all(|other| Arc::ptr_eq(other, vm) || other.severity() < vm.severity());
        if !live && most_severe {
            self.shutdown_host()?;
        } else if !live {
            log::warn!("VM{} has no live vcpu", vm.id());
        }
        self.scheduler.schedule(pcpu);
        Ok(RunOutcome::Fatal)
    }

    fn shutdown_host(&self) -> Result<(), VmError> {
        log::error!("shutting the host down");
        let nr_pcpus = self.config.nr_pcpus;
        let mask = if nr_pcpus >= 64 {
            u64::MAX
        } else {
            (1 << nr_pcpus) - 1
        };
        let host_down = self.host_down.clone();
        self.smp.call_function(mask, move |pcpu| {
            host_down.fetch_or(1 << pcpu, Ordering::SeqCst);
            log::error!("pCPU{} halted", pcpu);
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{tests::small_vm, MemRegionKind, VmConfig, SEVERITY_SAFETY_VM},
        hypercall::{HC_GET_API_VERSION, HC_SETUP_SBUF, HC_START_VM},
        io::tests::Recorder,
        probe::{tests::flat, GuestProbe, Probe},
        vcpu::{PendingRequest, ScriptedEntry, ScriptedExit, TlbFlush},
        vm_control::tests::permissive_vmx,
        vmcs::{BasicExitReason, Field},
    };
    use abyss::{
        platform::mock::MockPlatform,
        x86_64::{cpuid::*, ExceptionVector},
    };
    use kecore::{
        mm::PoolRegion,
        sbuf::{SbufId, SharedBuffer},
        HvError,
    };

    const ENTRY: u64 = 0x10_0000;

    struct Harness {
        platform: Arc<MockPlatform>,
        script: Arc<ScriptedEntry>,
        hv: Hypervisor,
    }

    impl Harness {
        fn new(nr_pcpus: usize, vms: Vec<VmConfig>) -> Self {
            let platform = Arc::new(MockPlatform::new());
            permissive_vmx(&platform);
            platform.set_cpuid(LEAF_BASIC, 0, CpuidResult::new(0xd, 0, 0, 0));
            platform.set_cpuid(
                LEAF_FEATURES,
                0,
                CpuidResult::new(0x906ea, 0, FEAT_1_ECX_X2APIC | FEAT_1_ECX_XSAVE, FEAT_1_EDX_MTRR),
            );
            let ram = Arc::new(PagePool::with_dummy(PoolRegion::host_backed(16)));
            let memory = HostMemory {
                tables: Arc::new(PagePool::new(PoolRegion::host_backed(64))),
                mem: ram.clone(),
                ram,
            };
            let script = Arc::new(ScriptedEntry::new());
            let hv = Hypervisor::new(
                platform.clone(),
                HypervisorConfig { nr_pcpus, vms },
                memory,
                script.clone(),
                Box::new(()),
            )
            .unwrap();
            Self {
                platform,
                script,
                hv,
            }
        }

        // Launch every vm and take each started vcpu through its first entry,
        // so that registers set by a test survive vcpu initialization.
        fn launch(&self) {
            self.hv.launch_vms(0).unwrap();
            for pcpu in 0..self.hv.config().nr_pcpus {
                let started = self.hv.assigned[pcpu]
                    .lock()
                    .as_ref()
                    .map(|(vm, _)| vm.state() == VmState::Started)
                    .unwrap_or(false);
                if started {
                    let exit = ScriptedExit::new(BasicExitReason::InitSignal, 0);
                    assert_eq!(self.run(pcpu, exit), RunOutcome::Continue);
                }
            }
        }

        fn run(&self, pcpu: PcpuId, exit: ScriptedExit) -> RunOutcome {
            self.script.push(exit);
            self.hv.run_vcpu_once(pcpu).unwrap()
        }

        // Fault the page of `gpa` in through the lazy RAM path.
        fn touch(&self, pcpu: PcpuId, gpa: u64) {
            let exit = ScriptedExit::new(BasicExitReason::EptViolation, 0)
                .qualification(1)
                .gpa(gpa);
            assert_eq!(self.run(pcpu, exit), RunOutcome::Continue);
        }

        fn probe<'a>(&'a self, vm: &'a Vm) -> GuestProbe<'a> {
            GuestProbe::new(vm.ept(), self.hv.mem(), flat())
        }
    }

    /// A vm whose RAM is faulted in from the pool on demand.
    fn lazy_vm(id: u16, cpu_affinity: u64) -> VmConfig {
        let mut config = small_vm(id, cpu_affinity);
        config.memory[0].kind = MemRegionKind::LazyRam;
        config
    }

    fn service_vm(id: u16, cpu_affinity: u64) -> VmConfig {
        let mut config = lazy_vm(id, cpu_affinity);
        config.vm_type = VmType::Service;
        config
    }

    fn gpa(v: u64) -> Gpa {
        Gpa::new(v as usize).unwrap()
    }

    #[test]
    fn lifecycle_follows_the_table() {
        let h = Harness::new(2, vec![lazy_vm(0, 0b01), lazy_vm(1, 0b10)]);
        let hv = &h.hv;
        assert_eq!(
            hv.create_vm(5).map(|_| ()),
            Err(VmError::Hv(HvError::NotFound))
        );
        hv.create_vm(0).unwrap();
        assert_eq!(
            hv.create_vm(0).map(|_| ()),
            Err(VmError::Hv(HvError::AlreadyExists))
        );
        assert_eq!(hv.pause_vm(0, 0), Err(VmError::Hv(HvError::Busy)));
        hv.start_vm(0, 0).unwrap();
        assert_eq!(hv.get_vm(0).unwrap().state(), VmState::Started);
        assert_eq!(hv.start_vm(0, 0), Err(VmError::Hv(HvError::Busy)));

        // Nothing is assigned to pCPU1 yet.
        assert_eq!(hv.run_vcpu_once(1), Ok(RunOutcome::Idle));
        hv.shutdown_vm(0, 0).unwrap();
        assert!(hv.get_vm(0).is_none());
        assert_eq!(hv.run_vcpu_once(0), Ok(RunOutcome::Idle));
        // The pCPU is free again.
        hv.create_vm(0).unwrap();
    }

    #[test]
    fn cpuid_hides_masked_features() {
        let mut config = lazy_vm(0, 1);
        config.cpuid_masks.push(crate::config::CpuidMask {
            leaf: LEAF_FEATURES,
            subleaf: 0,
            eax: 0,
            ebx: 0,
            ecx: FEAT_1_ECX_X2APIC,
            edx: 0,
        });
        let h = Harness::new(1, vec![config]);
        h.launch();
        let vm = h.hv.get_vm(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();

        vcpu.arch().lock().gprs.rax = LEAF_FEATURES as u64;
        assert_eq!(
            h.run(0, ScriptedExit::new(BasicExitReason::Cpuid, 2)),
            RunOutcome::Continue
        );
        let arch = vcpu.arch().lock().clone();
        assert_eq!(arch.gprs.rcx as u32 & FEAT_1_ECX_X2APIC, 0);
        assert_ne!(arch.gprs.rcx as u32 & FEAT_1_ECX_XSAVE, 0);
        assert_eq!(vcpu.vmcs().read(Field::GuestRip).unwrap(), ENTRY + 2);
        assert_eq!(vcpu.state(), VcpuState::Handling);
    }

    #[test]
    fn bad_cr0_write_raises_gp() {
        let h = Harness::new(1, vec![lazy_vm(0, 1)]);
        h.launch();
        let vcpu = h.hv.get_vm(0).unwrap().vcpu(0).unwrap().clone();
        // PG without PE.
        vcpu.arch().lock().gprs.rax = 0x8000_0000;
        let exit = ScriptedExit::new(BasicExitReason::MovCr, 3).qualification(0);
        assert_eq!(h.run(0, exit), RunOutcome::Continue);

        let arch = vcpu.arch().lock().clone();
        assert_eq!(
            arch.pending_exception().map(|e| e.vector),
            Some(ExceptionVector::GeneralProtection)
        );
        assert_eq!(vcpu.vmcs().read(Field::GuestRip).unwrap(), ENTRY);
    }

    #[test]
    fn port_io_reaches_the_handler() {
        let h = Harness::new(1, vec![lazy_vm(0, 1)]);
        h.launch();
        let vm = h.hv.get_vm(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();
        let uart = Arc::new(Recorder {
            value: 0x60,
            ..Recorder::default()
        });
        vm.io().register_pio(0x3f8, 8, uart.clone()).unwrap();

        // out dx, al
        vcpu.arch().lock().gprs.rax = 0x1234_5641;
        let exit = ScriptedExit::new(BasicExitReason::IoInstruction, 1).qualification(0x3f8 << 16);
        assert_eq!(h.run(0, exit), RunOutcome::Continue);
        assert_eq!(*uart.writes.lock(), vec![(0x3f8, 1, 0x41)]);

        // in al, dx
        let exit = ScriptedExit::new(BasicExitReason::IoInstruction, 1)
            .qualification((0x3fd << 16) | (1 << 3));
        assert_eq!(h.run(0, exit), RunOutcome::Continue);
        assert_eq!(vcpu.arch().lock().gprs.rax, 0x1234_5660);
        assert_eq!(vcpu.vmcs().read(Field::GuestRip).unwrap(), ENTRY + 2);

        // Nothing decodes port 0x80.
        let exit = ScriptedExit::new(BasicExitReason::IoInstruction, 1).qualification(0x80 << 16);
        assert_eq!(h.run(0, exit), RunOutcome::Continue);
        assert_eq!(
            vcpu.arch().lock().pending_exception().map(|e| e.vector),
            Some(ExceptionVector::GeneralProtection)
        );
        assert_eq!(vcpu.vmcs().read(Field::GuestRip).unwrap(), ENTRY + 2);
    }

    #[test]
    fn lazy_ram_is_mapped_on_demand() {
        let h = Harness::new(1, vec![lazy_vm(0, 1)]);
        h.hv.launch_vms(0).unwrap();
        let vm = h.hv.get_vm(0).unwrap();
        let live = h.hv.ram_pool().live_pages();

        assert!(vm.gpa2hpa(gpa(ENTRY)).is_none());
        h.touch(0, ENTRY + 0x10);
        assert!(vm.gpa2hpa(gpa(ENTRY)).is_some());
        assert_eq!(h.hv.ram_pool().live_pages(), live + 1);
        // A second fault on the same page maps nothing new.
        h.touch(0, ENTRY);
        assert_eq!(h.hv.ram_pool().live_pages(), live + 1);
        // The access is retried, not skipped.
        let vcpu = vm.vcpu(0).unwrap();
        assert_eq!(vcpu.vmcs().read(Field::GuestRip).unwrap(), ENTRY);

        h.hv.shutdown_vm(0, 0).unwrap();
        assert_eq!(h.hv.ram_pool().live_pages(), live);
    }

    #[test]
    fn racing_lazy_faults_back_a_page_once() {
        let h = Harness::new(1, vec![lazy_vm(0, 1)]);
        h.hv.launch_vms(0).unwrap();
        let vm = h.hv.get_vm(0).unwrap();
        let pool = h.hv.ram_pool();
        let live = pool.live_pages();

        let mapped: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4u64)
                .map(|t| {
                    let vm = &vm;
                    s.spawn(move || vm.map_lazy_page(pool, gpa(ENTRY + t * 8)).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let winners: Vec<_> = mapped.into_iter().flatten().collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(vm.gpa2hpa(gpa(ENTRY)), Some(winners[0]));
        assert_eq!(pool.live_pages(), live + 1);

        h.hv.shutdown_vm(0, 0).unwrap();
        assert_eq!(pool.live_pages(), live);
    }

    #[test]
    fn first_entry_starts_from_clean_tlbs() {
        let h = Harness::new(2, vec![lazy_vm(0, 0b11)]);
        h.launch();
        let eptp = h.hv.get_vm(0).unwrap().ept().eptp();
        assert_eq!(
            h.script.take_flushes(),
            vec![
                TlbFlush::Ept(eptp),
                TlbFlush::Vpid(1),
                TlbFlush::Ept(eptp),
                TlbFlush::Vpid(2)
            ]
        );
    }

    #[test]
    fn unmapping_a_live_vm_flushes_every_vcpu() {
        let h = Harness::new(2, vec![small_vm(0, 0b11)]);
        h.launch();
        let vm = h.hv.get_vm(0).unwrap();
        let eptp = vm.ept().eptp();
        h.script.take_flushes();
        h.platform.take_ipis();

        h.hv.unmap_guest(0, gpa(0x1000), PAGE_SIZE, 0).unwrap();
        assert!(vm.gpa2hpa(gpa(0x1000)).is_none());
        assert!(vm.gpa2hpa(gpa(0x2000)).is_some());
        // The local vcpu is not kicked; it passes its gate anyway.
        assert_eq!(h.platform.take_ipis(), vec![(1, NOTIFY_VECTOR)]);
        for pcpu in 0..2 {
            let vcpu = vm.vcpu(pcpu).unwrap();
            assert!(vcpu.pending_requests().contains(PendingRequest::EPT_FLUSH));
            h.run(pcpu, ScriptedExit::new(BasicExitReason::Hlt, 1));
            assert_eq!(h.script.take_flushes(), vec![TlbFlush::Ept(eptp)]);
        }

        h.platform.take_ipis();
        let (set, clear) = (EptRights::empty(), EptRights::WRITE);
        h.hv.protect_guest(0, gpa(0x2000), PAGE_SIZE, set, clear, 1).unwrap();
        let (_, rights, _) = vm.ept().walk(gpa(0x2000)).unwrap();
        assert!(!rights.contains(EptRights::WRITE));
        assert_eq!(h.platform.take_ipis(), vec![(0, NOTIFY_VECTOR)]);
        assert!(vm
            .vcpus()
            .iter()
            .all(|v| v.pending_requests().contains(PendingRequest::EPT_FLUSH)));
    }

    #[test]
    fn lazily_mapped_ram_is_not_unmapped_live() {
        let h = Harness::new(1, vec![lazy_vm(0, 1)]);
        h.hv.launch_vms(0).unwrap();
        h.touch(0, ENTRY);
        assert_eq!(
            h.hv.unmap_guest(0, gpa(ENTRY), PAGE_SIZE, 0),
            Err(VmError::Hv(HvError::InvalidArgument))
        );
        assert_eq!(
            h.hv.unmap_guest(3, gpa(ENTRY), PAGE_SIZE, 0),
            Err(VmError::Hv(HvError::NotFound))
        );
        assert!(h.hv.get_vm(0).unwrap().gpa2hpa(gpa(ENTRY)).is_some());
    }

    #[test]
    fn enabling_paging_flushes_translations() {
        let h = Harness::new(1, vec![lazy_vm(0, 1)]);
        h.launch();
        let vcpu = h.hv.get_vm(0).unwrap().vcpu(0).unwrap().clone();
        assert!(vcpu.pending_requests().is_empty());

        // PE | ET, unchanged paging bits.
        vcpu.arch().lock().gprs.rax = 0x11;
        let exit = ScriptedExit::new(BasicExitReason::MovCr, 3).qualification(0);
        assert_eq!(h.run(0, exit), RunOutcome::Continue);
        assert!(vcpu.pending_requests().is_empty());

        // PG | PE | ET.
        vcpu.arch().lock().gprs.rax = 0x8000_0011;
        assert_eq!(h.run(0, exit), RunOutcome::Continue);
        assert!(vcpu.pending_requests().contains(PendingRequest::EPT_FLUSH));
        assert_eq!(vcpu.vmcs().read(Field::GuestRip).unwrap(), ENTRY + 6);
    }

    #[test]
    fn mmio_store_is_emulated() {
        let h = Harness::new(1, vec![lazy_vm(0, 1)]);
        h.hv.launch_vms(0).unwrap();
        let vm = h.hv.get_vm(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();
        let dev = Arc::new(Recorder::default());
        vm.io().register_mmio(gpa(0xfed0_0000), 0x1000, dev.clone()).unwrap();

        h.touch(0, ENTRY);
        // mov dword ptr [rax], ebx
        h.probe(&vm).copy_to_guest(gpa(ENTRY), &[0x89, 0x18]).unwrap();
        {
            let mut arch = vcpu.arch().lock();
            arch.gprs.rax = 0xfed0_0010;
            arch.gprs.rbx = 0x1234_5678;
        }
        let exit = ScriptedExit::new(BasicExitReason::EptViolation, 2)
            .qualification(2)
            .gpa(0xfed0_0010);
        assert_eq!(h.run(0, exit), RunOutcome::Continue);
        assert_eq!(*dev.writes.lock(), vec![(0xfed0_0010, 4, 0x1234_5678)]);
        assert_eq!(vcpu.vmcs().read(Field::GuestRip).unwrap(), ENTRY + 2);
    }

    #[test]
    fn stray_access_raises_gp() {
        let h = Harness::new(1, vec![lazy_vm(0, 1)]);
        h.hv.launch_vms(0).unwrap();
        let vcpu = h.hv.get_vm(0).unwrap().vcpu(0).unwrap().clone();
        let exit = ScriptedExit::new(BasicExitReason::EptViolation, 2)
            .qualification(1)
            .gpa(0x8000_0000);
        assert_eq!(h.run(0, exit), RunOutcome::Continue);
        assert_eq!(
            vcpu.arch().lock().pending_exception().map(|e| e.vector),
            Some(ExceptionVector::GeneralProtection)
        );
    }

    #[test]
    fn unhandled_exit_of_the_most_severe_vm_halts_the_host() {
        let mut config = lazy_vm(0, 1);
        config.severity = SEVERITY_SAFETY_VM;
        let h = Harness::new(2, vec![config, lazy_vm(1, 2)]);
        h.hv.launch_vms(0).unwrap();
        let vcpu = h.hv.get_vm(0).unwrap().vcpu(0).unwrap().clone();
        h.platform.take_ipis();

        assert_eq!(
            h.run(0, ScriptedExit::new(BasicExitReason::Rdpmc, 2)),
            RunOutcome::Fatal
        );
        assert_eq!(vcpu.state(), VcpuState::Zombie);
        assert_eq!(h.hv.run_vcpu_once(0), Ok(RunOutcome::Idle));

        let ipis = h.platform.take_ipis();
        assert!(ipis.contains(&(0, NOTIFY_VECTOR)));
        assert!(ipis.contains(&(1, NOTIFY_VECTOR)));
        for pcpu in 0..2 {
            h.hv.handle_host_interrupt(pcpu, NOTIFY_VECTOR);
            assert!(h.hv.host_halted(pcpu));
            assert_eq!(h.hv.run_vcpu_once(pcpu), Ok(RunOutcome::HostDown));
        }
    }

    #[test]
    fn unhandled_exit_of_a_lesser_vm_stays_local() {
        let mut config = lazy_vm(1, 2);
        config.severity = SEVERITY_SAFETY_VM;
        let h = Harness::new(2, vec![lazy_vm(0, 1), config]);
        h.hv.launch_vms(0).unwrap();

        assert_eq!(
            h.run(0, ScriptedExit::new(BasicExitReason::Rdpmc, 2)),
            RunOutcome::Fatal
        );
        for pcpu in 0..2 {
            h.hv.handle_host_interrupt(pcpu, NOTIFY_VECTOR);
            assert!(!h.hv.host_halted(pcpu));
        }
        assert_eq!(
            h.run(1, ScriptedExit::new(BasicExitReason::Hlt, 1)),
            RunOutcome::Continue
        );
    }

    #[test]
    fn triple_fault_shuts_the_vm_down() {
        let h = Harness::new(1, vec![lazy_vm(0, 1)]);
        h.hv.launch_vms(0).unwrap();
        let vm = h.hv.get_vm(0).unwrap();
        assert_eq!(
            h.run(0, ScriptedExit::new(BasicExitReason::TripleFault, 0)),
            RunOutcome::Continue
        );
        assert_eq!(h.hv.run_vcpu_once(0), Ok(RunOutcome::Shutdown));
        assert_eq!(vm.state(), VmState::PoweredOff);
        assert!(h.hv.get_vm(0).is_none());
        assert_eq!(h.script.entries(), 1);
    }

    #[test]
    fn pause_and_resume_at_the_entry_gate() {
        let h = Harness::new(2, vec![lazy_vm(0, 1)]);
        h.hv.launch_vms(0).unwrap();
        let vm = h.hv.get_vm(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();

        h.platform.take_ipis();
        h.hv.pause_vm(0, 1).unwrap();
        assert!(h.platform.take_ipis().contains(&(0, NOTIFY_VECTOR)));
        assert_eq!(h.hv.run_vcpu_once(0), Ok(RunOutcome::Paused));
        assert_eq!(vcpu.state(), VcpuState::Paused);
        assert_eq!(h.hv.run_vcpu_once(0), Ok(RunOutcome::Idle));
        assert_eq!(h.script.entries(), 0);

        h.hv.resume_vm(0, 1).unwrap();
        assert_eq!(vm.state(), VmState::Started);
        assert_eq!(
            h.run(0, ScriptedExit::new(BasicExitReason::Hlt, 1)),
            RunOutcome::Continue
        );
        assert_eq!(h.script.entries(), 1);
    }

    #[test]
    fn hypercalls_need_the_service_vm() {
        let h = Harness::new(1, vec![lazy_vm(0, 1)]);
        h.launch();
        let vcpu = h.hv.get_vm(0).unwrap().vcpu(0).unwrap().clone();
        {
            let mut arch = vcpu.arch().lock();
            arch.gprs.r8 = HC_GET_API_VERSION;
            arch.gprs.rdi = 0x1000;
        }
        assert_eq!(
            h.run(0, ScriptedExit::new(BasicExitReason::Vmcall, 3)),
            RunOutcome::Continue
        );
        assert_eq!(vcpu.arch().lock().gprs.rax as i64, -1);
        assert_eq!(vcpu.vmcs().read(Field::GuestRip).unwrap(), ENTRY + 3);
    }

    #[test]
    fn service_vm_drives_hypercalls() {
        let h = Harness::new(2, vec![service_vm(0, 1), lazy_vm(1, 2)]);
        h.hv.create_vm(0).unwrap();
        h.hv.start_vm(0, 0).unwrap();
        h.hv.create_vm(1).unwrap();
        let vm = h.hv.get_vm(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();
        let call = |id: u64, param1: u64| {
            {
                let mut arch = vcpu.arch().lock();
                arch.gprs.r8 = id;
                arch.gprs.rdi = param1;
            }
            assert_eq!(
                h.run(0, ScriptedExit::new(BasicExitReason::Vmcall, 3)),
                RunOutcome::Continue
            );
            vcpu.arch().lock().gprs.rax as i64
        };

        h.touch(0, 0x1000);
        h.touch(0, 0x2000);
        assert_eq!(call(HC_GET_API_VERSION, 0x1000), 0);
        let mut version = [0u8; 8];
        h.probe(&vm).copy_from_guest(gpa(0x1000), &mut version).unwrap();
        assert_eq!(version, [1, 0, 0, 0, 0, 0, 0, 0]);

        // The guest lays out the log buffer and hands it over.
        let hpa = vm.gpa2hpa(gpa(0x2000)).unwrap();
        let va = h.hv.mem().pa_to_va(hpa).unwrap();
        // Safety: the page is mapped into the vm and stays allocated.
        unsafe { SharedBuffer::init(va, 4, 16, 0) }.unwrap();
        let mut req = [0u8; 16];
        req[4..8].copy_from_slice(&(SbufId::HvLog as u32).to_le_bytes());
        req[8..16].copy_from_slice(&0x2000u64.to_le_bytes());
        h.probe(&vm).copy_to_guest(gpa(0x1000), &req).unwrap();
        assert_eq!(call(HC_SETUP_SBUF, 0x1000), 0);
        assert!(h.hv.sbuf().is_registered(0, SbufId::HvLog));
        assert_eq!(h.hv.sbuf().put(0, SbufId::HvLog, &[7; 16]), 16);

        // A header claiming more records than are mapped is refused.
        let mut huge = [0u8; 4];
        h.probe(&vm).copy_from_guest(gpa(0x2000 + 36), &mut huge).unwrap();
        h.probe(&vm)
            .copy_to_guest(gpa(0x2000 + 36), &(1u32 << 23).to_le_bytes())
            .unwrap();
        req[0..4].copy_from_slice(&1u32.to_le_bytes());
        h.probe(&vm).copy_to_guest(gpa(0x1000), &req).unwrap();
        assert_eq!(call(HC_SETUP_SBUF, 0x1000), HvError::InvalidArgument.code());
        assert!(!h.hv.sbuf().is_registered(1, SbufId::HvLog));
        h.probe(&vm).copy_to_guest(gpa(0x2000 + 36), &huge).unwrap();

        // Unknown ids are refused like foreign callers.
        assert_eq!(call(0x8000_00ff, 0), -1);
        assert_eq!(call(HC_START_VM, 0), HvError::InvalidArgument.code());
        assert_eq!(call(HC_START_VM, 1), 0);
        assert_eq!(h.hv.get_vm(1).unwrap().state(), VmState::Started);
    }

    #[test]
    fn service_vm_shutdown_drops_its_shared_buffers() {
        let h = Harness::new(1, vec![service_vm(0, 1)]);
        h.hv.create_vm(0).unwrap();
        h.hv.start_vm(0, 0).unwrap();
        let vm = h.hv.get_vm(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();
        let live = h.hv.ram_pool().live_pages();

        h.touch(0, 0x1000);
        h.touch(0, 0x2000);
        let va = h.hv.mem().pa_to_va(vm.gpa2hpa(gpa(0x2000)).unwrap()).unwrap();
        // Safety: the page is mapped into the vm and stays allocated.
        unsafe { SharedBuffer::init(va, 4, 16, 0) }.unwrap();
        let mut req = [0u8; 16];
        req[4..8].copy_from_slice(&(SbufId::Trace as u32).to_le_bytes());
        req[8..16].copy_from_slice(&0x2000u64.to_le_bytes());
        h.probe(&vm).copy_to_guest(gpa(0x1000), &req).unwrap();
        {
            let mut arch = vcpu.arch().lock();
            arch.gprs.r8 = HC_SETUP_SBUF;
            arch.gprs.rdi = 0x1000;
        }
        assert_eq!(
            h.run(0, ScriptedExit::new(BasicExitReason::Vmcall, 3)),
            RunOutcome::Continue
        );
        assert_eq!(vcpu.arch().lock().gprs.rax, 0);
        assert!(h.hv.sbuf().is_registered(0, SbufId::Trace));

        h.hv.shutdown_vm(0, 0).unwrap();
        assert!(!h.hv.sbuf().is_registered(0, SbufId::Trace));
        assert_eq!(h.hv.sbuf().put(0, SbufId::Trace, &[7; 16]), 0);
        assert_eq!(h.hv.ram_pool().live_pages(), live);
    }
}
