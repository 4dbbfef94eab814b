//! A recording stand-in for the hardware platform.
//!
//! Every hardware effect is logged so that tests can assert on programmed
//! deadlines, IPIs, halts and context switches. The clock only moves when the
//! test moves it.

use super::Platform;
use crate::{context::SwitchFrame, interrupt::InterruptState, x86_64::cpuid::CpuidResult};
use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin_lock::SpinLock;

type SwitchHook = Box<dyn FnMut(usize, usize) + Send>;

/// Recording platform for hosted tests.
pub struct MockPlatform {
    now: AtomicU64,
    irq_enabled: AtomicBool,
    halts: AtomicUsize,
    deadlines: SpinLock<BTreeMap<usize, u64>>,
    deadline_writes: AtomicUsize,
    ipis: SpinLock<Vec<(usize, u8)>>,
    switches: SpinLock<Vec<(usize, usize)>>,
    switch_hook: SpinLock<Option<SwitchHook>>,
    cpuid: SpinLock<BTreeMap<(u32, u32), CpuidResult>>,
    msrs: SpinLock<BTreeMap<u32, u64>>,
}

impl MockPlatform {
    /// A platform at tick 0 with interrupts enabled.
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            irq_enabled: AtomicBool::new(true),
            halts: AtomicUsize::new(0),
            deadlines: SpinLock::new(BTreeMap::new()),
            deadline_writes: AtomicUsize::new(0),
            ipis: SpinLock::new(Vec::new()),
            switches: SpinLock::new(Vec::new()),
            switch_hook: SpinLock::new(None),
            cpuid: SpinLock::new(BTreeMap::new()),
            msrs: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Move the clock to `tick`.
    pub fn set_now(&self, tick: u64) {
        self.now.store(tick, Ordering::SeqCst);
    }

    /// Deadline currently armed on `pcpu`, if any.
    pub fn deadline(&self, pcpu: usize) -> Option<u64> {
        self.deadlines.lock().get(&pcpu).copied().filter(|d| *d != 0)
    }

    /// Number of deadline programming operations so far.
    pub fn deadline_writes(&self) -> usize {
        self.deadline_writes.load(Ordering::SeqCst)
    }

    /// Drain the IPIs sent so far, as `(pcpu, vector)`.
    pub fn take_ipis(&self) -> Vec<(usize, u8)> {
        core::mem::take(&mut *self.ipis.lock())
    }

    /// Context switches so far, as `(prev, next)` frame addresses.
    pub fn switches(&self) -> Vec<(usize, usize)> {
        self.switches.lock().clone()
    }

    /// Number of halts so far.
    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }

    /// Simulated interrupt flag.
    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::SeqCst)
    }

    /// Run `hook(prev, next)` in place of every context switch. It stands for
    /// whatever other threads do before switching back.
    pub fn on_switch(&self, hook: impl FnMut(usize, usize) + Send + 'static) {
        *self.switch_hook.lock() = Some(Box::new(hook));
    }

    /// Serve `result` for CPUID `(leaf, subleaf)`.
    pub fn set_cpuid(&self, leaf: u32, subleaf: u32, result: CpuidResult) {
        self.cpuid.lock().insert((leaf, subleaf), result);
    }

    /// Serve `value` for MSR `msr`.
    pub fn set_msr(&self, msr: u32, value: u64) {
        self.msrs.lock().insert(msr, value);
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MockPlatform {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn set_deadline(&self, pcpu: usize, deadline: u64) {
        self.deadline_writes.fetch_add(1, Ordering::SeqCst);
        self.deadlines.lock().insert(pcpu, deadline);
    }

    fn send_ipi(&self, pcpu: usize, vector: u8) {
        self.ipis.lock().push((pcpu, vector));
    }

    fn irq_save(&self) -> InterruptState {
        if self.irq_enabled.swap(false, Ordering::SeqCst) {
            InterruptState::On
        } else {
            InterruptState::Off
        }
    }

    fn irq_restore(&self, state: InterruptState) {
        if state == InterruptState::On {
            self.irq_enabled.store(true, Ordering::SeqCst);
        }
    }

    fn irq_enable(&self) {
        self.irq_enabled.store(true, Ordering::SeqCst);
    }

    fn wait_for_interrupt(&self) {
        self.irq_enabled.store(true, Ordering::SeqCst);
        self.halts.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn switch_context(&self, prev: *mut SwitchFrame, next: *const SwitchFrame) {
        let (prev, next) = (prev as usize, next as usize);
        self.switches.lock().push((prev, next));
        // The hook may re-enter the platform; do not hold its lock meanwhile.
        let hook = self.switch_hook.lock().take();
        if let Some(mut hook) = hook {
            hook(prev, next);
            let mut slot = self.switch_hook.lock();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.cpuid
            .lock()
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or_default()
    }

    fn read_msr(&self, msr: u32) -> u64 {
        self.msrs.lock().get(&msr).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::MockPlatform;
    use crate::{interrupt::InterruptState, platform::Platform};

    #[test]
    fn records_hardware_effects() {
        let p = MockPlatform::new();
        p.set_deadline(1, 100);
        p.send_ipi(2, 0xf0);
        assert_eq!(p.deadline(1), Some(100));
        assert_eq!(p.deadline(0), None);
        assert_eq!(p.take_ipis(), vec![(2, 0xf0)]);
        assert!(p.take_ipis().is_empty());

        assert_eq!(p.irq_save(), InterruptState::On);
        assert_eq!(p.irq_save(), InterruptState::Off);
        p.irq_restore(InterruptState::On);
        assert!(p.irq_enabled());
    }
}
