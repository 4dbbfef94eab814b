//! The platform boundary.
//!
//! Core services never touch the deadline timer, the local APIC, the interrupt
//! flag or the context-switch primitive directly. They go through a
//! [`Platform`], chosen once at boot and shared by every pCPU. The bare-metal
//! implementation is [`BareMetal`]; hosted tests use [`mock::MockPlatform`].

use crate::{
    context::SwitchFrame,
    interrupt::InterruptState,
    x86_64::cpuid::CpuidResult,
};

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Vector of the inter-processor notification (SMP call and kick).
pub const NOTIFY_VECTOR: u8 = 0xf0;
/// Vector of the local APIC deadline timer.
pub const TIMER_VECTOR: u8 = 0xef;

/// Hardware operations consumed by the hypervisor core.
pub trait Platform: Send + Sync {
    /// Current value of the free running clock, in ticks.
    fn now(&self) -> u64;

    /// Program the one-shot deadline of `pcpu` to `deadline`; `0` disarms it.
    ///
    /// Only the owning pCPU programs its own deadline.
    fn set_deadline(&self, pcpu: usize, deadline: u64);

    /// Send `vector` to `pcpu`.
    fn send_ipi(&self, pcpu: usize, vector: u8);

    /// Disable local interrupts and return the previous state.
    fn irq_save(&self) -> InterruptState;

    /// Restore local interrupts to `state`.
    fn irq_restore(&self, state: InterruptState);

    /// Enable local interrupts.
    fn irq_enable(&self);

    /// Atomically enable interrupts and halt until the next interrupt.
    fn wait_for_interrupt(&self);

    /// Switch from the thread saved into `prev` to the thread saved in `next`.
    ///
    /// # Safety
    /// See [`crate::context::save_and_switch_context`].
    unsafe fn switch_context(&self, prev: *mut SwitchFrame, next: *const SwitchFrame);

    /// CPUID of the host processor.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    /// Read a host MSR.
    fn read_msr(&self, msr: u32) -> u64;
}

/// The bare-metal x86_64 platform.
#[cfg(target_os = "none")]
pub struct BareMetal {
    apic: crate::dev::x86_64::apic::LocalApic,
}

#[cfg(target_os = "none")]
impl BareMetal {
    /// Platform whose local APIC lives at `apic`.
    pub const fn new(apic: crate::dev::x86_64::apic::LocalApic) -> Self {
        Self { apic }
    }
}

#[cfg(target_os = "none")]
impl Platform for BareMetal {
    fn now(&self) -> u64 {
        crate::x86_64::intrinsics::rdtsc()
    }

    fn set_deadline(&self, _pcpu: usize, deadline: u64) {
        unsafe { crate::x86_64::msr::write(crate::x86_64::msr::IA32_TSC_DEADLINE, deadline) }
    }

    fn send_ipi(&self, pcpu: usize, vector: u8) {
        self.apic.send_ipi(pcpu as u32, vector)
    }

    fn irq_save(&self) -> InterruptState {
        let state = InterruptState::current();
        crate::x86_64::intrinsics::irq_disable();
        state
    }

    fn irq_restore(&self, state: InterruptState) {
        if state == InterruptState::On {
            crate::x86_64::intrinsics::irq_enable();
        }
    }

    fn irq_enable(&self) {
        crate::x86_64::intrinsics::irq_enable()
    }

    fn wait_for_interrupt(&self) {
        crate::x86_64::intrinsics::enable_and_halt()
    }

    unsafe fn switch_context(&self, prev: *mut SwitchFrame, next: *const SwitchFrame) {
        crate::context::save_and_switch_context(prev, next)
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        crate::x86_64::cpuid::native(leaf, subleaf)
    }

    fn read_msr(&self, msr: u32) -> u64 {
        crate::x86_64::msr::read(msr)
    }
}
