//! Advanced Programmable Interrupt Controller (APIC) driver.
//!
//! This implements X2Apic mode with the local timer in TSC-deadline mode.
use crate::x86_64::msr;

const X2APIC_TPR: u32 = 0x808;
const X2APIC_EOI: u32 = 0x80b;
const X2APIC_SIVR: u32 = 0x80f;
const X2APIC_ICR: u32 = 0x830;
const X2APIC_LVT_TIMER: u32 = 0x832;
const X2APIC_LVT_LINT0: u32 = 0x835;
const X2APIC_LVT_LINT1: u32 = 0x836;

const LVT_MASKED: u64 = 1 << 16;
const LVT_TIMER_TSC_DEADLINE: u64 = 0b10 << 17;
const APIC_BASE_X2APIC_ENABLE: u64 = 1 << 10;
const ICR_LEVEL_ASSERT: u64 = 1 << 14;

/// The local APIC of the running pCPU, in x2APIC mode.
#[derive(Clone, Copy)]
pub struct LocalApic {
    _p: (),
}

impl LocalApic {
    /// Handle to the x2APIC.
    pub const fn new() -> Self {
        Self { _p: () }
    }

    /// Enable the x2APIC of the running pCPU and route the deadline timer to
    /// `timer_vector`.
    ///
    /// # Safety
    /// Must run once per pCPU during bring-up with interrupts disabled.
    pub unsafe fn init(&self, timer_vector: u8) {
        let apic_base = msr::read(msr::IA32_APIC_BASE);
        msr::write(msr::IA32_APIC_BASE, apic_base | APIC_BASE_X2APIC_ENABLE);
        // Software enable, spurious vector 0xff.
        msr::write(X2APIC_SIVR, 0x100 | 0xff);
        msr::write(X2APIC_TPR, 0);
        msr::write(X2APIC_LVT_LINT0, LVT_MASKED);
        // NMI on lint1.
        msr::write(X2APIC_LVT_LINT1, 0x400);
        msr::write(X2APIC_LVT_TIMER, LVT_TIMER_TSC_DEADLINE | timer_vector as u64);
    }

    /// Signal end of interrupt.
    pub fn eoi(&self) {
        unsafe { msr::write(X2APIC_EOI, 0) }
    }

    /// Send a fixed IPI with `vector` to the pCPU with x2APIC id `dest`.
    pub fn send_ipi(&self, dest: u32, vector: u8) {
        unsafe {
            msr::write(
                X2APIC_ICR,
                ((dest as u64) << 32) | ICR_LEVEL_ASSERT | vector as u64,
            )
        }
    }
}
