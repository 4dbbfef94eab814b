//! intrinsics of x86_64 not included in [`core::arch::x86_64`].
//!
//! On hosted builds the interrupt flag is simulated by a single process-wide
//! flag so that code built around [`crate::interrupt::InterruptGuard`] still
//! runs under `cargo test`.
//!
//! [`core::arch::x86_64`]: https://doc.rust-lang.org/core/arch/x86_64/index.html

#[cfg(target_os = "none")]
mod imp {
    use crate::x86_64::Rflags;
    use core::arch::asm;

    #[inline(always)]
    pub fn irq_enabled() -> bool {
        Rflags::read().contains(Rflags::IF)
    }

    #[inline(always)]
    pub fn irq_disable() {
        unsafe { asm!("cli", options(nomem, nostack)) }
    }

    #[inline(always)]
    pub fn irq_enable() {
        unsafe { asm!("sti", options(nomem, nostack)) }
    }

    #[inline(always)]
    pub fn enable_and_halt() {
        // STI blocks interrupts until after the next instruction, so no
        // interrupt can slip in between the two.
        unsafe { asm!("sti", "hlt", options(nomem, nostack)) }
    }

    #[inline(always)]
    pub fn rdtsc() -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    static IF: AtomicBool = AtomicBool::new(true);
    static TSC: AtomicU64 = AtomicU64::new(0);

    pub fn irq_enabled() -> bool {
        IF.load(Ordering::SeqCst)
    }

    pub fn irq_disable() {
        IF.store(false, Ordering::SeqCst)
    }

    pub fn irq_enable() {
        IF.store(true, Ordering::SeqCst)
    }

    pub fn enable_and_halt() {
        IF.store(true, Ordering::SeqCst)
    }

    pub fn rdtsc() -> u64 {
        TSC.fetch_add(1, Ordering::Relaxed)
    }
}

pub use imp::*;

/// Hint to the processor that we are in a spin loop.
#[inline(always)]
pub fn pause() {
    core::hint::spin_loop()
}
