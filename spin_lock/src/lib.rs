//! Spinlocks shared by every pCPU of the hypervisor.
//!
//! [`SpinLock`] is a FIFO ticket lock. [`IrqSpinLock`] additionally masks local
//! interrupts for as long as the lock is held, so that a lock also taken from an
//! interrupt handler cannot deadlock its own pCPU.
#![cfg_attr(not(test), no_std)]

mod irqsave;
mod smplock;

pub use irqsave::*;
pub use smplock::*;
