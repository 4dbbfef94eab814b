//! Core services of the hypervisor.
//!
//! Everything here runs on the host side of the machine and knows nothing
//! about VMX. The services are plain objects over a per-pCPU arena
//! ([`percpu::PerCpu`]) and a [`Platform`](abyss::platform::Platform); the
//! caller passes the pCPU id explicitly.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

#[macro_use]
pub mod error;
pub mod event;
pub mod mm;
pub mod percpu;
pub mod sbuf;
pub mod sched;
pub mod smp_call;
pub mod softirq;
pub mod timer;

pub use error::{HvError, HvResult};
