//! The abyss of the hypervisor that operates hardwares.
//!
//! This crate contains the hardware-facing collection of the hypervisor: address
//! types, x86_64 registers and instructions, the context-switch primitive, boot
//! information parsing and the [`platform::Platform`] boundary through which the
//! core services reach the deadline timer, IPIs, interrupt flag and halt.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod boot;
pub mod context;
pub mod dev;
pub mod interrupt;
pub mod platform;
pub mod x86_64;

/// Maximum number of pCPUs this hypervisor can support.
pub const MAX_CPU: usize = 8;
