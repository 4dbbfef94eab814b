//! x86_64 platform devices.

#[cfg(target_os = "none")]
pub mod apic;
pub mod serial;
