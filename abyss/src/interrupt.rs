//! Interrupt
use crate::x86_64::intrinsics;

/// Enumeration for representing interrupt state
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupt is on.
    On,
    /// Interrupt is off.
    Off,
}

impl InterruptState {
    /// Read the current interrupt state.
    pub fn current() -> Self {
        if intrinsics::irq_enabled() {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// An RAII implementation of an interrupt disable. When this structure is
/// dropped (falls out of scope), the interrupt will be recovered into state on creation of this struct.
/// Therefore, you must dropped the this struct in reverse of creation order.
///
/// This structure is created by the [`new`].
///
/// [`new`]: InterruptGuard::new
pub struct InterruptGuard {
    state: InterruptState,
}

impl InterruptGuard {
    /// Create a new InterruptGuard.
    pub fn new() -> Self {
        let state = InterruptState::current();
        intrinsics::irq_disable();
        Self { state }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.state == InterruptState::On {
            intrinsics::irq_enable();
        }
    }
}

/// Local interrupt flag control of the running pCPU.
pub struct LocalIrq;

impl spin_lock::IrqControl for LocalIrq {
    fn save_and_disable() -> bool {
        let was = intrinsics::irq_enabled();
        intrinsics::irq_disable();
        was
    }

    fn restore(was_enabled: bool) {
        if was_enabled {
            intrinsics::irq_enable();
        }
    }
}

/// A spinlock that masks local interrupts while held.
pub type IrqSpinLock<T> = spin_lock::IrqSpinLock<T, LocalIrq>;

/// X86_64 general purpose registers of a guest, saved on VM-exit.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneralPurposeRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    // Slot of rsp; the guest rsp lives in the VMCS.
    pub _rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GeneralPurposeRegisters {
    /// Read register by its x86 encoding (0 = rax ... 15 = r15).
    pub fn get(&self, index: usize) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self._rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Write register by its x86 encoding (0 = rax ... 15 = r15).
    pub fn set(&mut self, index: usize, v: u64) {
        let slot = match index {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self._rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            _ => &mut self.r15,
        };
        *slot = v;
    }
}
