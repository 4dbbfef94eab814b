//! Interrupt-safe spinlock.
//!
//! The local interrupt flag is saved and cleared before a ticket is taken and
//! restored after the ticket is released.

use crate::smplock::{SpinLock, SpinLockGuard};
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

/// Control over the local interrupt flag of the running pCPU.
pub trait IrqControl {
    /// Disable local interrupts and return whether they were enabled.
    fn save_and_disable() -> bool;
    /// Re-enable local interrupts if `was_enabled`.
    fn restore(was_enabled: bool);
}

/// A [`SpinLock`] that masks local interrupts while held.
pub struct IrqSpinLock<T: ?Sized, I: IrqControl> {
    _irq: PhantomData<fn() -> I>,
    inner: SpinLock<T>,
}

impl<T, I: IrqControl> IrqSpinLock<T, I> {
    /// Creates a new lock in an unlocked state.
    pub const fn new(t: T) -> Self {
        Self {
            _irq: PhantomData,
            inner: SpinLock::new(t),
        }
    }

    /// Consumes this lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized, I: IrqControl> IrqSpinLock<T, I> {
    /// Disable local interrupts, then acquire the lock.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T, I> {
        let was_enabled = I::save_and_disable();
        IrqSpinLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            was_enabled,
            _irq: PhantomData,
        }
    }

    /// Returns true if somebody holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Guard of an [`IrqSpinLock`].
pub struct IrqSpinLockGuard<'a, T: ?Sized + 'a, I: IrqControl> {
    guard: ManuallyDrop<SpinLockGuard<'a, T>>,
    was_enabled: bool,
    _irq: PhantomData<fn() -> I>,
}

impl<T: ?Sized, I: IrqControl> Deref for IrqSpinLockGuard<'_, T, I> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized, I: IrqControl> DerefMut for IrqSpinLockGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized, I: IrqControl> Drop for IrqSpinLockGuard<'_, T, I> {
    fn drop(&mut self) {
        // Release the ticket before interrupts can come back.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        I::restore(self.was_enabled);
    }
}
