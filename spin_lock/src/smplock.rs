//! Ticket spinlock.
//!
//! A lock is a pair of 32-bit counters. `head` hands out tickets and `tail`
//! names the ticket currently being served. Acquiring fetch-and-increments
//! `head` and then spins until `tail` reaches the obtained ticket, so
//! contending pCPUs are served strictly in arrival order. Releasing increments
//! `tail`.
//!
//! The lock is not recursive. Taking it twice on the same pCPU deadlocks, and
//! it must never be held across a context switch.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// An enumeration of possible errors associated while trying to acquire a lock,
/// from the [`try_lock`] method on a [`SpinLock`].
///
/// [`try_lock`]: SpinLock::try_lock
#[derive(Debug, PartialEq, Eq)]
pub enum TryLockError {
    /// The lock could not be acquired at this time because the operation would
    /// otherwise block.
    WouldBlock,
}

/// A mutual exclusion primitive useful for protecting shared data.
///
/// The data can only be accessed through the RAII guards returned from
/// [`lock`] and [`try_lock`], which guarantees that the data is only ever
/// accessed when the spinlock is held.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    head: AtomicU32,
    tail: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, spinning until it is this caller's turn.
    ///
    /// Callers are served in the order in which they took a ticket.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let ticket = self.head.fetch_add(1, Ordering::Relaxed);
        while self.tail.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock without spinning.
    ///
    /// # Errors
    ///
    /// If the spinlock is held, or other callers are already queued on it,
    /// returns [`TryLockError::WouldBlock`].
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, TryLockError> {
        let tail = self.tail.load(Ordering::Relaxed);
        self.head
            .compare_exchange(
                tail,
                tail.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .map(|_| SpinLockGuard {
                lock: self,
                _not_send: PhantomData,
            })
            .map_err(|_| TryLockError::WouldBlock)
    }

    /// Number of tickets handed out but not yet released, i.e. the holder
    /// plus every waiter.
    #[inline]
    pub fn queue_len(&self) -> u32 {
        self.head
            .load(Ordering::Relaxed)
            .wrapping_sub(self.tail.load(Ordering::Relaxed))
    }

    /// Returns true if somebody holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.queue_len() != 0
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// No locking is needed as the borrow checker guarantees exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[inline]
    fn release(&self) {
        self.tail.fetch_add(1, Ordering::Release);
    }
}

impl<T: ?Sized + Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// An RAII implementation of a "scoped lock" of a spinlock. When this structure
/// is dropped (falls out of scope), the lock will be released.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`SpinLock`].
///
/// [`lock`]: SpinLock::lock
/// [`try_lock`]: SpinLock::try_lock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    // The guard belongs to the pCPU that took the ticket.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use crate::{SpinLock, TryLockError};
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::thread::scope;

    #[test]
    pub fn smoke() {
        const LENGTH: usize = 1024;
        let lock = SpinLock::new(vec![]);
        let start = Arc::new(AtomicBool::new(true));

        scope(|s| {
            for i in 0..LENGTH {
                let d = &lock;
                let start = start.clone();
                s.spawn(move || {
                    while start.load(Ordering::SeqCst) {}
                    let mut d = d.lock();
                    d.push(i);
                });
            }
            start.store(false, Ordering::SeqCst);
        });

        lock.lock().sort();
        assert_eq!(lock.into_inner(), (0..LENGTH).collect::<Vec<_>>());
    }

    #[test]
    fn served_in_ticket_order() {
        const WAITERS: usize = 8;
        let lock = SpinLock::new(Vec::new());

        scope(|s| {
            let held = lock.lock();
            for i in 0..WAITERS {
                let lock = &lock;
                s.spawn(move || lock.lock().push(i));
                // Waiter `i` owns ticket `i + 1` before the next one is spawned.
                while lock.queue_len() != i as u32 + 2 {
                    std::hint::spin_loop();
                }
            }
            drop(held);
        });

        assert_eq!(lock.into_inner(), (0..WAITERS).collect::<Vec<_>>());
    }

    #[test]
    fn try_lock_respects_holder() {
        let lock = SpinLock::new(0);
        let guard = lock.try_lock().unwrap();
        assert_eq!(lock.try_lock().err(), Some(TryLockError::WouldBlock));
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
        *lock.try_lock().unwrap() += 1;
        assert_eq!(*lock.lock(), 1);
    }
}
