//! Busy-wait mutual exclusion.
//!
//! [`SpinLock`] serializes access to the value it wraps by spinning; it is
//! the only locking available before a scheduler exists. No fairness is
//! attempted.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A busy-waiting lock around `T`.
///
/// `const`-constructable so globals like the PMM singleton can be built at
/// compile time. Waiters park on plain loads and only retry the atomic
/// swap once the flag reads clear, keeping write traffic off the
/// contended cache line.
pub struct SpinLock<T> {
    held: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the `held` flag hands the wrapped value to one context at a
// time, so sharing the lock is sound whenever moving the value would be.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Wraps `value` in an unlocked lock.
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Takes the lock, spinning for as long as someone else holds it.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Takes the lock only if it is free right now.
    ///
    /// The non-blocking form for contexts that must not spin, such as a
    /// fault handler that may already have interrupted the lock holder.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.held.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinLockGuard { lock: self })
        }
    }
}

/// Exclusive access to the locked value; unlocks on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a live guard means this context holds the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: a live guard means this context holds the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relocks_after_guard_drops() {
        let lock = SpinLock::new(5);
        drop(lock.lock());
        assert_eq!(*lock.lock(), 5);
    }

    #[test]
    fn try_lock_refuses_while_held() {
        let lock = SpinLock::new(());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn writes_through_guard_stick() {
        let lock = SpinLock::new(Vec::new());
        lock.lock().push(1);
        lock.lock().push(2);
        assert_eq!(*lock.lock(), vec![1, 2]);
    }

    #[test]
    fn parallel_increments_are_not_lost() {
        use std::sync::Arc;

        let lock = Arc::new(SpinLock::new(0u32));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
