//! Spinlock and backoff used for short runtime-internal critical sections
//!
//! Waiters busy-spin with pause hints, then yield, then micro-sleep. With
//! the `deadlock-detection` feature compiled in and
//! [`set_spinlock_deadlock_detection_enabled`](crate::diagnostics::set_spinlock_deadlock_detection_enabled)
//! turned on, an acquisition that has not succeeded after
//! `spinlock_deadlock_detection_limit()` rounds logs and aborts the process.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::diagnostics;

/// Rounds that only spin (1, 2, 4 .. 64 pause hints)
const SPIN_ROUNDS: u32 = 7;
/// Rounds that yield the OS thread after spinning stops
const YIELD_ROUNDS: u32 = 4;

/// Exponential backoff: spin, then yield, then sleep up to `max_sleep`
#[derive(Debug)]
pub struct Backoff {
    round: u32,
    max_sleep: Duration,
}

impl Backoff {
    /// Backoff whose sleeping phase is a fixed 1µs nap
    pub const fn new() -> Self {
        Self { round: 0, max_sleep: Duration::from_micros(1) }
    }

    /// Backoff whose sleeps double from 1µs up to `max_sleep`
    pub const fn with_max_sleep(max_sleep: Duration) -> Self {
        Self { round: 0, max_sleep }
    }

    /// Rounds taken so far
    #[inline]
    pub fn rounds(&self) -> u32 {
        self.round
    }

    pub fn reset(&mut self) {
        self.round = 0;
    }

    /// True while still in the pure spinning phase
    #[inline]
    pub fn is_spinning(&self) -> bool {
        self.round < SPIN_ROUNDS
    }

    /// Wait one round
    pub fn snooze(&mut self) {
        if self.round < SPIN_ROUNDS {
            for _ in 0..(1u32 << self.round) {
                core::hint::spin_loop();
            }
        } else if self.round < SPIN_ROUNDS + YIELD_ROUNDS {
            std::thread::yield_now();
        } else {
            let exp = (self.round - SPIN_ROUNDS - YIELD_ROUNDS).min(20);
            let nap = Duration::from_micros(1u64 << exp).min(self.max_sleep);
            std::thread::sleep(nap);
        }
        self.round = self.round.saturating_add(1);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// A spinlock protecting a `T`
///
/// Meant for short critical sections inside the runtime (queues, tables).
/// Code running inside a task must not hold one across a suspend.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: SpinLock hands out exclusive access to T
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, backing off while it is held elsewhere
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        if let Some(guard) = self.try_lock_weak() {
            return guard;
        }
        self.lock_contended()
    }

    #[cold]
    fn lock_contended(&self) -> SpinLockGuard<'_, T> {
        let detect = diagnostics::spinlock_deadlock_detection_enabled();
        let limit = diagnostics::spinlock_deadlock_detection_limit();
        let mut backoff = Backoff::new();
        let mut attempts = 0usize;
        loop {
            while self.locked.load(Ordering::Relaxed) {
                attempts += 1;
                if detect && attempts > limit {
                    deadlock_detected(self as *const _ as *const u8, attempts);
                }
                backoff.snooze();
            }
            if let Some(guard) = self.try_lock_weak() {
                return guard;
            }
        }
    }

    #[inline]
    fn try_lock_weak(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// Try to acquire the lock without waiting
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

#[cold]
fn deadlock_detected(lock: *const u8, attempts: usize) -> ! {
    crate::kerror!(
        "spinlock {:p}: possible deadlock, not acquired after {} attempts",
        lock,
        attempts
    );
    std::process::abort();
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Releases the spinlock when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
