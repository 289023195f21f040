//! Synchronization primitives shared by the worker pool and the solver.
//!
//! Provides a spinlock for the lowest-latency configuration and a cell type
//! that picks between that spinlock and a standard mutex at construction time,
//! so the rest of the scheduler is written once for both wait styles.

use crate::config::SyncStyle;
use std::cell::UnsafeCell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Spins before a waiting thread starts yielding its time slice.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Busy-wait step: spins at first, then yields to the OS scheduler.
#[inline]
pub fn relax(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

/// Spinlock for short critical sections between worker threads.
///
/// Acquisition busy-waits on an atomic flag. The lock is released when the
/// guard is dropped, including during unwinding, so a panicking holder never
/// leaves it locked.
pub struct SpinLock<T> {
    /// False means unlocked, true means locked.
    lock: AtomicBool,

    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, returning a guard that releases it on drop.
    ///
    /// Spins with a test-and-test-and-set loop so waiters read the flag from
    /// their own cache line until it looks free.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let mut spins = 0;
        loop {
            if self
                .lock
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }
            while self.lock.load(Ordering::Relaxed) {
                relax(&mut spins);
            }
        }
    }

    /// Acquires the lock only if nobody holds it.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }
}

/// Guard that holds a spinlock and releases it on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> std::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> std::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    /// Uses release ordering so writes made under the lock are visible to
    /// the next thread that acquires it.
    fn drop(&mut self) {
        self.lock.lock.store(false, Ordering::Release);
    }
}

/// Shared mutable slot guarded by either a spinlock or a mutex.
///
/// A panic inside a blocking section poisons the mutex; the solver reports
/// that panic separately, so the poison flag is ignored here.
pub enum SyncCell<T> {
    Spin(SpinLock<T>),
    Blocking(Mutex<T>),
}

impl<T> SyncCell<T> {
    pub fn new(style: SyncStyle, data: T) -> Self {
        match style {
            SyncStyle::Spin => SyncCell::Spin(SpinLock::new(data)),
            SyncStyle::Blocking => SyncCell::Blocking(Mutex::new(data)),
        }
    }

    /// Runs `f` with exclusive access to the contents.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        match self {
            SyncCell::Spin(lock) => f(&mut lock.lock()),
            SyncCell::Blocking(mutex) => {
                let mut guard = mutex.lock().unwrap_or_else(|e| e.into_inner());
                f(&mut guard)
            }
        }
    }
}

impl<T: Default> SyncCell<T> {
    /// Moves the contents out, leaving the default behind.
    pub fn take(&self) -> T {
        self.with(std::mem::take)
    }
}
