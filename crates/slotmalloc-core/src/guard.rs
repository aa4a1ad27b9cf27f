//! Heap lock.
//!
//! `parking_lot`'s own mutexes park through a global hashtable that is
//! allocated on first contention, which is not usable underneath the process
//! allocator. The heap lock is therefore a spin-then-yield raw mutex plugged
//! into `lock_api::ReentrantMutex`, with `parking_lot::RawThreadId` as the
//! owner token, so nested heap calls on one thread do not deadlock.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RawThreadId;
use parking_lot::lock_api::{self, GuardNoSend, RawMutex};

/// Busy-wait iterations before yielding the CPU.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Non-allocating test-and-test-and-set lock.
pub struct RawSpinLock {
    locked: AtomicBool,
}

// SAFETY: acquire on lock and release on unlock give mutual exclusion.
unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        let mut spins = 0u32;
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Re-entrant heap lock around `T`.
pub type HeapLock<T> = lock_api::ReentrantMutex<RawSpinLock, RawThreadId, T>;

/// Guard returned by [`HeapLock::lock`].
pub type HeapLockGuard<'a, T> = lock_api::ReentrantMutexGuard<'a, RawSpinLock, RawThreadId, T>;

/// Builds a heap lock in a `const` context.
pub const fn heap_lock<T>(value: T) -> HeapLock<T> {
    lock_api::ReentrantMutex::const_new(RawSpinLock::INIT, RawThreadId, value)
}
