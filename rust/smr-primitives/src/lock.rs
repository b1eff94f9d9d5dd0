//! One-word spin lock placed inside a shared region.
//!
//! The lock word is the only synchronization between processes mapping the
//! same region, so the guard is tied to the mapping it was taken through.
//! Callers that already hold their own region's lock must only ever
//! `try_lock` a second region.

use crate::sync::{AtomicU32, Ordering, spin_loop};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

#[repr(C)]
pub struct ShmLock {
    word: AtomicU32,
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<ShmLock>() == 4);

impl ShmLock {
    pub fn init(&mut self) {
        self.word = AtomicU32::new(UNLOCKED);
    }

    /// Take the lock if nobody holds it. Never waits.
    #[inline]
    pub fn try_lock(&self) -> Option<ShmLockGuard<'_>> {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmLockGuard { lock: self })
    }

    /// Spin until the lock is taken.
    pub fn lock(&self) -> ShmLockGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.word.load(Ordering::Relaxed) == LOCKED {
                spin_loop();
            }
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Acquire) == LOCKED
    }
}

/// Releases the lock on drop.
pub struct ShmLockGuard<'a> {
    lock: &'a ShmLock,
}

impl Drop for ShmLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.word.store(UNLOCKED, Ordering::Release);
    }
}
