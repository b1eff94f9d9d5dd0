#![doc = include_str!("../README.md")]
#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod cirque;
pub mod freestack;
pub mod lock;
pub mod region;
pub mod sync;

#[cfg(feature = "std")]
pub mod mmap;

pub use cirque::{Cirque, CirqueHeader, QueueFull};
pub use freestack::{FreeStack, FreeStackHeader, PoolError};
pub use lock::{ShmLock, ShmLockGuard};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;

#[cfg(feature = "std")]
pub use mmap::{MmapRegion, remove_if_exists};

#[cfg(all(test, loom))]
mod loom_tests;

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}
