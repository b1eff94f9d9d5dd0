//! Bounded FIFO of fixed-size entries inside a region.
//!
//! Producers and the consumer both hold the owning region's lock while
//! touching the queue, so the indices only need to be atomics for
//! cross-process visibility. The consumer inspects the head in place and
//! removes it separately with [`Cirque::discard`]; an entry the consumer
//! cannot handle yet stays at the head.
//!
//! Entries are written with `ptr::write` and never dropped in place.

use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};

use crate::align_up;
use crate::region::Region;
use crate::sync::{AtomicU64, Ordering};

/// Queue header (64 bytes, cache-line aligned).
#[repr(C, align(64))]
pub struct CirqueHeader {
    /// Capacity in entries (power of 2, immutable after init).
    pub capacity: u32,
    /// `size_of::<T>()` at init, checked on attach.
    pub entry_size: u32,
    /// Next position to consume.
    pub head: AtomicU64,
    /// Next position to fill.
    pub tail: AtomicU64,
    _pad: [u8; 40],
}

#[cfg(not(loom))]
const _: () = assert!(size_of::<CirqueHeader>() == 64);

impl CirqueHeader {
    fn init(&mut self, capacity: u32, entry_size: u32) {
        self.capacity = capacity;
        self.entry_size = entry_size;
        self.head = AtomicU64::new(0);
        self.tail = AtomicU64::new(0);
        self._pad = [0; 40];
    }
}

/// The queue had no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue full")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for QueueFull {}

/// View of a queue inside a region.
pub struct Cirque<T> {
    region: Region,
    header_offset: usize,
    slots_offset: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for Cirque<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region,
            header_offset: self.header_offset,
            slots_offset: self.slots_offset,
            _marker: PhantomData,
        }
    }
}

unsafe impl<T: Send> Send for Cirque<T> {}
unsafe impl<T: Send> Sync for Cirque<T> {}

impl<T> Cirque<T> {
    const fn slots_at(header_offset: usize) -> usize {
        let align = if align_of::<T>() > 64 {
            align_of::<T>()
        } else {
            64
        };
        align_up(header_offset + size_of::<CirqueHeader>(), align)
    }

    /// Bytes needed for `capacity` entries, starting at a 64-byte aligned
    /// offset.
    pub const fn required_size(capacity: u32) -> usize {
        Self::slots_at(0) + capacity as usize * size_of::<T>()
    }

    /// Lay out an empty queue.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during
    /// initialization.
    pub unsafe fn init(region: Region, header_offset: usize, capacity: u32) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be power of 2");
        assert!(
            header_offset.is_multiple_of(64),
            "header_offset must be 64-byte aligned"
        );
        assert!(
            header_offset + Self::required_size(capacity) <= region.len(),
            "region too small for queue"
        );

        let header: &mut CirqueHeader = unsafe { region.get_mut(header_offset) };
        header.init(capacity, size_of::<T>() as u32);
        Self {
            region,
            header_offset,
            slots_offset: Self::slots_at(header_offset),
            _marker: PhantomData,
        }
    }

    /// Attach to a queue another process laid out.
    ///
    /// # Safety
    ///
    /// The region must contain an initialized queue of `T` at
    /// `header_offset`.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, &'static str> {
        if !header_offset.is_multiple_of(64) {
            return Err("header_offset must be 64-byte aligned");
        }
        if !region.contains(header_offset, size_of::<CirqueHeader>()) {
            return Err("region too small for queue header");
        }
        let header: &CirqueHeader = unsafe { region.get(header_offset) };
        if !header.capacity.is_power_of_two() {
            return Err("capacity must be power of 2");
        }
        if header.entry_size as usize != size_of::<T>() {
            return Err("entry size mismatch");
        }
        if !region.contains(header_offset, Self::required_size(header.capacity)) {
            return Err("region too small for queue");
        }
        Ok(Self {
            region,
            header_offset,
            slots_offset: Self::slots_at(header_offset),
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &CirqueHeader {
        unsafe { self.region.get(self.header_offset) }
    }

    #[inline]
    fn mask(&self) -> u64 {
        self.header().capacity as u64 - 1
    }

    /// Region offset of the slot that holds position `pos`.
    #[inline]
    pub fn slot_offset(&self, pos: u64) -> usize {
        self.slots_offset + (pos & self.mask()) as usize * size_of::<T>()
    }

    /// Slot index for a region offset, if the offset is the start of a slot.
    pub fn slot_at(&self, offset: usize) -> Option<u32> {
        let rel = offset.checked_sub(self.slots_offset)?;
        if size_of::<T>() == 0 || !rel.is_multiple_of(size_of::<T>()) {
            return None;
        }
        let index = u32::try_from(rel / size_of::<T>()).ok()?;
        (index < self.capacity()).then_some(index)
    }

    #[inline]
    fn slot(&self, pos: u64) -> *mut T {
        self.region.offset(self.slot_offset(pos)) as *mut T
    }

    /// Append an entry. Returns the position it was written at.
    pub fn push(&self, value: T) -> Result<u64, QueueFull> {
        let header = self.header();
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= header.capacity as u64 {
            return Err(QueueFull);
        }
        unsafe { core::ptr::write(self.slot(tail), value) };
        header.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(tail)
    }

    /// The oldest entry, left in place.
    #[inline]
    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    /// The `n`-th entry counting from the head.
    pub fn get(&self, n: u64) -> Option<&T> {
        let header = self.header();
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        if tail.wrapping_sub(head) <= n {
            return None;
        }
        Some(unsafe { &*self.slot(head.wrapping_add(n)) })
    }

    /// Drop the head entry. Returns `false` if the queue was empty.
    pub fn discard(&self) -> bool {
        let header = self.header();
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        if head == tail {
            return false;
        }
        header.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    #[inline]
    pub fn len(&self) -> u64 {
        let header = self.header();
        let tail = header.tail.load(Ordering::Acquire);
        tail.wrapping_sub(header.head.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.header().capacity as u64
    }

    /// Free slots remaining.
    #[inline]
    pub fn available(&self) -> u64 {
        self.header().capacity as u64 - self.len()
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }
}
