//! Fixed-size object pool addressed by index, living inside a region.
//!
//! Layout at `header_offset`:
//!
//! ```text
//! [FreeStackHeader: 64][next: u32 * capacity][pad to 64][objects: object_size * capacity]
//! ```
//!
//! Free objects are threaded through `next[]` as a Treiber stack whose head
//! carries a tag in the upper half to defeat ABA. Allocated objects have
//! `next[i] == IN_USE`, which is how a second release of the same index is
//! caught.

use core::fmt;
use core::mem::size_of;

use crate::align_up;
use crate::region::Region;
use crate::sync::{AtomicU32, AtomicU64, Ordering, spin_loop};

/// End of the free list.
const FREE_LIST_END: u32 = u32::MAX;
/// Marker stored in `next[i]` while object `i` is handed out.
const IN_USE: u32 = u32::MAX - 1;

/// Pool header (64 bytes, cache-line aligned).
#[repr(C, align(64))]
pub struct FreeStackHeader {
    pub object_size: u32,
    pub capacity: u32,
    /// Free list head: index (low 32 bits) + tag (high 32 bits).
    pub free_head: AtomicU64,
    pub free_count: AtomicU32,
    _pad: [u8; 44],
}

#[cfg(not(loom))]
const _: () = assert!(size_of::<FreeStackHeader>() == 64);

impl FreeStackHeader {
    fn init(&mut self, capacity: u32, object_size: u32) {
        self.object_size = object_size;
        self.capacity = capacity;
        self.free_head = AtomicU64::new(pack_head(FREE_LIST_END, 0));
        self.free_count = AtomicU32::new(0);
        self._pad = [0; 44];
    }
}

/// Misuse of a pool index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Index is past the end of the pool.
    InvalidIndex(u32),
    /// Index was already free.
    DoubleFree(u32),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidIndex(i) => write!(f, "pool index {i} out of range"),
            PoolError::DoubleFree(i) => write!(f, "pool index {i} released twice"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PoolError {}

/// View of a pool inside a region. Cheap to clone; every clone addresses
/// the same shared header.
#[derive(Clone)]
pub struct FreeStack {
    region: Region,
    header_offset: usize,
    next_offset: usize,
    data_offset: usize,
}

unsafe impl Send for FreeStack {}
unsafe impl Sync for FreeStack {}

impl FreeStack {
    /// Bytes needed for a pool of `capacity` objects of `object_size` bytes,
    /// starting at a 64-byte aligned offset.
    pub const fn required_size(capacity: u32, object_size: u32) -> usize {
        let (_, data) = Self::offsets(0, capacity);
        data + capacity as usize * object_size as usize
    }

    const fn offsets(header_offset: usize, capacity: u32) -> (usize, usize) {
        let next = header_offset + size_of::<FreeStackHeader>();
        let data = align_up(next + capacity as usize * size_of::<u32>(), 64);
        (next, data)
    }

    /// Lay out a fresh pool with every object free.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during
    /// initialization.
    pub unsafe fn init(
        region: Region,
        header_offset: usize,
        capacity: u32,
        object_size: u32,
    ) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!(capacity < IN_USE, "capacity too large");
        assert!(
            header_offset.is_multiple_of(64),
            "header_offset must be 64-byte aligned"
        );
        assert!(
            header_offset + Self::required_size(capacity, object_size) <= region.len(),
            "region too small for pool"
        );

        let (next_offset, data_offset) = Self::offsets(header_offset, capacity);
        let header: &mut FreeStackHeader = unsafe { region.get_mut(header_offset) };
        header.init(capacity, object_size);

        let stack = Self {
            region,
            header_offset,
            next_offset,
            data_offset,
        };
        for i in 0..capacity {
            let next = if i + 1 == capacity {
                FREE_LIST_END
            } else {
                i + 1
            };
            let slot = region.offset(stack.next_slot_offset(i)) as *mut AtomicU32;
            unsafe { core::ptr::write(slot, AtomicU32::new(next)) };
        }
        let header = stack.header();
        header.free_count.store(capacity, Ordering::Relaxed);
        header.free_head.store(pack_head(0, 0), Ordering::Release);
        stack
    }

    /// Attach to a pool another process laid out.
    ///
    /// # Safety
    ///
    /// The region must contain an initialized pool header at `header_offset`.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, &'static str> {
        if !header_offset.is_multiple_of(64) {
            return Err("header_offset must be 64-byte aligned");
        }
        if !region.contains(header_offset, size_of::<FreeStackHeader>()) {
            return Err("region too small for pool header");
        }
        let header: &FreeStackHeader = unsafe { region.get(header_offset) };
        if header.capacity == 0 || header.capacity >= IN_USE {
            return Err("invalid pool capacity");
        }
        let required = Self::required_size(header.capacity, header.object_size);
        if !region.contains(header_offset, required) {
            return Err("region too small for pool");
        }
        let (next_offset, data_offset) = Self::offsets(header_offset, header.capacity);
        Ok(Self {
            region,
            header_offset,
            next_offset,
            data_offset,
        })
    }

    #[inline]
    fn header(&self) -> &FreeStackHeader {
        unsafe { self.region.get(self.header_offset) }
    }

    #[inline]
    fn next_slot_offset(&self, index: u32) -> usize {
        self.next_offset + index as usize * size_of::<u32>()
    }

    #[inline]
    fn next(&self, index: u32) -> &AtomicU32 {
        unsafe { self.region.get(self.next_slot_offset(index)) }
    }

    /// Take a free object. `None` when the pool is exhausted.
    pub fn pop(&self) -> Option<u32> {
        let header = self.header();
        loop {
            let old = header.free_head.load(Ordering::Acquire);
            let (index, tag) = unpack_head(old);
            if index == FREE_LIST_END {
                return None;
            }

            let next = self.next(index).load(Ordering::Acquire);
            let new = pack_head(next, tag.wrapping_add(1));
            match header.free_head.compare_exchange_weak(
                old,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.next(index).store(IN_USE, Ordering::Release);
                    header.free_count.fetch_sub(1, Ordering::AcqRel);
                    return Some(index);
                }
                Err(_) => spin_loop(),
            }
        }
    }

    /// Return an object to the pool.
    pub fn push(&self, index: u32) -> Result<(), PoolError> {
        let header = self.header();
        if index >= header.capacity {
            return Err(PoolError::InvalidIndex(index));
        }
        let next = self.next(index);
        next.compare_exchange(IN_USE, FREE_LIST_END, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PoolError::DoubleFree(index))?;

        loop {
            let old = header.free_head.load(Ordering::Acquire);
            let (head, tag) = unpack_head(old);
            next.store(head, Ordering::Release);
            let new = pack_head(index, tag.wrapping_add(1));
            if header
                .free_head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                header.free_count.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
            spin_loop();
        }
    }

    /// Region offset of object `index`.
    #[inline]
    pub fn object_offset(&self, index: u32) -> usize {
        debug_assert!(index < self.capacity());
        self.data_offset + index as usize * self.object_size() as usize
    }

    /// Index of the object starting at region offset `offset`, if any.
    pub fn index_of(&self, offset: usize) -> Option<u32> {
        let size = self.object_size() as usize;
        let rel = offset.checked_sub(self.data_offset)?;
        if size == 0 || !rel.is_multiple_of(size) {
            return None;
        }
        let index = u32::try_from(rel / size).ok()?;
        (index < self.capacity()).then_some(index)
    }

    /// Local address of object `index`.
    #[inline]
    pub fn object_ptr(&self, index: u32) -> *mut u8 {
        self.region.offset(self.object_offset(index))
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    #[inline]
    pub fn object_size(&self) -> u32 {
        self.header().object_size
    }

    #[inline]
    pub fn free_count(&self) -> u32 {
        self.header().free_count.load(Ordering::Acquire)
    }
}

#[inline]
fn pack_head(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | (index as u64)
}

#[inline]
fn unpack_head(packed: u64) -> (u32, u32) {
    (packed as u32, (packed >> 32) as u32)
}
