use core::mem::{align_of, size_of};
use core::ptr::NonNull;

/// A mapped span of memory addressed by byte offset.
///
/// Structures inside a shared segment name each other by offset from the
/// segment base, never by address: each process maps the segment wherever
/// its kernel puts it and resolves offsets through its own `Region`.
///
/// Offsets that arrive from another process are untrusted. Resolve those
/// with [`Region::span`] or [`Region::try_get`], which refuse anything that
/// does not fit. [`Region::offset`] and [`Region::get`] are for offsets this
/// process laid out itself.
#[derive(Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// View `len` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes, aligned to
    /// at least 64 bytes, and stay mapped for as long as any copy of the
    /// view is used.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        debug_assert!(!base.is_null());
        Self {
            base: unsafe { NonNull::new_unchecked(base) },
            len,
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if `[off, off + len)` lies inside the region.
    #[inline]
    pub fn contains(&self, off: usize, len: usize) -> bool {
        off.checked_add(len).is_some_and(|end| end <= self.len)
    }

    /// Local address of `[off, off + len)`, or `None` if any of it falls
    /// outside the region.
    #[inline]
    pub fn span(&self, off: usize, len: usize) -> Option<*mut u8> {
        // One-past-the-end is a valid address only for empty spans.
        if !self.contains(off, len) || (len == 0 && off >= self.len) {
            return None;
        }
        Some(unsafe { self.as_ptr().add(off) })
    }

    /// Local address of byte `off`.
    ///
    /// # Panics
    ///
    /// If `off` is not inside the region.
    #[inline]
    pub fn offset(&self, off: usize) -> *mut u8 {
        match self.span(off, 1) {
            Some(ptr) => ptr,
            None => panic!("offset {off} out of bounds (len={})", self.len),
        }
    }

    /// Whether a `T` placed at `off` would be in bounds and aligned.
    #[inline]
    pub fn fits<T>(&self, off: usize) -> bool {
        self.span(off, size_of::<T>())
            .is_some_and(|ptr| (ptr as usize).is_multiple_of(align_of::<T>()))
    }

    /// The `T` at `off`, or `None` if it would not be in bounds and aligned.
    ///
    /// # Safety
    ///
    /// If the placement checks pass, the bytes there must hold a valid `T`
    /// and nobody may hold a mutable reference to them.
    #[inline]
    pub unsafe fn try_get<T>(&self, off: usize) -> Option<&T> {
        if !self.fits::<T>(off) {
            return None;
        }
        Some(unsafe { &*self.as_ptr().add(off).cast::<T>() })
    }

    /// The `T` at `off`, which this process placed there.
    ///
    /// # Safety
    ///
    /// `off` must be in bounds and aligned for `T`, and the bytes there must
    /// hold a valid `T`.
    #[inline]
    pub unsafe fn get<T>(&self, off: usize) -> &T {
        debug_assert!(self.fits::<T>(off), "misplaced read at {off}");
        unsafe { &*self.as_ptr().add(off).cast::<T>() }
    }

    /// Mutable form of [`Region::get`].
    ///
    /// # Safety
    ///
    /// As for [`Region::get`], and no other reference to those bytes may be
    /// live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, off: usize) -> &mut T {
        debug_assert!(self.fits::<T>(off), "misplaced write at {off}");
        unsafe { &mut *self.as_ptr().add(off).cast::<T>() }
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

#[cfg(any(test, feature = "alloc"))]
mod heap {
    use super::Region;
    use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
    use core::ptr::NonNull;

    /// Zeroed, 64-byte aligned heap memory, for segments whose peers all
    /// live in this process.
    pub struct HeapRegion {
        base: NonNull<u8>,
        layout: Layout,
        len: usize,
    }

    impl HeapRegion {
        pub fn new_zeroed(len: usize) -> Self {
            let layout = match Layout::from_size_align(len.max(1), 64) {
                Ok(layout) => layout,
                Err(_) => panic!("heap region of {len} bytes is too large"),
            };
            let Some(base) = NonNull::new(unsafe { alloc_zeroed(layout) }) else {
                handle_alloc_error(layout)
            };
            Self { base, layout, len }
        }

        #[inline]
        pub fn region(&self) -> Region {
            unsafe { Region::from_raw(self.base.as_ptr(), self.len) }
        }

        #[inline]
        pub fn len(&self) -> usize {
            self.len
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.len == 0
        }
    }

    impl Drop for HeapRegion {
        fn drop(&mut self) {
            unsafe { dealloc(self.base.as_ptr(), self.layout) };
        }
    }

    unsafe impl Send for HeapRegion {}
    unsafe impl Sync for HeapRegion {}
}

#[cfg(any(test, feature = "alloc"))]
pub use heap::HeapRegion;

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn contains_checks_overflow() {
        let heap = HeapRegion::new_zeroed(128);
        let region = heap.region();
        assert!(region.contains(0, 128));
        assert!(!region.contains(1, 128));
        assert!(!region.contains(usize::MAX, 2));
    }

    #[test]
    fn span_refuses_anything_outside() {
        let heap = HeapRegion::new_zeroed(64);
        let region = heap.region();
        let base = region.as_ptr() as usize;
        assert_eq!(region.span(8, 56).map(|p| p as usize), Some(base + 8));
        assert!(region.span(8, 57).is_none());
        assert!(region.span(64, 0).is_none());
        assert!(region.span(usize::MAX, 1).is_none());
    }

    #[test]
    fn try_get_checks_bounds_and_alignment() {
        let heap = HeapRegion::new_zeroed(64);
        let region = heap.region();
        unsafe { *region.get_mut::<u64>(8) = 0xfeed };
        assert_eq!(unsafe { region.try_get::<u64>(8) }, Some(&0xfeed));
        assert!(unsafe { region.try_get::<u64>(4) }.is_none());
        assert!(unsafe { region.try_get::<u64>(60) }.is_none());
        assert!(unsafe { region.try_get::<u8>(63) }.is_some());
        assert!(region.fits::<u32>(60));
        assert!(!region.fits::<u32>(61));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn offset_past_end_panics() {
        let heap = HeapRegion::new_zeroed(16);
        let _ = heap.region().offset(16);
    }
}
