//! Scatter/gather lists in the local address space.

use crate::proto::RemoteIov;

/// One local buffer. Holds a raw address because receive buffers outlive
/// the call that posted them; whoever builds one vouches for its validity
/// until the operation completes.
#[derive(Debug, Clone, Copy)]
pub struct Iov {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Iov {}
unsafe impl Sync for Iov {}

impl Default for Iov {
    fn default() -> Self {
        Self::empty()
    }
}

impl Iov {
    pub const fn empty() -> Self {
        Self {
            base: std::ptr::null_mut(),
            len: 0,
        }
    }

    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for as long
    /// as any operation using this iov is outstanding.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Describe `buf`. The borrow ends here; using the result after `buf`
    /// is gone is the caller's responsibility.
    pub fn from_mut_slice(buf: &mut [u8]) -> Self {
        Self {
            base: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop the first `n` bytes.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.len);
        self.base = self.base.wrapping_add(n);
        self.len -= n;
    }

    #[inline]
    pub fn to_remote(&self) -> RemoteIov {
        RemoteIov {
            addr: self.base as u64,
            len: self.len as u64,
        }
    }
}

pub fn total_len(iovs: &[Iov]) -> usize {
    iovs.iter().map(Iov::len).sum()
}

/// Scatter `src` across `iovs`; returns bytes copied.
///
/// # Safety
///
/// Every iov must be valid for writes and must not overlap `src`.
pub unsafe fn copy_to_iov(iovs: &[Iov], src: &[u8]) -> usize {
    let mut done = 0;
    for iov in iovs {
        if done == src.len() {
            break;
        }
        let n = iov.len.min(src.len() - done);
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr().add(done), iov.base, n) };
        done += n;
    }
    done
}

/// Gather `iovs` into `dst`; returns bytes copied.
///
/// # Safety
///
/// Every iov must be valid for reads and must not overlap `dst`.
pub unsafe fn copy_from_iov(dst: &mut [u8], iovs: &[Iov]) -> usize {
    let mut done = 0;
    for iov in iovs {
        if done == dst.len() {
            break;
        }
        let n = iov.len.min(dst.len() - done);
        unsafe { std::ptr::copy_nonoverlapping(iov.base, dst.as_mut_ptr().add(done), n) };
        done += n;
    }
    done
}

/// Copy from one list of ranges to another, stopping when either runs out.
///
/// # Safety
///
/// `src` must be valid for reads, `dst` for writes, and they must not
/// overlap.
pub unsafe fn copy_iov_to_iov(dst: &[Iov], src: &[Iov]) -> usize {
    let (mut di, mut doff) = (0, 0);
    let mut done = 0;
    for s in src {
        let mut soff = 0;
        while soff < s.len && di < dst.len() {
            let d = &dst[di];
            let n = (s.len - soff).min(d.len - doff);
            unsafe { std::ptr::copy_nonoverlapping(s.base.add(soff), d.base.add(doff), n) };
            soff += n;
            doff += n;
            done += n;
            if doff == d.len {
                di += 1;
                doff = 0;
            }
        }
    }
    done
}
